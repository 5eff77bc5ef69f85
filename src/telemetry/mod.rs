//! Self-observability: logging setup and per-component counters

pub mod logging;
pub mod stats;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use stats::{ComponentKind, ComponentStats, DropReason, StatsRegistry, StatsSnapshot};
