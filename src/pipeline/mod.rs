//! Pipeline configuration, validation and lifecycle

pub mod config;
pub mod registry;
pub mod service;

pub use config::{
    AdminConfig, ComponentId, Config, ConfigError, PipelineConfig, PipelineId, ServiceConfig,
    ShutdownConfig, Signal, TelemetryConfig,
};
pub use registry::{ConnectorKind, ExporterKind, Factory, Plan, ProcessorKind, ReceiverKind, Registry};
pub use service::{Listener, Service, ServiceError};
