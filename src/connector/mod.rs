//! Connectors bridge a traces pipeline into a metrics pipeline
//!
//! On the traces side a connector is a downstream consumer like any exporter:
//! it owns a bounded queue fed by the processors' fan-out. On the metrics side
//! it is a [`MetricsSource`] that pull exporters collect from.

mod histogram;
pub mod spanmetrics;

use crate::model::MetricFamily;

pub use histogram::Histogram;
pub use spanmetrics::{Dimension, SpanMetricsConfig, SpanMetricsConnector, Temporality};

/// Something a metrics exporter can scrape
pub trait MetricsSource: Send + Sync {
    fn name(&self) -> &str;

    /// Current samples. Sources with delta temporality start a new window.
    fn collect(&self) -> Vec<MetricFamily>;
}
