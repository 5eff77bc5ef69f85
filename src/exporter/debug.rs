//! Log-only exporter for both signals

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ExportError, MetricsExporter, QueueConfig, SpanExporter};
use crate::connector::MetricsSource;
use crate::model::Span;
use crate::pipeline::config::duration_serde;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// One line per batch
    #[default]
    Basic,
    /// One line per span, with trace and span ids as fields
    Detailed,
}

/// `exporters.debug`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebugConfig {
    #[serde(default)]
    pub verbosity: Verbosity,
    /// How often a metrics pipeline logs its samples
    #[serde(default = "default_interval", with = "duration_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub sending_queue: QueueConfig,
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            verbosity: Verbosity::default(),
            interval: default_interval(),
            sending_queue: QueueConfig::default(),
        }
    }
}

impl DebugConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("interval must be greater than zero".to_string());
        }
        if self.sending_queue.queue_size == 0 {
            return Err("sending_queue.queue_size must be greater than zero".to_string());
        }
        Ok(())
    }
}

pub struct DebugExporter {
    name: String,
    config: DebugConfig,
}

impl DebugExporter {
    pub fn new(name: impl Into<String>, config: DebugConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

#[async_trait]
impl SpanExporter for DebugExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, spans: &[Span]) -> Result<(), ExportError> {
        let errors = spans.iter().filter(|s| s.status.is_error()).count();
        tracing::info!(
            exporter = %self.name,
            spans = spans.len(),
            errors,
            "Traces"
        );

        if self.config.verbosity == Verbosity::Detailed {
            for span in spans {
                tracing::info!(
                    trace_id = %span.trace_id,
                    span_id = %span.span_id,
                    "resource.service.name" = %span.service_name,
                    kind = span.kind.as_str(),
                    status = span.status.as_str(),
                    duration_ms = span.duration_ms(),
                    "{}",
                    span.name
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsExporter for DebugExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        self: Arc<Self>,
        sources: Vec<Arc<dyn MetricsSource>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, ExportError> {
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.log_samples(&sources),
                    _ = shutdown.changed() => break,
                }
            }
        }))
    }
}

impl DebugExporter {
    fn log_samples(&self, sources: &[Arc<dyn MetricsSource>]) {
        for source in sources {
            let families = source.collect();
            let samples: usize = families.iter().map(|f| f.samples.len()).sum();
            tracing::info!(exporter = %self.name, source = source.name(), samples, "Metrics");

            if self.config.verbosity == Verbosity::Detailed {
                for family in &families {
                    for sample in &family.samples {
                        tracing::info!(labels = ?sample.labels, value = sample.value, "{}", sample.name);
                    }
                }
            }
        }
    }
}
