//! Exporters
//!
//! Trace exporters implement [`SpanExporter`] and are driven by an
//! [`ExportWorker`] that owns their queue, retries and shutdown drain. Each
//! worker is its own task, so a backend that keeps failing only ever delays
//! its own queue. Metrics exporters implement [`MetricsExporter`] and pull
//! from connectors.

pub mod debug;
pub mod exposition;
pub mod otlp_grpc;
pub mod otlp_http;
pub mod prometheus;
pub mod worker;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connector::MetricsSource;
use crate::model::Span;
use crate::pipeline::config::duration_serde;

pub use debug::{DebugConfig, DebugExporter, Verbosity};
pub use otlp_grpc::{OtlpGrpcConfig, OtlpGrpcExporter};
pub use otlp_http::{HttpEncoding, OtlpHttpConfig, OtlpHttpExporter};
pub use prometheus::{PrometheusConfig, PrometheusExporter};
pub use worker::{DrainPhase, ExportWorker, RetryConfig, WorkerSettings};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("backend returned {code:?}: {message}")]
    Grpc { code: tonic::Code, message: String },

    #[error("failed to encode batch: {0}")]
    Encode(String),

    #[error("invalid exporter setup: {0}")]
    Setup(String),
}

impl ExportError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            ExportError::Transport(_) | ExportError::Timeout(_) => true,
            ExportError::Http { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            ExportError::Grpc { code, .. } => matches!(
                code,
                tonic::Code::Unavailable
                    | tonic::Code::DeadlineExceeded
                    | tonic::Code::ResourceExhausted
                    | tonic::Code::Aborted
                    | tonic::Code::Cancelled
                    | tonic::Code::OutOfRange
                    | tonic::Code::DataLoss
            ),
            ExportError::Encode(_) | ExportError::Setup(_) => false,
        }
    }
}

/// Sends one batch to a trace backend. One call is one attempt; retries are
/// the worker's job.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    fn name(&self) -> &str;

    async fn export(&self, spans: &[Span]) -> Result<(), ExportError>;
}

/// Serves or logs samples pulled from metrics sources
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    fn name(&self) -> &str;

    /// Bind and start serving. Fails when the listener cannot be set up.
    async fn start(
        self: Arc<Self>,
        sources: Vec<Arc<dyn MetricsSource>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, ExportError>;
}

/// `tls` block of network exporters
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Plaintext unless the endpoint is `https://`
    #[serde(default = "default_insecure")]
    pub insecure: bool,
}

fn default_insecure() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            insecure: default_insecure(),
        }
    }
}

/// `sending_queue` block
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_queue_size() -> usize {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
        }
    }
}

/// Fields every network trace exporter accepts
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSettings {
    pub endpoint: String,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Per-attempt timeout
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry_on_failure: RetryConfig,
    #[serde(default)]
    pub sending_queue: QueueConfig,
    /// Per-attempt timeout once shutdown has started
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(1)
}

impl NetworkSettings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tls: TlsConfig::default(),
            headers: BTreeMap::new(),
            timeout: default_timeout(),
            retry_on_failure: RetryConfig::default(),
            sending_queue: QueueConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }

    /// TLS when asked for explicitly or implied by the scheme
    pub fn use_tls(&self) -> bool {
        self.endpoint.starts_with("https://") || !self.tls.insecure
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            timeout: self.timeout,
            shutdown_timeout: self.shutdown_timeout,
            retry: self.retry_on_failure.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.trim().is_empty() {
            return Err("endpoint must not be empty".to_string());
        }
        if !self.tls.insecure && self.endpoint.starts_with("http://") {
            return Err(format!(
                "endpoint {:?} is plaintext but tls.insecure is false",
                self.endpoint
            ));
        }
        if self.timeout.is_zero() {
            return Err("timeout must be greater than zero".to_string());
        }
        if self.shutdown_timeout.is_zero() {
            return Err("shutdown_timeout must be greater than zero".to_string());
        }
        if self.sending_queue.queue_size == 0 {
            return Err("sending_queue.queue_size must be greater than zero".to_string());
        }
        self.retry_on_failure.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExportError::Transport("refused".into()).is_retryable());
        assert!(ExportError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ExportError::Http { status: 503, message: String::new() }.is_retryable());
        assert!(ExportError::Http { status: 429, message: String::new() }.is_retryable());
        assert!(!ExportError::Http { status: 400, message: String::new() }.is_retryable());
        assert!(!ExportError::Http { status: 500, message: String::new() }.is_retryable());
        assert!(ExportError::Grpc { code: tonic::Code::Unavailable, message: String::new() }.is_retryable());
        assert!(!ExportError::Grpc { code: tonic::Code::InvalidArgument, message: String::new() }.is_retryable());
        assert!(!ExportError::Encode("bad".into()).is_retryable());
    }

    #[test]
    fn test_network_settings() {
        let settings: NetworkSettings = serde_yaml::from_str(
            "endpoint: http://jaeger:4317\ntimeout: 2s\nretry_on_failure:\n  max_retries: 3\n",
        )
        .unwrap();
        assert!(!settings.use_tls());
        assert_eq!(settings.worker_settings().timeout, Duration::from_secs(2));
        assert_eq!(settings.retry_on_failure.max_retries, 3);
        assert!(settings.validate().is_ok());

        assert!(NetworkSettings::new("https://tempo:4317").use_tls());
        assert!(NetworkSettings::new("").validate().is_err());

        let typo = serde_yaml::from_str::<NetworkSettings>("endpoint: x\nretry: {}\n");
        assert!(typo.is_err());
    }

    #[test]
    fn test_secure_settings_never_fall_back_to_plaintext() {
        let secure: NetworkSettings =
            serde_yaml::from_str("endpoint: tempo:4317\ntls:\n  insecure: false\n").unwrap();
        assert!(secure.use_tls());
        assert!(secure.validate().is_ok());

        let plaintext: NetworkSettings =
            serde_yaml::from_str("endpoint: http://tempo:4317\ntls:\n  insecure: false\n").unwrap();
        assert!(plaintext.validate().unwrap_err().contains("tls.insecure"));

        // the default is plaintext for bare hosts and TLS for https
        assert!(!NetworkSettings::new("tempo:4317").use_tls());
        assert!(NetworkSettings::new("https://tempo:4317").validate().is_ok());
    }
}
