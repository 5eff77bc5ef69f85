//! Spanline: an OTLP span collector
//!
//! Spans arrive over OTLP/gRPC or OTLP/HTTP, are batched per pipeline and
//! fanned out to trace backends and to a span-metrics connector that derives
//! request, error and duration metrics for a Prometheus-style scrape.
//!
//! # Features
//!
//! - **Receivers**: OTLP over gRPC and HTTP (protobuf or JSON)
//! - **Batching**: size and time triggered flushes with bounded admission
//! - **Span Metrics**: calls, errors and latency histograms per service and operation
//! - **Exporters**: OTLP/gRPC, OTLP/HTTP, debug logging, Prometheus scrape endpoint
//! - **Delivery**: per-exporter queues with retry, backoff and a bounded shutdown drain
//! - **Accounting**: every dropped span is counted with a reason
//!
//! # Example
//!
//! ```no_run
//! use spanline::pipeline::{Config, Service};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("spanline.yaml")?;
//! let service = Service::start(&config).await?;
//! tokio::signal::ctrl_c().await?;
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod connector;
pub mod exporter;
pub mod model;
pub mod pipeline;
pub mod processor;
pub mod receiver;
pub mod telemetry;

// Re-export commonly used types
pub use model::{Batch, Span, SpanId, SpanKind, SpanStatus, TraceId};
pub use pipeline::{Config, ConfigError, Service, ServiceError};
