//! Span processing between receivers and exporters
//!
//! Receivers push spans into a [`SpanConsumer`]. In a traces pipeline that is
//! either the [`BatchProcessor`] or, when no processor is configured, a
//! [`Passthrough`] that forwards every request as its own batch. Both end in a
//! [`Fanout`] that hands each flushed batch to every downstream queue.

pub mod batch;
pub mod fanout;

use async_trait::async_trait;

use crate::model::Span;

pub use batch::{BatchConfig, BatchProcessor};
pub use fanout::{Downstream, Fanout, Passthrough, PipelineFanout};

/// Why a pipeline did not take a group of spans
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumeError {
    #[error("pipeline is at capacity, retry later")]
    Backpressure,

    #[error("request of {spans} spans exceeds the in-flight limit of {limit}")]
    TooLarge { spans: usize, limit: usize },

    #[error("pipeline is shutting down")]
    ShuttingDown,
}

impl ConsumeError {
    /// Whether the client should try the same request again
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsumeError::Backpressure | ConsumeError::ShuttingDown)
    }
}

/// Entry point of a pipeline as seen by receivers
#[async_trait]
pub trait SpanConsumer: Send + Sync {
    /// Take ownership of `spans`, in order. Returns once the spans are in the
    /// pipeline's buffer, not once they are exported.
    async fn consume(&self, spans: Vec<Span>) -> Result<(), ConsumeError>;
}
