//! Span intake
//!
//! A receiver decodes client requests into spans and pushes them into the
//! [`SpanConsumer`] of the pipelines that list it. It answers the client only
//! once the spans are buffered or refused.

pub mod otlp;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::model::MalformedSpan;
use crate::processor::ConsumeError;

pub use otlp::{GrpcSettings, HttpSettings, OtlpReceiver, OtlpReceiverConfig, Protocols};

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not decode request: {0}")]
    Decode(String),

    #[error("all {count} spans are malformed: {first}")]
    Malformed { count: usize, first: MalformedSpan },

    #[error("unsupported content type {0:?}, expected application/x-protobuf or application/json")]
    UnsupportedMediaType(String),

    #[error(transparent)]
    Refused(#[from] ConsumeError),
}

impl ReceiveError {
    /// Whether the client may send the same request again
    pub fn is_retryable(&self) -> bool {
        match self {
            ReceiveError::Refused(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// A span source bound to its listeners
#[async_trait]
pub trait Receiver: Send + Sync {
    fn name(&self) -> &str;

    /// Bind every listener, then serve until `shutdown` turns true. Bind
    /// failures are returned before anything is spawned.
    async fn start(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, ReceiveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(ReceiveError::Refused(ConsumeError::Backpressure).is_retryable());
        assert!(!ReceiveError::Refused(ConsumeError::TooLarge { spans: 10, limit: 5 }).is_retryable());
        assert!(!ReceiveError::Decode("eof".to_string()).is_retryable());
        assert!(!ReceiveError::Malformed {
            count: 2,
            first: MalformedSpan::InvalidTraceId
        }
        .is_retryable());
    }
}
