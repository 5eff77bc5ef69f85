//! Batches handed from the batching processor to downstream consumers

use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

use super::span::Span;

/// An ordered group of spans flushed together.
///
/// Once built, a batch is shared behind an [`Arc`] and only read. When the
/// batch was admitted under an in-flight budget it carries the permits, so
/// the budget is released when the last consumer drops its handle.
#[derive(Debug)]
pub struct Batch {
    seq: u64,
    spans: Vec<Span>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Batch {
    pub fn new(seq: u64, spans: Vec<Span>) -> Self {
        Self {
            seq,
            spans,
            _permit: None,
        }
    }

    pub(crate) fn with_permit(seq: u64, spans: Vec<Span>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            seq,
            spans,
            _permit: Some(permit),
        }
    }

    /// Flush sequence number, increasing per processor
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn into_shared(self) -> SharedBatch {
        Arc::new(self)
    }
}

/// A flushed batch as seen by consumers
pub type SharedBatch = Arc<Batch>;
