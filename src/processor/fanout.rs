//! Handoff of flushed batches to downstream consumers

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{ConsumeError, SpanConsumer};
use crate::model::{Batch, SharedBatch, Span};
use crate::telemetry::{ComponentStats, DropReason};

/// One downstream queue: an exporter worker or a connector worker
#[derive(Debug, Clone)]
pub struct Downstream {
    name: String,
    tx: mpsc::Sender<SharedBatch>,
    stats: Arc<ComponentStats>,
}

impl Downstream {
    pub fn new(name: impl Into<String>, tx: mpsc::Sender<SharedBatch>, stats: Arc<ComponentStats>) -> Self {
        Self {
            name: name.into(),
            tx,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Hands every batch to every downstream queue without waiting.
///
/// A full queue drops the batch for that consumer only, so a stalled exporter
/// never holds up its siblings.
#[derive(Debug, Default)]
pub struct Fanout {
    consumers: Vec<Downstream>,
}

impl Fanout {
    pub fn new(consumers: Vec<Downstream>) -> Self {
        Self { consumers }
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Returns how many consumers took the batch
    pub fn dispatch(&self, batch: SharedBatch) -> usize {
        let mut delivered = 0;

        for consumer in &self.consumers {
            match consumer.tx.try_send(Arc::clone(&batch)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(batch)) => consumer.stats.record_drop(
                    DropReason::QueueFull,
                    batch.len(),
                    &format!("sending queue of {} is full", consumer.name),
                ),
                Err(TrySendError::Closed(batch)) => consumer.stats.record_drop(
                    DropReason::Shutdown,
                    batch.len(),
                    &format!("{} has stopped", consumer.name),
                ),
            }
        }

        delivered
    }

    /// All-or-nothing handoff: when any open queue is full no consumer gets
    /// the batch and the caller sees backpressure. Stopped consumers are
    /// counted as shutdown drops. Returns how many consumers took the batch.
    pub fn try_dispatch(&self, batch: SharedBatch) -> Result<usize, ConsumeError> {
        let mut permits = Vec::with_capacity(self.consumers.len());

        for consumer in &self.consumers {
            match consumer.tx.try_reserve() {
                Ok(permit) => permits.push(permit),
                Err(TrySendError::Full(())) => {
                    tracing::debug!(
                        consumer = %consumer.name,
                        spans = batch.len(),
                        "Sending queue full, refusing batch"
                    );
                    return Err(ConsumeError::Backpressure);
                }
                Err(TrySendError::Closed(())) => consumer.stats.record_drop(
                    DropReason::Shutdown,
                    batch.len(),
                    &format!("{} has stopped", consumer.name),
                ),
            }
        }

        let delivered = permits.len();
        for permit in permits {
            permit.send(Arc::clone(&batch));
        }
        Ok(delivered)
    }

    /// Drop every sender so downstream workers see the end of their queue
    pub fn close(&mut self) {
        self.consumers.clear();
    }
}

struct PassthroughState {
    fanout: Fanout,
    next_seq: u64,
}

/// Pipeline stage used when no processor is configured: every request
/// becomes one batch. With no buffer to absorb bursts, a full downstream
/// queue is reported to the caller as backpressure.
pub struct Passthrough {
    state: Mutex<PassthroughState>,
    closed: AtomicBool,
}

impl Passthrough {
    pub fn new(fanout: Fanout) -> Self {
        Self {
            state: Mutex::new(PassthroughState { fanout, next_seq: 0 }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.lock().fanout.close();
    }
}

#[async_trait]
impl SpanConsumer for Passthrough {
    async fn consume(&self, spans: Vec<Span>) -> Result<(), ConsumeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsumeError::ShuttingDown);
        }
        if spans.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();
        // shutdown may have closed the fanout since the check above
        if self.closed.load(Ordering::SeqCst) || state.fanout.is_empty() {
            return Err(ConsumeError::ShuttingDown);
        }
        let batch = Batch::new(state.next_seq, spans).into_shared();
        state.fanout.try_dispatch(batch)?;
        state.next_seq += 1;
        Ok(())
    }
}

/// Feeds one receiver's spans into every pipeline that lists it
pub struct PipelineFanout {
    pipelines: Vec<Arc<dyn SpanConsumer>>,
}

impl PipelineFanout {
    pub fn new(pipelines: Vec<Arc<dyn SpanConsumer>>) -> Self {
        Self { pipelines }
    }
}

#[async_trait]
impl SpanConsumer for PipelineFanout {
    async fn consume(&self, spans: Vec<Span>) -> Result<(), ConsumeError> {
        match self.pipelines.as_slice() {
            [] => Ok(()),
            [only] => only.consume(spans).await,
            [rest @ .., last] => {
                let mut first_error = None;
                for pipeline in rest {
                    if let Err(e) = pipeline.consume(spans.clone()).await {
                        first_error.get_or_insert(e);
                    }
                }
                if let Err(e) = last.consume(spans).await {
                    first_error.get_or_insert(e);
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }
}
