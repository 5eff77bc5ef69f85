//! Batching processor
//!
//! Spans accumulate in one buffer guarded by a single mutex. A batch is cut
//! when the buffer reaches `send_batch_size`, or when `timeout` has passed
//! since the first span of the current batch arrived. Append and flush both
//! run under the lock, and the handoff to the [`Fanout`] happens there too,
//! so batches leave in sequence order and no append can slip between a swap
//! and its dispatch.
//!
//! Admission is bounded by `max_in_flight_spans`: a call acquires one permit
//! per span before touching the buffer and the permits travel with the batch
//! until the last downstream consumer lets go of it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Instant};

use super::fanout::Fanout;
use super::{ConsumeError, SpanConsumer};
use crate::model::{Batch, Span};
use crate::pipeline::config::duration_serde;
use crate::telemetry::ComponentStats;

/// `processors.batch`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    /// Flush as soon as this many spans are buffered
    #[serde(default = "default_send_batch_size")]
    pub send_batch_size: usize,
    /// Upper bound for one batch; 0 means `send_batch_size`
    #[serde(default)]
    pub send_batch_max_size: usize,
    /// Longest a span waits in the buffer
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,
    /// Spans admitted but not yet released by every downstream consumer
    #[serde(default = "default_max_in_flight_spans")]
    pub max_in_flight_spans: usize,
    /// How long a caller may wait for in-flight room before being refused
    #[serde(default = "default_admission_timeout", with = "duration_serde")]
    pub admission_timeout: Duration,
}

fn default_send_batch_size() -> usize {
    8192
}

fn default_timeout() -> Duration {
    Duration::from_millis(200)
}

fn default_max_in_flight_spans() -> usize {
    65_536
}

fn default_admission_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            send_batch_size: default_send_batch_size(),
            send_batch_max_size: 0,
            timeout: default_timeout(),
            max_in_flight_spans: default_max_in_flight_spans(),
            admission_timeout: default_admission_timeout(),
        }
    }
}

impl BatchConfig {
    pub fn max_batch_size(&self) -> usize {
        if self.send_batch_max_size == 0 {
            self.send_batch_size
        } else {
            self.send_batch_max_size
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.send_batch_size == 0 {
            return Err("send_batch_size must be greater than zero".to_string());
        }
        if self.send_batch_max_size != 0 && self.send_batch_max_size < self.send_batch_size {
            return Err(format!(
                "send_batch_max_size ({}) must be zero or at least send_batch_size ({})",
                self.send_batch_max_size, self.send_batch_size
            ));
        }
        if self.timeout.is_zero() {
            return Err("timeout must be greater than zero".to_string());
        }
        if self.max_in_flight_spans < self.max_batch_size() {
            return Err(format!(
                "max_in_flight_spans ({}) must be at least the batch size ({})",
                self.max_in_flight_spans,
                self.max_batch_size()
            ));
        }
        if self.max_in_flight_spans > u32::MAX as usize {
            return Err("max_in_flight_spans is too large".to_string());
        }
        Ok(())
    }
}

/// Everything the mutex protects
struct Pending {
    spans: Vec<Span>,
    permit: Option<OwnedSemaphorePermit>,
    /// Arrival of the first span of the current batch
    started_at: Option<Instant>,
    next_seq: u64,
    fanout: Fanout,
}

pub struct BatchProcessor {
    name: String,
    config: BatchConfig,
    pending: Mutex<Pending>,
    in_flight: Arc<Semaphore>,
    batch_started: Notify,
    closed: AtomicBool,
    stats: Arc<ComponentStats>,
}

impl BatchProcessor {
    pub fn new(
        name: impl Into<String>,
        config: BatchConfig,
        fanout: Fanout,
        stats: Arc<ComponentStats>,
    ) -> Self {
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight_spans));
        Self {
            name: name.into(),
            config,
            pending: Mutex::new(Pending {
                spans: Vec::new(),
                permit: None,
                started_at: None,
                next_seq: 0,
                fanout,
            }),
            in_flight,
            batch_started: Notify::new(),
            closed: AtomicBool::new(false),
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spans currently buffered
    pub fn pending_len(&self) -> usize {
        self.pending.lock().spans.len()
    }

    /// Spans admitted and not yet released downstream
    pub fn in_flight(&self) -> usize {
        self.config.max_in_flight_spans - self.in_flight.available_permits()
    }

    /// Start the flush timer task
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                processor = %self.name,
                send_batch_size = self.config.send_batch_size,
                timeout = ?self.config.timeout,
                "Batch processor started"
            );

            loop {
                let deadline = self
                    .pending
                    .lock()
                    .started_at
                    .map(|started| started + self.config.timeout);

                match deadline {
                    Some(deadline) => {
                        tokio::select! {
                            _ = time::sleep_until(deadline) => self.flush_if_due(),
                            _ = shutdown.changed() => break,
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = self.batch_started.notified() => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                }
            }

            tracing::debug!(processor = %self.name, "Batch timer stopped");
        })
    }

    /// Flush whatever is buffered and close the downstream queues. Later
    /// calls to `consume` are refused.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let mut pending = self.pending.lock();
        let remaining = pending.spans.len();
        if remaining > 0 {
            self.emit_all(&mut pending);
        }
        pending.fanout.close();

        tracing::info!(
            processor = %self.name,
            final_batch_spans = remaining,
            "Batch processor flushed and closed"
        );
    }

    /// Timer path: flush only if the current batch is old enough. A size
    /// flush may have started a fresh batch since the deadline was computed.
    fn flush_if_due(&self) {
        let mut pending = self.pending.lock();
        let due = pending
            .started_at
            .is_some_and(|started| started.elapsed() >= self.config.timeout);
        if due && !pending.spans.is_empty() {
            self.emit_all(&mut pending);
        }
    }

    fn append(&self, pending: &mut Pending, spans: Vec<Span>, permit: OwnedSemaphorePermit) {
        if pending.spans.is_empty() {
            pending.started_at = Some(Instant::now());
            self.batch_started.notify_one();
        }

        match pending.permit.as_mut() {
            Some(held) => held.merge(permit),
            None => pending.permit = Some(permit),
        }
        pending.spans.extend(spans);

        let max = self.config.max_batch_size();
        let mut flushed = false;
        while pending.spans.len() >= self.config.send_batch_size {
            let take = pending.spans.len().min(max);
            let rest = pending.spans.split_off(take);
            let batch_spans = std::mem::replace(&mut pending.spans, rest);
            let permit = pending.permit.as_mut().and_then(|p| p.split(take));
            self.emit(pending, batch_spans, permit);
            flushed = true;
        }

        if flushed {
            if pending.spans.is_empty() {
                pending.started_at = None;
                pending.permit = None;
            } else {
                pending.started_at = Some(Instant::now());
                self.batch_started.notify_one();
            }
        }
    }

    fn emit_all(&self, pending: &mut Pending) {
        let spans = std::mem::take(&mut pending.spans);
        let permit = pending.permit.take();
        pending.started_at = None;
        self.emit(pending, spans, permit);
    }

    fn emit(&self, pending: &mut Pending, spans: Vec<Span>, permit: Option<OwnedSemaphorePermit>) {
        let seq = pending.next_seq;
        pending.next_seq += 1;

        let count = spans.len();
        let batch = match permit {
            Some(permit) => Batch::with_permit(seq, spans, permit),
            None => Batch::new(seq, spans),
        };

        let delivered = pending.fanout.dispatch(batch.into_shared());
        self.stats.record_sent(count);
        tracing::debug!(
            processor = %self.name,
            seq,
            spans = count,
            consumers = delivered,
            "Batch flushed"
        );
    }
}

#[async_trait]
impl SpanConsumer for BatchProcessor {
    async fn consume(&self, spans: Vec<Span>) -> Result<(), ConsumeError> {
        if spans.is_empty() {
            return Ok(());
        }
        if self.closed.load(Ordering::SeqCst) {
            self.stats.record_refused(spans.len());
            return Err(ConsumeError::ShuttingDown);
        }

        let count = spans.len();
        if count > self.config.max_in_flight_spans {
            self.stats.record_refused(count);
            return Err(ConsumeError::TooLarge {
                spans: count,
                limit: self.config.max_in_flight_spans,
            });
        }

        let acquire = Arc::clone(&self.in_flight).acquire_many_owned(count as u32);
        let permit = match time::timeout(self.config.admission_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                self.stats.record_refused(count);
                return Err(ConsumeError::ShuttingDown);
            }
            Err(_) => {
                self.stats.record_refused(count);
                return Err(ConsumeError::Backpressure);
            }
        };

        let mut pending = self.pending.lock();
        // shutdown may have closed the buffer while we waited for permits
        if self.closed.load(Ordering::SeqCst) {
            self.stats.record_refused(count);
            return Err(ConsumeError::ShuttingDown);
        }
        self.stats.record_accepted(count);
        self.append(&mut pending, spans, permit);
        Ok(())
    }
}
