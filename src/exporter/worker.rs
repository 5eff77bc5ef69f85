//! Queue-draining export task with bounded retries

use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use super::{ExportError, SpanExporter};
use crate::model::{Batch, SharedBatch};
use crate::pipeline::config::duration_serde;
use crate::telemetry::{ComponentStats, DropReason};

/// `retry_on_failure`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Delay before the first retry
    #[serde(default = "default_initial_interval", with = "duration_serde")]
    pub initial_interval: Duration,
    /// Cap on the delay between attempts
    #[serde(default = "default_max_interval", with = "duration_serde")]
    pub max_interval: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Retries after the first attempt; the batch is dropped after that
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_initial_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_max_retries() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            initial_interval: default_initial_interval(),
            max_interval: default_max_interval(),
            multiplier: default_multiplier(),
            max_retries: default_max_retries(),
        }
    }
}

impl RetryConfig {
    /// Retries allowed per batch
    pub fn ceiling(&self) -> u32 {
        if self.enabled {
            self.max_retries
        } else {
            0
        }
    }

    /// Delay before retry `retry` (1-based), before jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry - 1).min(i32::MAX as u32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_interval.as_secs_f64();
        Duration::from_secs_f64(secs.min(max))
    }

    /// Backoff scaled by `jitter` (1.0 = none), never above `max_interval`
    pub fn delay_for_retry(&self, retry: u32, jitter: f64) -> Duration {
        self.backoff(retry).mul_f64(jitter).min(self.max_interval)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err("retry_on_failure.multiplier must be at least 1.0".to_string());
        }
        if self.max_interval < self.initial_interval {
            return Err("retry_on_failure.max_interval must not be below initial_interval".to_string());
        }
        Ok(())
    }
}

/// Timeouts and retry policy of one worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub timeout: Duration,
    pub shutdown_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(1),
            retry: RetryConfig::default(),
        }
    }
}

/// Where the service is in its shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPhase {
    Running,
    /// Receivers are closed: finish the queue with short timeouts and no
    /// backoff waits
    Draining,
    /// Drain deadline passed: drop whatever is left
    Abandoned,
}

/// Runs one exporter: takes batches off its queue in order and delivers each
/// before looking at the next.
pub struct ExportWorker {
    exporter: Arc<dyn SpanExporter>,
    settings: WorkerSettings,
    stats: Arc<ComponentStats>,
}

impl ExportWorker {
    pub fn new(exporter: Arc<dyn SpanExporter>, settings: WorkerSettings, stats: Arc<ComponentStats>) -> Self {
        Self {
            exporter,
            settings,
            stats,
        }
    }

    /// Runs until the queue is closed and empty
    pub fn start(
        self,
        mut rx: mpsc::Receiver<SharedBatch>,
        mut phase: watch::Receiver<DrainPhase>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let name = self.exporter.name().to_string();
            tracing::info!(exporter = %name, "Export worker started");

            while let Some(batch) = rx.recv().await {
                if *phase.borrow() == DrainPhase::Abandoned {
                    self.stats.record_drop(
                        DropReason::Shutdown,
                        batch.len(),
                        "drain deadline passed before export",
                    );
                    continue;
                }
                self.stats.record_accepted(batch.len());
                self.deliver(&batch, &mut phase).await;
            }

            tracing::info!(
                exporter = %name,
                sent = self.stats.sent(),
                dropped = self.stats.total_dropped(),
                "Export worker stopped"
            );
        })
    }

    async fn deliver(&self, batch: &Batch, phase: &mut watch::Receiver<DrainPhase>) {
        let spans = batch.len();
        let ceiling = self.settings.retry.ceiling();
        let mut retries = 0u32;

        loop {
            let draining = *phase.borrow() != DrainPhase::Running;
            let timeout = if draining {
                self.settings.timeout.min(self.settings.shutdown_timeout)
            } else {
                self.settings.timeout
            };

            let attempt = time::timeout(timeout, self.exporter.export(batch.spans()));
            let result = tokio::select! {
                result = attempt => match result {
                    Ok(result) => result,
                    Err(_) => Err(ExportError::Timeout(timeout)),
                },
                _ = wait_for(phase, DrainPhase::Abandoned) => {
                    self.stats.record_drop(
                        DropReason::Shutdown,
                        spans,
                        "drain deadline passed during export",
                    );
                    return;
                }
            };

            let error = match result {
                Ok(()) => {
                    self.stats.record_sent(spans);
                    tracing::debug!(
                        exporter = %self.exporter.name(),
                        seq = batch.seq(),
                        spans,
                        retries,
                        "Batch exported"
                    );
                    return;
                }
                Err(e) => e,
            };

            self.stats.record_send_failed(spans);

            if !error.is_retryable() {
                tracing::error!(
                    exporter = %self.exporter.name(),
                    seq = batch.seq(),
                    error = %error,
                    "Export failed permanently"
                );
                self.stats
                    .record_drop(DropReason::PermanentError, spans, &error.to_string());
                return;
            }
            if retries >= ceiling {
                self.stats.record_drop(
                    DropReason::RetriesExhausted,
                    spans,
                    &format!("gave up after {} retries: {}", retries, error),
                );
                return;
            }
            if draining {
                self.stats.record_drop(
                    DropReason::Shutdown,
                    spans,
                    &format!("final attempt during shutdown failed: {}", error),
                );
                return;
            }

            retries += 1;
            self.stats.record_retry();
            let jitter = rand::thread_rng().gen_range(0.8..=1.2);
            let delay = self.settings.retry.delay_for_retry(retries, jitter);
            tracing::warn!(
                exporter = %self.exporter.name(),
                seq = batch.seq(),
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Export failed, retrying"
            );

            // shutdown cuts the wait short and goes straight to a final attempt
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = wait_for(phase, DrainPhase::Draining) => {}
            }
        }
    }
}

/// Resolves once the phase has reached `target` or later. Never resolves if
/// the sender is gone.
async fn wait_for(phase: &mut watch::Receiver<DrainPhase>, target: DrainPhase) {
    let reached = |current: &DrainPhase| match target {
        DrainPhase::Running => true,
        DrainPhase::Draining => *current != DrainPhase::Running,
        DrainPhase::Abandoned => *current == DrainPhase::Abandoned,
    };
    if phase.wait_for(reached).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Span, SpanId, TraceId};
    use crate::telemetry::ComponentKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` attempts with `error`, then succeeds
    struct FlakyExporter {
        failures: u32,
        calls: AtomicU32,
        error: fn() -> ExportError,
        delivered: Mutex<Vec<u64>>,
    }

    impl FlakyExporter {
        fn new(failures: u32, error: fn() -> ExportError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
                error,
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SpanExporter for FlakyExporter {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn export(&self, spans: &[Span]) -> Result<(), ExportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err((self.error)());
            }
            self.delivered
                .lock()
                .extend(spans.iter().map(|s| s.span_id.as_u64()));
            Ok(())
        }
    }

    /// Never answers
    struct HangingExporter;

    #[async_trait]
    impl SpanExporter for HangingExporter {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn export(&self, _spans: &[Span]) -> Result<(), ExportError> {
            std::future::pending().await
        }
    }

    fn unavailable() -> ExportError {
        ExportError::Http {
            status: 503,
            message: "unavailable".to_string(),
        }
    }

    fn bad_request() -> ExportError {
        ExportError::Http {
            status: 400,
            message: "bad request".to_string(),
        }
    }

    fn batch(seq: u64, ids: std::ops::Range<u64>) -> SharedBatch {
        let spans = ids
            .map(|i| Span::new(TraceId::new(1), SpanId::new(i), "op", "svc"))
            .collect();
        Batch::new(seq, spans).into_shared()
    }

    fn settings(max_retries: u32) -> WorkerSettings {
        WorkerSettings {
            timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(100),
            retry: RetryConfig {
                initial_interval: Duration::from_millis(100),
                max_interval: Duration::from_secs(1),
                multiplier: 2.0,
                max_retries,
                ..Default::default()
            },
        }
    }

    fn spawn(
        exporter: Arc<dyn SpanExporter>,
        settings: WorkerSettings,
    ) -> (
        mpsc::Sender<SharedBatch>,
        watch::Sender<DrainPhase>,
        Arc<ComponentStats>,
        JoinHandle<()>,
    ) {
        let stats = Arc::new(ComponentStats::new(ComponentKind::Exporter, "test"));
        let (tx, rx) = mpsc::channel(16);
        let (phase_tx, phase_rx) = watch::channel(DrainPhase::Running);
        let handle = ExportWorker::new(exporter, settings, Arc::clone(&stats)).start(rx, phase_rx);
        (tx, phase_tx, stats, handle)
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let retry = RetryConfig {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(500),
            multiplier: 2.0,
            ..Default::default()
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(4), Duration::from_millis(500));
        assert_eq!(retry.backoff(40), Duration::from_millis(500));
        assert_eq!(retry.delay_for_retry(4, 1.2), Duration::from_millis(500));
        assert_eq!(retry.delay_for_retry(1, 0.8), Duration::from_millis(80));
    }

    #[test]
    fn test_retry_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        let shrinking = RetryConfig {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());

        let disabled: RetryConfig = serde_yaml::from_str("enabled: false\nmax_retries: 9").unwrap();
        assert_eq!(disabled.ceiling(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_k_failures() {
        let exporter = FlakyExporter::new(3, unavailable);
        let (tx, _phase, stats, handle) = spawn(exporter.clone(), settings(5));

        tx.send(batch(0, 1..4)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(exporter.calls.load(Ordering::SeqCst), 4);
        assert_eq!(stats.retries(), 3);
        assert_eq!(stats.sent(), 3);
        assert_eq!(stats.total_dropped(), 0);
        assert_eq!(*exporter.delivered.lock(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_drop_once() {
        let exporter = FlakyExporter::new(u32::MAX, unavailable);
        let (tx, _phase, stats, handle) = spawn(exporter.clone(), settings(2));

        tx.send(batch(0, 1..6)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(exporter.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.retries(), 2);
        assert_eq!(stats.dropped(DropReason::RetriesExhausted), 5);
        assert_eq!(stats.drop_events(), 1);
        assert_eq!(stats.sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let exporter = FlakyExporter::new(1, bad_request);
        let (tx, _phase, stats, handle) = spawn(exporter.clone(), settings(5));

        tx.send(batch(0, 1..3)).await.unwrap();
        tx.send(batch(1, 3..4)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(stats.retries(), 0);
        assert_eq!(stats.dropped(DropReason::PermanentError), 2);
        // the next batch is unaffected
        assert_eq!(*exporter.delivered.lock(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let (tx, _phase, stats, handle) = spawn(Arc::new(HangingExporter), settings(1));

        tx.send(batch(0, 1..3)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(stats.send_failed(), 4);
        assert_eq!(stats.dropped(DropReason::RetriesExhausted), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_exported_in_queue_order() {
        let exporter = FlakyExporter::new(1, unavailable);
        let (tx, _phase, _stats, handle) = spawn(exporter.clone(), settings(5));

        tx.send(batch(0, 1..3)).await.unwrap();
        tx.send(batch(1, 3..5)).await.unwrap();
        tx.send(batch(2, 5..6)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(*exporter.delivered.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cuts_backoff_and_makes_final_attempt() {
        let mut slow = settings(5);
        slow.retry.initial_interval = Duration::from_secs(30);
        slow.retry.max_interval = Duration::from_secs(60);
        let exporter = FlakyExporter::new(1, unavailable);
        let (tx, phase, stats, handle) = spawn(exporter.clone(), slow);

        tx.send(batch(0, 1..3)).await.unwrap();
        // first attempt fails, worker is now waiting ~30s
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(exporter.calls.load(Ordering::SeqCst), 1);

        phase.send(DrainPhase::Draining).unwrap();
        drop(tx);
        time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exporter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(stats.sent(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_final_attempt_is_recorded_as_shutdown_drop() {
        let exporter = FlakyExporter::new(u32::MAX, unavailable);
        let (tx, phase, stats, handle) = spawn(exporter, settings(5));

        phase.send(DrainPhase::Draining).unwrap();
        tx.send(batch(0, 1..4)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(stats.retries(), 0);
        assert_eq!(stats.dropped(DropReason::Shutdown), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_drops_in_flight_and_queued() {
        let (tx, phase, stats, handle) = spawn(Arc::new(HangingExporter), settings(5));

        tx.send(batch(0, 1..3)).await.unwrap();
        tx.send(batch(1, 3..6)).await.unwrap();
        time::sleep(Duration::from_millis(10)).await;

        phase.send(DrainPhase::Abandoned).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(stats.dropped(DropReason::Shutdown), 5);
        assert_eq!(stats.drop_events(), 2);
    }
}
