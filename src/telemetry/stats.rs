//! Per-component counters and drop accounting
//!
//! Every span that enters a pipeline ends up counted as sent by an exporter
//! or dropped with a reason. Drops are logged at the point they are counted.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Receiver,
    Processor,
    Connector,
    Exporter,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Receiver => "receiver",
            ComponentKind::Processor => "processor",
            ComponentKind::Connector => "connector",
            ComponentKind::Exporter => "exporter",
        }
    }
}

/// Why spans left a pipeline without being delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    RetriesExhausted,
    PermanentError,
    QueueFull,
    Shutdown,
    CardinalityLimit,
}

impl DropReason {
    pub const ALL: [DropReason; 5] = [
        DropReason::RetriesExhausted,
        DropReason::PermanentError,
        DropReason::QueueFull,
        DropReason::Shutdown,
        DropReason::CardinalityLimit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::RetriesExhausted => "retries_exhausted",
            DropReason::PermanentError => "permanent_error",
            DropReason::QueueFull => "queue_full",
            DropReason::Shutdown => "shutdown",
            DropReason::CardinalityLimit => "cardinality_limit",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Counters of one component instance
#[derive(Debug)]
pub struct ComponentStats {
    kind: ComponentKind,
    name: String,
    accepted: AtomicU64,
    refused: AtomicU64,
    sent: AtomicU64,
    send_failed: AtomicU64,
    retries: AtomicU64,
    batches: AtomicU64,
    dropped: [AtomicU64; 5],
    drop_events: AtomicU64,
}

impl ComponentStats {
    pub fn new(kind: ComponentKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            accepted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            send_failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            dropped: Default::default(),
            drop_events: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spans admitted by this component
    pub fn record_accepted(&self, spans: usize) {
        self.accepted.fetch_add(spans as u64, Ordering::Relaxed);
    }

    /// Spans turned away at the door; the caller was told
    pub fn record_refused(&self, spans: usize) {
        self.refused.fetch_add(spans as u64, Ordering::Relaxed);
    }

    /// One batch delivered downstream
    pub fn record_sent(&self, spans: usize) {
        self.sent.fetch_add(spans as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    /// One failed delivery attempt
    pub fn record_send_failed(&self, spans: usize) {
        self.send_failed.fetch_add(spans as u64, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count and log spans that will never reach a sink
    pub fn record_drop(&self, reason: DropReason, spans: usize, detail: &str) {
        self.count_drop(reason, spans);
        tracing::warn!(
            component = %self.name,
            kind = self.kind.as_str(),
            reason = reason.as_str(),
            spans,
            "Dropping spans: {}",
            detail
        );
    }

    /// Count without logging, for repeated trips the caller already reported
    pub fn count_drop(&self, reason: DropReason, spans: usize) {
        self.dropped[reason.index()].fetch_add(spans as u64, Ordering::Relaxed);
        self.drop_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn send_failed(&self) -> u64 {
        self.send_failed.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped[reason.index()].load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.iter().map(|d| d.load(Ordering::Relaxed)).sum()
    }

    /// Number of distinct drop decisions (one per batch or guard trip)
    pub fn drop_events(&self) -> u64 {
        self.drop_events.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            name: self.name.clone(),
            kind: self.kind,
            accepted: self.accepted(),
            refused: self.refused(),
            sent: self.sent(),
            send_failed: self.send_failed(),
            retries: self.retries(),
            batches: self.batches(),
            dropped: DropReason::ALL
                .iter()
                .map(|r| (r.as_str(), self.dropped(*r)))
                .filter(|(_, n)| *n > 0)
                .collect(),
        }
    }
}

/// Point-in-time copy of a component's counters
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub name: String,
    pub kind: ComponentKind,
    pub accepted: u64,
    pub refused: u64,
    pub sent: u64,
    pub send_failed: u64,
    pub retries: u64,
    pub batches: u64,
    pub dropped: BTreeMap<&'static str, u64>,
}

impl StatsSnapshot {
    pub fn total_dropped(&self) -> u64 {
        self.dropped.values().sum()
    }
}

/// All component counters of a running service
#[derive(Debug, Default)]
pub struct StatsRegistry {
    components: DashMap<(ComponentKind, String), Arc<ComponentStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the counters for a component
    pub fn register(&self, kind: ComponentKind, name: &str) -> Arc<ComponentStats> {
        self.components
            .entry((kind, name.to_string()))
            .or_insert_with(|| Arc::new(ComponentStats::new(kind, name)))
            .clone()
    }

    pub fn get(&self, kind: ComponentKind, name: &str) -> Option<Arc<ComponentStats>> {
        self.components
            .get(&(kind, name.to_string()))
            .map(|s| Arc::clone(&s))
    }

    /// Snapshots sorted by kind then name
    pub fn snapshot(&self) -> Vec<StatsSnapshot> {
        let mut all: Vec<StatsSnapshot> =
            self.components.iter().map(|e| e.value().snapshot()).collect();
        all.sort_by(|a, b| (a.kind, &a.name).cmp(&(b.kind, &b.name)));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_returns_same_instance() {
        let registry = StatsRegistry::new();
        let a = registry.register(ComponentKind::Exporter, "otlp/jaeger");
        let b = registry.register(ComponentKind::Exporter, "otlp/jaeger");
        a.record_sent(10);
        assert_eq!(b.sent(), 10);
        assert_eq!(b.batches(), 1);
        assert!(registry.get(ComponentKind::Receiver, "otlp/jaeger").is_none());
    }

    #[test]
    fn test_drop_accounting() {
        let stats = ComponentStats::new(ComponentKind::Exporter, "otlp");
        stats.record_drop(DropReason::RetriesExhausted, 5, "backend down");
        stats.record_drop(DropReason::QueueFull, 2, "queue full");

        assert_eq!(stats.dropped(DropReason::RetriesExhausted), 5);
        assert_eq!(stats.total_dropped(), 7);
        assert_eq!(stats.drop_events(), 2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.dropped.get("queue_full"), Some(&2));
        assert!(!snapshot.dropped.contains_key("shutdown"));
        assert_eq!(snapshot.total_dropped(), 7);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let registry = StatsRegistry::new();
        registry.register(ComponentKind::Exporter, "debug");
        registry.register(ComponentKind::Receiver, "otlp");
        registry.register(ComponentKind::Exporter, "a");

        let names: Vec<String> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["otlp", "a", "debug"]);
    }
}
