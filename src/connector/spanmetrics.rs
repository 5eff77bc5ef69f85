//! RED metrics from spans
//!
//! Every span of every batch lands in one series keyed by service, span
//! name, status, kind and the allow-listed dimensions. Series live in a
//! sharded map, so aggregation only locks the shard of the key it touches,
//! and scrapes read through [`SpanMetricsConnector::collect`].

use dashmap::DashMap;
use fxhash::FxBuildHasher;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::histogram::Histogram;
use super::MetricsSource;
use crate::model::{MetricFamily, MetricType, Sample, SharedBatch, Span};
use crate::pipeline::config::duration_serde;
use crate::telemetry::{ComponentStats, DropReason};

/// Attribute keys that identify a single request and would explode the series
/// count
pub const PER_REQUEST_KEYS: &[&str] = &[
    "trace_id",
    "span_id",
    "parent_span_id",
    "trace.id",
    "span.id",
    "traceId",
    "spanId",
];

/// Labels every series carries, plus the histogram bucket label
const RESERVED_LABELS: &[&str] = &["service_name", "span_name", "status_code", "span_kind", "le"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temporality {
    #[default]
    Cumulative,
    /// Every collect starts a new aggregation window
    Delta,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimension {
    pub name: String,
    /// Label value when the span lacks the attribute; without one the label
    /// is left out
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistogramConfig {
    #[serde(
        default = "default_buckets",
        deserialize_with = "duration_serde::list::deserialize"
    )]
    pub buckets: Vec<Duration>,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            buckets: default_buckets(),
        }
    }
}

fn default_buckets() -> Vec<Duration> {
    [
        2, 4, 6, 8, 10, 50, 100, 200, 400, 800, 1000, 1400, 2000, 5000, 10_000, 15_000,
    ]
    .into_iter()
    .map(Duration::from_millis)
    .collect()
}

/// `connectors.spanmetrics`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpanMetricsConfig {
    #[serde(default)]
    pub histogram: HistogramConfig,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default = "default_max_cardinality")]
    pub max_cardinality: usize,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub aggregation_temporality: Temporality,
    /// Queue between the traces pipelines and the aggregation task
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_max_cardinality() -> usize {
    10_000
}

fn default_namespace() -> String {
    "traces_span_metrics".to_string()
}

fn default_queue_size() -> usize {
    1000
}

impl Default for SpanMetricsConfig {
    fn default() -> Self {
        Self {
            histogram: HistogramConfig::default(),
            dimensions: Vec::new(),
            max_cardinality: default_max_cardinality(),
            namespace: default_namespace(),
            aggregation_temporality: Temporality::default(),
            queue_size: default_queue_size(),
        }
    }
}

impl SpanMetricsConfig {
    pub fn validate(&self) -> Result<(), String> {
        for dim in &self.dimensions {
            if dim.name.is_empty() {
                return Err("dimension name must not be empty".to_string());
            }
            if PER_REQUEST_KEYS.contains(&dim.name.as_str()) {
                return Err(format!(
                    "dimension {:?} identifies a single request and cannot be a metric label",
                    dim.name
                ));
            }
        }
        let mut labels: Vec<String> = RESERVED_LABELS.iter().map(|l| l.to_string()).collect();
        for dim in &self.dimensions {
            let label = sanitize_label_name(&dim.name);
            if labels.contains(&label) {
                return Err(format!(
                    "dimension {:?} maps to label {:?}, which is already in use",
                    dim.name, label
                ));
            }
            labels.push(label);
        }
        if self.histogram.buckets.is_empty() {
            return Err("histogram.buckets must not be empty".to_string());
        }
        if self.histogram.buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err("histogram.buckets must be strictly increasing".to_string());
        }
        if self.max_cardinality == 0 {
            return Err("max_cardinality must be greater than zero".to_string());
        }
        if self.queue_size == 0 {
            return Err("queue_size must be greater than zero".to_string());
        }
        let valid_namespace = self
            .namespace
            .chars()
            .enumerate()
            .all(|(i, c)| c.is_ascii_alphabetic() || c == '_' || (i > 0 && c.is_ascii_digit()));
        if self.namespace.is_empty() || !valid_namespace {
            return Err(format!("namespace {:?} is not a valid metric name prefix", self.namespace));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SeriesKey {
    service: String,
    span_name: String,
    status: &'static str,
    kind: &'static str,
    dimensions: Vec<Option<String>>,
}

#[derive(Debug, Clone)]
struct Series {
    calls: u64,
    errors: u64,
    duration: Histogram,
}

pub struct SpanMetricsConnector {
    name: String,
    config: SpanMetricsConfig,
    bounds_ms: Arc<[f64]>,
    series: DashMap<SeriesKey, Series, FxBuildHasher>,
    guard_tripped: AtomicBool,
    stats: Arc<ComponentStats>,
}

impl SpanMetricsConnector {
    pub fn new(name: impl Into<String>, config: SpanMetricsConfig, stats: Arc<ComponentStats>) -> Self {
        let bounds_ms: Arc<[f64]> = config
            .histogram
            .buckets
            .iter()
            .map(|b| b.as_secs_f64() * 1000.0)
            .collect();
        Self {
            name: name.into(),
            config,
            bounds_ms,
            series: DashMap::with_hasher(FxBuildHasher::default()),
            guard_tripped: AtomicBool::new(false),
            stats,
        }
    }

    pub fn config(&self) -> &SpanMetricsConfig {
        &self.config
    }

    /// Number of live series
    pub fn cardinality(&self) -> usize {
        self.series.len()
    }

    /// Aggregate batches until every sender is gone
    pub fn start(self: Arc<Self>, mut rx: mpsc::Receiver<SharedBatch>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(connector = %self.name, "Span metrics connector started");
            while let Some(batch) = rx.recv().await {
                self.aggregate(batch.spans());
            }
            tracing::info!(
                connector = %self.name,
                series = self.cardinality(),
                "Span metrics connector stopped"
            );
        })
    }

    pub fn aggregate(&self, spans: &[Span]) {
        self.stats.record_accepted(spans.len());

        let mut excluded = 0usize;
        for span in spans {
            if !self.observe(span) {
                excluded += 1;
            }
        }

        self.stats.record_sent(spans.len() - excluded);
        if excluded > 0 {
            if self.guard_tripped.swap(true, Ordering::Relaxed) {
                self.stats.count_drop(DropReason::CardinalityLimit, excluded);
            } else {
                self.stats.record_drop(
                    DropReason::CardinalityLimit,
                    excluded,
                    &format!(
                        "{} series reached max_cardinality {}",
                        self.name, self.config.max_cardinality
                    ),
                );
            }
        }
    }

    /// False when the span would open a series beyond the cardinality limit
    fn observe(&self, span: &Span) -> bool {
        let key = self.key_for(span);
        let duration_ms = span.duration_ms();
        let is_error = span.status.is_error();

        if let Some(mut series) = self.series.get_mut(&key) {
            series.record(duration_ms, is_error);
            return true;
        }
        if self.series.len() >= self.config.max_cardinality {
            return false;
        }

        self.series
            .entry(key)
            .or_insert_with(|| Series {
                calls: 0,
                errors: 0,
                duration: Histogram::new(Arc::clone(&self.bounds_ms)),
            })
            .record(duration_ms, is_error);
        true
    }

    fn key_for(&self, span: &Span) -> SeriesKey {
        let dimensions = self
            .config
            .dimensions
            .iter()
            .map(|dim| match span.attribute(&dim.name) {
                Some(value) => Some(value.to_string()),
                None => dim.default.clone(),
            })
            .collect();

        SeriesKey {
            service: span.service_name.clone(),
            span_name: span.name.clone(),
            status: span.status.as_str(),
            kind: span.kind.as_str(),
            dimensions,
        }
    }

    fn labels(&self, key: &SeriesKey) -> Vec<(String, String)> {
        let mut labels = vec![
            ("service_name".to_string(), key.service.clone()),
            ("span_name".to_string(), key.span_name.clone()),
            ("status_code".to_string(), key.status.to_string()),
            ("span_kind".to_string(), key.kind.to_string()),
        ];
        for (dim, value) in self.config.dimensions.iter().zip(&key.dimensions) {
            if let Some(value) = value {
                labels.push((sanitize_label_name(&dim.name), value.clone()));
            }
        }
        labels
    }

    /// Copy of the current aggregates. With delta temporality the copied
    /// series are removed, so the next collect starts from zero.
    fn snapshot(&self) -> Vec<(SeriesKey, Series)> {
        let mut series: Vec<(SeriesKey, Series)> = match self.config.aggregation_temporality {
            Temporality::Cumulative => self
                .series
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            Temporality::Delta => {
                let keys: Vec<SeriesKey> = self.series.iter().map(|e| e.key().clone()).collect();
                keys.into_iter()
                    .filter_map(|key| self.series.remove(&key))
                    .collect()
            }
        };
        series.sort_by(|a, b| a.0.cmp(&b.0));
        series
    }
}

impl Series {
    fn record(&mut self, duration_ms: f64, is_error: bool) {
        self.calls += 1;
        if is_error {
            self.errors += 1;
        }
        self.duration.observe(duration_ms);
    }
}

impl MetricsSource for SpanMetricsConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.guard_tripped.store(false, Ordering::Relaxed);

        let ns = &self.config.namespace;
        let mut calls = MetricFamily::new(
            format!("{}_calls_total", ns),
            "Number of spans per service, operation and status",
            MetricType::Counter,
        );
        let mut errors = MetricFamily::new(
            format!("{}_errors_total", ns),
            "Number of spans with error status",
            MetricType::Counter,
        );
        let duration_name = format!("{}_duration_milliseconds", ns);
        let mut duration = MetricFamily::new(
            duration_name.clone(),
            "Span duration in milliseconds",
            MetricType::Histogram,
        );

        for (key, series) in self.snapshot() {
            let labels = self.labels(&key);

            calls.push(Sample::new(calls.name.clone(), labels.clone(), series.calls as f64));
            if series.errors > 0 {
                errors.push(Sample::new(errors.name.clone(), labels.clone(), series.errors as f64));
            }

            let bounds = series.duration.bounds();
            for (i, total) in series.duration.cumulative().into_iter().enumerate() {
                let le = match bounds.get(i) {
                    Some(bound) => format_bound(*bound),
                    None => "+Inf".to_string(),
                };
                let mut bucket_labels = labels.clone();
                bucket_labels.push(("le".to_string(), le));
                duration.push(Sample::new(
                    format!("{}_bucket", duration_name),
                    bucket_labels,
                    total as f64,
                ));
            }
            duration.push(Sample::new(
                format!("{}_sum", duration_name),
                labels.clone(),
                series.duration.sum(),
            ));
            duration.push(Sample::new(
                format!("{}_count", duration_name),
                labels,
                series.duration.count() as f64,
            ));
        }

        vec![calls, errors, duration]
    }
}

fn format_bound(bound: f64) -> String {
    if bound.fract() == 0.0 {
        format!("{}", bound as u64)
    } else {
        format!("{}", bound)
    }
}

/// `http.method` -> `http_method`
fn sanitize_label_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}
