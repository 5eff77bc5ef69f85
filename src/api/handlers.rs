use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::exporter::exposition::{self, CONTENT_TYPE};
use crate::model::{MetricFamily, MetricType, Sample};
use crate::telemetry::{StatsRegistry, StatsSnapshot};

/// Shared application state
pub struct AppState {
    pub stats: Arc<StatsRegistry>,
    pub pipelines: Vec<String>,
    pub started_at: Instant,
    pub started: DateTime<Utc>,
}

impl AppState {
    pub fn new(stats: Arc<StatsRegistry>, pipelines: Vec<String>) -> Self {
        Self {
            stats,
            pipelines,
            started_at: Instant::now(),
            started: Utc::now(),
        }
    }
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub started_at: String,
    pub uptime_secs: u64,
    pub pipelines: Vec<String>,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started.to_rfc3339(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        pipelines: state.pipelines.clone(),
    })
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Serialize)]
pub struct StatsResponse {
    pub components: Vec<StatsSnapshot>,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        components: state.stats.snapshot(),
    })
}

// ============================================================================
// Metrics
// ============================================================================

type Counter = fn(&StatsSnapshot) -> u64;

const COUNTERS: [(&str, &str, Counter); 6] = [
    ("accepted", "Spans admitted by the component", |s| s.accepted),
    ("refused", "Spans turned away with an error to the caller", |s| s.refused),
    ("sent", "Spans delivered downstream", |s| s.sent),
    ("send_failed", "Spans in failed delivery attempts", |s| s.send_failed),
    ("retries", "Delivery retries", |s| s.retries),
    ("batches", "Batches delivered downstream", |s| s.batches),
];

fn labels(snapshot: &StatsSnapshot) -> Vec<(String, String)> {
    vec![
        ("component".to_string(), snapshot.name.clone()),
        ("kind".to_string(), snapshot.kind.as_str().to_string()),
    ]
}

/// The service's own counters as `spanline_<counter>_total`
pub fn self_metrics(snapshots: &[StatsSnapshot]) -> Vec<MetricFamily> {
    let mut families: Vec<MetricFamily> = COUNTERS
        .iter()
        .map(|(name, help, counter)| {
            let metric = format!("spanline_{}_total", name);
            let mut family = MetricFamily::new(&metric, *help, MetricType::Counter);
            for snapshot in snapshots {
                family.push(Sample::new(&metric, labels(snapshot), counter(snapshot) as f64));
            }
            family
        })
        .collect();

    let mut dropped = MetricFamily::new(
        "spanline_dropped_total",
        "Spans dropped without delivery, by reason",
        MetricType::Counter,
    );
    for snapshot in snapshots {
        for (reason, count) in &snapshot.dropped {
            let mut labels = labels(snapshot);
            labels.push(("reason".to_string(), reason.to_string()));
            dropped.push(Sample::new("spanline_dropped_total", labels, *count as f64));
        }
    }
    families.push(dropped);
    families
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let families = self_metrics(&state.stats.snapshot());
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], exposition::render(&families)).into_response()
}
