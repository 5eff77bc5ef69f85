//! Load generator: posts OTLP/JSON traces shaped like a small three-service
//! web application (`app-a`, `app-b`, `app-c`).
//!
//! Environment variables:
//! - SPANGEN_ENDPOINT: Collector OTLP/HTTP base URL (default: http://localhost:4318)
//! - SPANGEN_TRACES: Number of traces to send (default: 1000)
//! - SPANGEN_CONCURRENCY: Parallel senders (default: 4)

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use reqwest::Client;
use spanline::model::{encode_request, otlp_json};
use spanline::{Span, SpanId, SpanKind, SpanStatus, TraceId};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const SERVICES: &[&str] = &["app-a", "app-b", "app-c"];
const ROUTES: &[&str] = &[
    "/",
    "/items/{item_id}",
    "/io_task",
    "/cpu_task",
    "/random_status",
    "/random_sleep",
    "/error_test",
    "/chain",
];
const RANDOM_STATUSES: &[i64] = &[200, 200, 300, 400, 500];
const SCOPE: &str = "opentelemetry.instrumentation.fastapi";

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

fn span_id(rng: &mut StdRng) -> SpanId {
    SpanId::new(rng.gen::<u64>() | 1)
}

#[allow(clippy::too_many_arguments)]
fn server_span(
    rng: &mut StdRng,
    trace_id: TraceId,
    parent: Option<SpanId>,
    service: &str,
    route: &str,
    target: &str,
    status_code: i64,
    start: u64,
    duration: Duration,
) -> Span {
    let mut span = Span::new(trace_id, span_id(rng), format!("GET {}", route), service)
        .with_kind(SpanKind::Server)
        .with_start(start)
        .with_duration(duration)
        .with_attribute("http.method", "GET")
        .with_attribute("http.route", route)
        .with_attribute("http.target", target)
        .with_attribute("http.status_code", status_code);
    span.scope_name = SCOPE.to_string();
    if status_code >= 500 {
        span = span.with_status(SpanStatus::Error);
    }
    match parent {
        Some(parent) => span.with_parent(parent),
        None => span,
    }
}

fn client_span(rng: &mut StdRng, trace_id: TraceId, parent: SpanId, service: &str, url: &str, start: u64, duration: Duration) -> Span {
    Span::new(trace_id, span_id(rng), "HTTP GET", service)
        .with_parent(parent)
        .with_kind(SpanKind::Client)
        .with_start(start)
        .with_duration(duration)
        .with_attribute("http.method", "GET")
        .with_attribute("http.url", url)
        .with_attribute("http.status_code", 200i64)
}

fn millis(rng: &mut StdRng, low: u64, high: u64) -> Duration {
    Duration::from_millis(rng.gen_range(low..=high))
}

/// One request to one route, with every span it produces
fn build_trace(rng: &mut StdRng) -> Vec<Span> {
    let trace_id = TraceId::new(rng.gen::<u128>() | 1);
    let start = now_nanos();
    let route = *ROUTES.choose(rng).unwrap_or(&"/");
    let service = *SERVICES.choose(rng).unwrap_or(&"app-a");

    match route {
        "/items/{item_id}" => {
            let target = format!("/items/{}", rng.gen_range(1..1000));
            let duration = millis(rng, 1, 5);
            vec![server_span(rng, trace_id, None, service, route, &target, 200, start, duration)]
        }
        "/io_task" => {
            let duration = millis(rng, 1000, 1010);
            vec![server_span(rng, trace_id, None, service, route, route, 200, start, duration)]
        }
        "/cpu_task" => {
            let duration = millis(rng, 1, 20);
            vec![server_span(rng, trace_id, None, service, route, route, 200, start, duration)]
        }
        "/random_status" => {
            let status = *RANDOM_STATUSES.choose(rng).unwrap_or(&200);
            let duration = millis(rng, 1, 5);
            vec![server_span(rng, trace_id, None, service, route, route, status, start, duration)]
        }
        "/random_sleep" => {
            let duration = Duration::from_secs(rng.gen_range(0..=5)) + millis(rng, 1, 3);
            vec![server_span(rng, trace_id, None, service, route, route, 200, start, duration)]
        }
        "/error_test" => {
            let duration = millis(rng, 1, 5);
            let mut span = server_span(rng, trace_id, None, service, route, route, 500, start, duration);
            span.status_message = "ValueError: value error".to_string();
            vec![span]
        }
        "/chain" => build_chain(rng, trace_id, start),
        _ => {
            let duration = millis(rng, 1, 5);
            vec![server_span(rng, trace_id, None, service, "/", "/", 200, start, duration)]
        }
    }
}

/// `app-a /chain` calls itself, then `app-b /io_task`, then `app-c /cpu_task`
fn build_chain(rng: &mut StdRng, trace_id: TraceId, start: u64) -> Vec<Span> {
    let hops: [(&str, &str, Duration); 3] = [
        ("app-a", "/", millis(rng, 1, 5)),
        ("app-b", "/io_task", millis(rng, 1000, 1010)),
        ("app-c", "/cpu_task", millis(rng, 1, 20)),
    ];
    let network = Duration::from_millis(2);

    let root_id = span_id(rng);
    let mut spans = Vec::with_capacity(1 + 2 * hops.len());
    let mut cursor = start + 1_000_000;

    for (service, route, duration) in hops {
        let call = duration + network;
        let client = client_span(
            rng,
            trace_id,
            root_id,
            "app-a",
            &format!("http://{}:8000{}", service, route),
            cursor,
            call,
        );
        let server = server_span(
            rng,
            trace_id,
            Some(client.span_id),
            service,
            route,
            route,
            200,
            cursor + 1_000_000,
            duration,
        );
        cursor += call.as_nanos() as u64;
        spans.push(client);
        spans.push(server);
    }

    let total = Duration::from_nanos(cursor - start) + Duration::from_millis(1);
    let mut root = server_span(rng, trace_id, None, "app-a", "/chain", "/chain", 200, start, total);
    root.span_id = root_id;
    spans.insert(0, root);
    spans
}

#[derive(Default)]
struct RunStats {
    traces: usize,
    spans: usize,
    rejected: usize,
    latencies: Vec<Duration>,
}

impl RunStats {
    fn merge(&mut self, other: RunStats) {
        self.traces += other.traces;
        self.spans += other.spans;
        self.rejected += other.rejected;
        self.latencies.extend(other.latencies);
    }

    fn percentile(&self, p: usize) -> Duration {
        let mut sorted = self.latencies.clone();
        sorted.sort();
        sorted
            .get(sorted.len() * p / 100)
            .or_else(|| sorted.last())
            .copied()
            .unwrap_or_default()
    }
}

async fn run_sender(client: Client, url: String, traces: usize) -> Result<RunStats, reqwest::Error> {
    let mut rng = StdRng::from_entropy();
    let mut stats = RunStats::default();

    for _ in 0..traces {
        let spans = build_trace(&mut rng);
        let body = otlp_json::ExportTraceServiceRequest::from(&encode_request(&spans));

        let started = Instant::now();
        let response = client.post(&url).json(&body).send().await?;
        stats.latencies.push(started.elapsed());

        stats.traces += 1;
        stats.spans += spans.len();
        if !response.status().is_success() {
            stats.rejected += 1;
            eprintln!("Rejected ({}): {}", response.status(), response.text().await?);
        }
    }

    Ok(stats)
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = std::env::var("SPANGEN_ENDPOINT").unwrap_or_else(|_| "http://localhost:4318".to_string());
    let traces: usize = env_or("SPANGEN_TRACES", 1000);
    let concurrency: usize = env_or("SPANGEN_CONCURRENCY", 4).max(1);
    let url = format!("{}/v1/traces", endpoint.trim_end_matches('/'));

    println!("Spanline Load Generator");
    println!("=======================");
    println!("Target:       {}", url);
    println!("Traces:       {}", traces);
    println!("Concurrency:  {}", concurrency);
    println!();

    let client = Client::new();
    let start = Instant::now();

    let senders: Vec<_> = (0..concurrency)
        .map(|i| {
            let share = traces / concurrency + usize::from(i < traces % concurrency);
            tokio::spawn(run_sender(client.clone(), url.clone(), share))
        })
        .collect();

    let mut stats = RunStats::default();
    for sender in senders {
        stats.merge(sender.await??);
    }
    let elapsed = start.elapsed();

    println!("Sent {} traces ({} spans) in {:?}", stats.traces, stats.spans, elapsed);
    println!("  Traces/sec:  {:.0}", stats.traces as f64 / elapsed.as_secs_f64());
    println!("  Rejected:    {}", stats.rejected);
    println!(
        "  Latency:     p50={:?} p99={:?} max={:?}",
        stats.percentile(50),
        stats.percentile(99),
        stats.latencies.iter().max().copied().unwrap_or_default()
    );

    Ok(())
}
