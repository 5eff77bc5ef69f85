//! End to end: OTLP/HTTP in, batched spans out to a trace backend and
//! span metrics on the Prometheus scrape endpoint.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use opentelemetry_proto::tonic::collector::trace::v1::{ExportTraceServiceRequest, ExportTraceServiceResponse};
use parking_lot::Mutex;
use prost::Message;
use spanline::model::{decode_request, encode_request, otlp_json};
use spanline::pipeline::{Config, Service};
use spanline::telemetry::ComponentKind;
use spanline::{Span, SpanId, SpanKind, SpanStatus, TraceId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Backend {
    received: Arc<Mutex<Vec<Span>>>,
}

async fn accept_traces(State(backend): State<Backend>, body: Bytes) -> impl IntoResponse {
    if let Ok(request) = ExportTraceServiceRequest::decode(body) {
        backend.received.lock().extend(decode_request(request).spans);
    }
    (
        [(header::CONTENT_TYPE, "application/x-protobuf")],
        ExportTraceServiceResponse::default().encode_to_vec(),
    )
}

async fn start_backend() -> (SocketAddr, Backend) {
    let backend = Backend::default();
    let app = Router::new()
        .route("/v1/traces", post(accept_traces))
        .with_state(backend.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, backend)
}

fn collector_config(backend: SocketAddr) -> Config {
    Config::parse(&format!(
        r#"
receivers:
  otlp:
    protocols:
      http: {{ endpoint: "127.0.0.1:0" }}
      grpc: {{ endpoint: "127.0.0.1:0" }}
processors:
  batch:
    send_batch_size: 100
    timeout: 200ms
connectors:
  spanmetrics:
    histogram:
      buckets: [10ms, 100ms, 1s]
exporters:
  otlphttp/backend:
    endpoint: "http://{backend}"
  prometheus:
    endpoint: "127.0.0.1:0"
service:
  telemetry:
    admin: {{ endpoint: "127.0.0.1:0" }}
  pipelines:
    traces:
      receivers: [otlp]
      processors: [batch]
      exporters: [otlphttp/backend, spanmetrics]
    metrics:
      receivers: [spanmetrics]
      exporters: [prometheus]
"#
    ))
    .unwrap()
}

fn chain_trace() -> Vec<Span> {
    let trace = TraceId::new(0xabc);
    let root = Span::new(trace, SpanId::new(1), "GET /chain", "app-a")
        .with_kind(SpanKind::Server)
        .with_duration(Duration::from_millis(1020));
    let io = Span::new(trace, SpanId::new(2), "GET /io_task", "app-b")
        .with_parent(SpanId::new(1))
        .with_kind(SpanKind::Server)
        .with_duration(Duration::from_millis(1005));
    let failed = Span::new(trace, SpanId::new(3), "GET /error_test", "app-c")
        .with_parent(SpanId::new(1))
        .with_kind(SpanKind::Server)
        .with_status(SpanStatus::Error)
        .with_duration(Duration::from_millis(3));
    vec![root, io, failed]
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met within 5s");
}

async fn scrape(addr: SocketAddr) -> String {
    reqwest::get(format!("http://{}/metrics", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_spans_reach_backend_and_metrics() {
    let (backend_addr, backend) = start_backend().await;
    let service = Service::start(&collector_config(backend_addr)).await.unwrap();

    let http = service.listener("otlp", "http").unwrap();
    let prometheus = service.listener("prometheus", "http").unwrap();
    let admin = service.listener("admin", "http").unwrap();
    assert!(service.listener("otlp", "grpc").is_some());

    let json = otlp_json::ExportTraceServiceRequest::from(&encode_request(&chain_trace()));
    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/traces", http))
        .json(&json)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()[reqwest::header::CONTENT_TYPE],
        "application/json"
    );

    wait_for(|| backend.received.lock().len() == 3).await;
    {
        let received = backend.received.lock();
        assert!(received.iter().all(|s| s.trace_id == TraceId::new(0xabc)));
        let failed = received.iter().find(|s| s.name == "GET /error_test").unwrap();
        assert_eq!(failed.service_name, "app-c");
        assert_eq!(failed.status, SpanStatus::Error);
    }

    let mut body = String::new();
    for _ in 0..100 {
        body = scrape(prometheus).await;
        if body.contains("traces_span_metrics_errors_total") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(body.contains("# TYPE traces_span_metrics_calls_total counter"));
    assert!(body.contains(
        "traces_span_metrics_calls_total{service_name=\"app-b\",span_name=\"GET /io_task\",\
         status_code=\"STATUS_CODE_UNSET\",span_kind=\"SPAN_KIND_SERVER\"} 1"
    ));
    assert!(body.contains(
        "traces_span_metrics_errors_total{service_name=\"app-c\",span_name=\"GET /error_test\",\
         status_code=\"STATUS_CODE_ERROR\",span_kind=\"SPAN_KIND_SERVER\"} 1"
    ));
    assert!(body.contains("le=\"+Inf\""));

    let health: serde_json::Value = reqwest::get(format!("http://{}/health", admin))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let stats = service.stats();
    service.shutdown().await;

    assert_eq!(stats.get(ComponentKind::Receiver, "otlp").unwrap().accepted(), 3);
    assert_eq!(stats.get(ComponentKind::Exporter, "otlphttp/backend").unwrap().sent(), 3);
}

#[tokio::test]
async fn test_shutdown_flushes_partial_batch() {
    let (backend_addr, backend) = start_backend().await;
    let mut config = collector_config(backend_addr);
    config.service.shutdown.drain_timeout = Duration::from_secs(5);
    // a batch that would otherwise wait far longer than the test
    let batch = config
        .processors
        .values_mut()
        .next()
        .and_then(|v| v.as_mapping_mut())
        .unwrap();
    batch.insert("timeout".into(), "1h".into());

    let service = Service::start(&config).await.unwrap();
    let http = service.listener("otlp", "http").unwrap();

    let status = reqwest::Client::new()
        .post(format!("http://{}/v1/traces", http))
        .header("content-type", "application/x-protobuf")
        .body(encode_request(&chain_trace()).encode_to_vec())
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(backend.received.lock().is_empty());

    service.shutdown().await;
    assert_eq!(backend.received.lock().len(), 3);
}
