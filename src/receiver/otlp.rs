//! OTLP receiver: gRPC `TraceService/Export` and HTTP `POST /v1/traces`

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_server::{TraceService, TraceServiceServer},
    ExportTracePartialSuccess, ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use parking_lot::Mutex;
use prost::Message;
use serde::{Deserialize, Deserializer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tower_http::trace::TraceLayer;

use super::{ReceiveError, Receiver};
use crate::model::{decode_request, otlp_json, DecodedSpans};
use crate::processor::{ConsumeError, SpanConsumer};
use crate::telemetry::ComponentStats;

const TRACES_PATH: &str = "/v1/traces";
const PROTOBUF: &str = "application/x-protobuf";
const JSON: &str = "application/json";

/// `receivers.otlp`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtlpReceiverConfig {
    pub protocols: Protocols,
}

/// A protocol key with an empty body is enabled with its defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Protocols {
    #[serde(default, deserialize_with = "enabled")]
    pub grpc: Option<GrpcSettings>,
    #[serde(default, deserialize_with = "enabled")]
    pub http: Option<HttpSettings>,
}

fn enabled<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Some(Option::<T>::deserialize(deserializer)?.unwrap_or_default()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrpcSettings {
    #[serde(default = "default_grpc_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_max_recv_msg_size_mib")]
    pub max_recv_msg_size_mib: usize,
}

impl Default for GrpcSettings {
    fn default() -> Self {
        Self {
            endpoint: default_grpc_endpoint(),
            max_recv_msg_size_mib: default_max_recv_msg_size_mib(),
        }
    }
}

fn default_grpc_endpoint() -> String {
    "0.0.0.0:4317".to_string()
}

fn default_max_recv_msg_size_mib() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSettings {
    #[serde(default = "default_http_endpoint")]
    pub endpoint: String,
    /// Bytes; larger bodies get 413
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            endpoint: default_http_endpoint(),
            max_request_body_size: default_max_request_body_size(),
        }
    }
}

fn default_http_endpoint() -> String {
    "0.0.0.0:4318".to_string()
}

fn default_max_request_body_size() -> usize {
    20 * 1024 * 1024
}

impl OtlpReceiverConfig {
    pub fn validate(&self) -> Result<(), String> {
        let Protocols { grpc, http } = &self.protocols;
        if grpc.is_none() && http.is_none() {
            return Err("at least one of protocols.grpc or protocols.http is required".to_string());
        }
        if let Some(grpc) = grpc {
            if grpc.endpoint.trim().is_empty() {
                return Err("protocols.grpc.endpoint must not be empty".to_string());
            }
            if grpc.max_recv_msg_size_mib == 0 {
                return Err("protocols.grpc.max_recv_msg_size_mib must be greater than zero".to_string());
            }
        }
        if let Some(http) = http {
            if http.endpoint.trim().is_empty() {
                return Err("protocols.http.endpoint must not be empty".to_string());
            }
            if http.max_request_body_size == 0 {
                return Err("protocols.http.max_request_body_size must be greater than zero".to_string());
            }
        }
        Ok(())
    }

    /// Every address this receiver listens on
    pub fn endpoints(&self) -> Vec<&str> {
        let grpc = self.protocols.grpc.as_ref().map(|g| g.endpoint.as_str());
        let http = self.protocols.http.as_ref().map(|h| h.endpoint.as_str());
        grpc.into_iter().chain(http).collect()
    }
}

pub struct OtlpReceiver {
    name: String,
    config: OtlpReceiverConfig,
    consumer: Arc<dyn SpanConsumer>,
    stats: Arc<ComponentStats>,
    grpc_addr: Mutex<Option<SocketAddr>>,
    http_addr: Mutex<Option<SocketAddr>>,
}

impl OtlpReceiver {
    pub fn new(
        name: impl Into<String>,
        config: OtlpReceiverConfig,
        consumer: Arc<dyn SpanConsumer>,
        stats: Arc<ComponentStats>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            consumer,
            stats,
            grpc_addr: Mutex::new(None),
            http_addr: Mutex::new(None),
        }
    }

    pub fn grpc_addr(&self) -> Option<SocketAddr> {
        *self.grpc_addr.lock()
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        *self.http_addr.lock()
    }

    /// Validate, admit and answer one export request.
    ///
    /// Malformed spans never enter a pipeline. When some spans of a request
    /// are valid they are admitted and the rest is reported through
    /// `partial_success`; when none are, the whole request is refused.
    pub async fn ingest(
        &self,
        request: ExportTraceServiceRequest,
    ) -> Result<ExportTraceServiceResponse, ReceiveError> {
        let DecodedSpans {
            spans,
            rejected,
            first_error,
        } = decode_request(request);

        if spans.is_empty() {
            return match first_error {
                Some(first) => {
                    self.stats.record_refused(rejected);
                    Err(ReceiveError::Malformed {
                        count: rejected,
                        first,
                    })
                }
                None => Ok(ExportTraceServiceResponse::default()),
            };
        }

        let admitted = spans.len();
        if let Err(e) = self.consumer.consume(spans).await {
            self.stats.record_refused(admitted + rejected);
            tracing::debug!(receiver = %self.name, spans = admitted, error = %e, "Refused request");
            return Err(e.into());
        }
        self.stats.record_accepted(admitted);

        if rejected == 0 {
            return Ok(ExportTraceServiceResponse::default());
        }

        self.stats.record_refused(rejected);
        tracing::debug!(receiver = %self.name, rejected, "Rejected malformed spans");
        Ok(ExportTraceServiceResponse {
            partial_success: Some(ExportTracePartialSuccess {
                rejected_spans: rejected as i64,
                error_message: first_error.map(|e| e.to_string()).unwrap_or_default(),
            }),
        })
    }
}

async fn bind(endpoint: &str) -> Result<(TcpListener, SocketAddr), ReceiveError> {
    let to_error = |source| ReceiveError::Bind {
        endpoint: endpoint.to_string(),
        source,
    };
    let listener = TcpListener::bind(endpoint).await.map_err(to_error)?;
    let addr = listener.local_addr().map_err(to_error)?;
    Ok((listener, addr))
}

async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[async_trait]
impl Receiver for OtlpReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, ReceiveError> {
        let grpc = match &self.config.protocols.grpc {
            Some(settings) => Some((bind(&settings.endpoint).await?, settings.max_recv_msg_size_mib)),
            None => None,
        };
        let http = match &self.config.protocols.http {
            Some(settings) => Some((bind(&settings.endpoint).await?, settings.max_request_body_size)),
            None => None,
        };

        let mut handles = Vec::new();

        if let Some(((listener, addr), size_mib)) = grpc {
            *self.grpc_addr.lock() = Some(addr);
            tracing::info!(receiver = %self.name, "OTLP/gRPC listening on {}", addr);

            let service = TraceServiceServer::new(GrpcService {
                receiver: Arc::clone(&self),
            })
            .max_decoding_message_size(size_mib * 1024 * 1024);
            let name = self.name.clone();
            let stop = stopped(shutdown.clone());
            handles.push(tokio::spawn(async move {
                let result = tonic::transport::Server::builder()
                    .add_service(service)
                    .serve_with_incoming_shutdown(TcpListenerStream::new(listener), stop)
                    .await;
                if let Err(e) = result {
                    tracing::error!(receiver = %name, error = %e, "OTLP/gRPC server failed");
                }
            }));
        }

        if let Some(((listener, addr), body_limit)) = http {
            *self.http_addr.lock() = Some(addr);
            tracing::info!(receiver = %self.name, "OTLP/HTTP listening on http://{}{}", addr, TRACES_PATH);

            let app = build_router(Arc::clone(&self), body_limit);
            let name = self.name.clone();
            let stop = stopped(shutdown.clone());
            handles.push(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
                    tracing::error!(receiver = %name, error = %e, "OTLP/HTTP server failed");
                }
            }));
        }

        Ok(handles)
    }
}

// ============================================================================
// gRPC
// ============================================================================

struct GrpcService {
    receiver: Arc<OtlpReceiver>,
}

#[tonic::async_trait]
impl TraceService for GrpcService {
    async fn export(
        &self,
        request: tonic::Request<ExportTraceServiceRequest>,
    ) -> Result<tonic::Response<ExportTraceServiceResponse>, tonic::Status> {
        self.receiver
            .ingest(request.into_inner())
            .await
            .map(tonic::Response::new)
            .map_err(tonic::Status::from)
    }
}

impl From<ReceiveError> for tonic::Status {
    fn from(err: ReceiveError) -> Self {
        let message = err.to_string();
        match err {
            ReceiveError::Refused(e) if e.is_retryable() => tonic::Status::unavailable(message),
            ReceiveError::Bind { .. } => tonic::Status::internal(message),
            _ => tonic::Status::invalid_argument(message),
        }
    }
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Protobuf,
    Json,
}

fn request_encoding(headers: &HeaderMap) -> Result<Encoding, ReceiveError> {
    let value = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let media_type = value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();

    match media_type.as_str() {
        PROTOBUF => Ok(Encoding::Protobuf),
        JSON => Ok(Encoding::Json),
        _ => Err(ReceiveError::UnsupportedMediaType(value.to_string())),
    }
}

impl IntoResponse for ReceiveError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReceiveError::Decode(_) | ReceiveError::Malformed { .. } => StatusCode::BAD_REQUEST,
            ReceiveError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ReceiveError::Refused(ConsumeError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            ReceiveError::Refused(_) => StatusCode::SERVICE_UNAVAILABLE,
            ReceiveError::Bind { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "retryable": self.is_retryable(),
        }));

        if status == StatusCode::SERVICE_UNAVAILABLE {
            (status, [(header::RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

async fn export_traces(
    State(receiver): State<Arc<OtlpReceiver>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ReceiveError> {
    let encoding = request_encoding(&headers)?;

    let request = match encoding {
        Encoding::Protobuf => ExportTraceServiceRequest::decode(body)
            .map_err(|e| ReceiveError::Decode(e.to_string()))?,
        Encoding::Json => serde_json::from_slice::<otlp_json::ExportTraceServiceRequest>(&body)
            .map(ExportTraceServiceRequest::from)
            .map_err(|e| ReceiveError::Decode(e.to_string()))?,
    };

    let response = receiver.ingest(request).await?;

    Ok(match encoding {
        Encoding::Protobuf => {
            ([(header::CONTENT_TYPE, PROTOBUF)], response.encode_to_vec()).into_response()
        }
        Encoding::Json => Json(otlp_json::ExportTraceServiceResponse::from(&response)).into_response(),
    })
}

pub fn build_router(receiver: Arc<OtlpReceiver>, body_limit: usize) -> Router {
    Router::new()
        .route(TRACES_PATH, post(export_traces))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{encode_request, Span, SpanId, TraceId};
    use crate::telemetry::ComponentKind;
    use axum::body::Body;
    use axum::http::Request;
    use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
    use tokio::sync::Mutex as AsyncMutex;
    use tower::util::ServiceExt;

    /// Records what it is given, or refuses everything with `refuse`
    #[derive(Default)]
    struct Recorder {
        calls: AsyncMutex<Vec<Vec<Span>>>,
        refuse: Option<ConsumeError>,
    }

    #[async_trait]
    impl SpanConsumer for Recorder {
        async fn consume(&self, spans: Vec<Span>) -> Result<(), ConsumeError> {
            if let Some(e) = &self.refuse {
                return Err(e.clone());
            }
            self.calls.lock().await.push(spans);
            Ok(())
        }
    }

    fn receiver(consumer: Arc<Recorder>, protocols: Protocols) -> (Arc<OtlpReceiver>, Arc<ComponentStats>) {
        let stats = Arc::new(ComponentStats::new(ComponentKind::Receiver, "otlp"));
        let receiver = OtlpReceiver::new(
            "otlp",
            OtlpReceiverConfig { protocols },
            consumer,
            Arc::clone(&stats),
        );
        (Arc::new(receiver), stats)
    }

    fn http_only(limit: usize) -> Protocols {
        Protocols {
            grpc: None,
            http: Some(HttpSettings {
                endpoint: "127.0.0.1:0".to_string(),
                max_request_body_size: limit,
            }),
        }
    }

    fn request(spans: &[Span]) -> ExportTraceServiceRequest {
        encode_request(spans)
    }

    fn spans() -> Vec<Span> {
        vec![
            Span::new(TraceId::new(1), SpanId::new(1), "GET /chain", "app-a"),
            Span::new(TraceId::new(1), SpanId::new(2), "GET /io_task", "app-a"),
        ]
    }

    /// Second span has an all-zero span id
    fn half_malformed() -> ExportTraceServiceRequest {
        let mut request = request(&spans());
        request.resource_spans[0].scope_spans[0].spans[1].span_id = vec![0; 8];
        request
    }

    fn post(content_type: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(TRACES_PATH)
            .header("content-type", content_type)
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_http_protobuf_accepted() {
        let consumer = Arc::new(Recorder::default());
        let (receiver, stats) = receiver(Arc::clone(&consumer), http_only(1 << 20));
        let app = build_router(receiver, 1 << 20);

        let response = app
            .oneshot(post(PROTOBUF, request(&spans()).encode_to_vec()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], PROTOBUF);
        let calls = consumer.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0].name, "GET /chain");
        assert_eq!(calls[0][1].name, "GET /io_task");
        assert_eq!(stats.accepted(), 2);
    }

    #[tokio::test]
    async fn test_http_json_with_charset() {
        let consumer = Arc::new(Recorder::default());
        let (receiver, _) = receiver(Arc::clone(&consumer), http_only(1 << 20));
        let app = build_router(receiver, 1 << 20);

        let body = serde_json::json!({
            "resourceSpans": [{
                "resource": {"attributes": [{"key": "service.name", "value": {"stringValue": "app-b"}}]},
                "scopeSpans": [{
                    "spans": [{
                        "traceId": "5b8efff798038103d269b633813fc60c",
                        "spanId": "eee19b7ec3c1b174",
                        "name": "GET /items/{item_id}",
                        "kind": 2,
                        "startTimeUnixNano": "1544712660000000000",
                        "endTimeUnixNano": "1544712661000000000"
                    }]
                }]
            }]
        });
        let response = app
            .oneshot(post("application/json; charset=utf-8", serde_json::to_vec(&body).unwrap()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!({}));
        let calls = consumer.calls.lock().await;
        assert_eq!(calls[0][0].service_name, "app-b");
        assert_eq!(calls[0][0].duration_ms(), 1000.0);
    }

    #[tokio::test]
    async fn test_http_partial_success() {
        let consumer = Arc::new(Recorder::default());
        let (receiver, stats) = receiver(Arc::clone(&consumer), http_only(1 << 20));
        let app = build_router(receiver, 1 << 20);

        let response = app
            .oneshot(post(PROTOBUF, half_malformed().encode_to_vec()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decoded = ExportTraceServiceResponse::decode(body).unwrap();
        assert_eq!(decoded.partial_success.unwrap().rejected_spans, 1);
        assert_eq!(consumer.calls.lock().await[0].len(), 1);
        assert_eq!(stats.accepted(), 1);
        assert_eq!(stats.refused(), 1);
    }

    #[tokio::test]
    async fn test_http_fully_malformed_is_bad_request() {
        let consumer = Arc::new(Recorder::default());
        let (receiver, _) = receiver(Arc::clone(&consumer), http_only(1 << 20));
        let app = build_router(receiver, 1 << 20);

        let mut request = request(&spans());
        for span in &mut request.resource_spans[0].scope_spans[0].spans {
            span.trace_id = Vec::new();
        }
        let response = app.oneshot(post(PROTOBUF, request.encode_to_vec())).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["retryable"], false);
        assert!(consumer.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_http_rejects_bad_requests() {
        let consumer = Arc::new(Recorder::default());
        let (receiver, _) = receiver(consumer, http_only(64));
        let app = build_router(receiver, 64);

        let response = app
            .clone()
            .oneshot(post("text/plain", b"hello".to_vec()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let response = app
            .clone()
            .oneshot(post(PROTOBUF, vec![0xff; 16]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(post(PROTOBUF, vec![0; 1024])).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_http_backpressure_is_retryable() {
        let consumer = Arc::new(Recorder {
            refuse: Some(ConsumeError::Backpressure),
            ..Default::default()
        });
        let (receiver, stats) = receiver(consumer, http_only(1 << 20));
        let app = build_router(receiver, 1 << 20);

        let response = app
            .oneshot(post(PROTOBUF, request(&spans()).encode_to_vec()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
        assert_eq!(json_body(response).await["retryable"], true);
        assert_eq!(stats.refused(), 2);
        assert_eq!(stats.accepted(), 0);
    }

    #[tokio::test]
    async fn test_empty_request_is_ok() {
        let consumer = Arc::new(Recorder::default());
        let (receiver, _) = receiver(Arc::clone(&consumer), http_only(1 << 20));
        let response = receiver.ingest(ExportTraceServiceRequest::default()).await.unwrap();
        assert!(response.partial_success.is_none());
        assert!(consumer.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_grpc_status_codes() {
        let consumer = Arc::new(Recorder::default());
        let protocols = Protocols {
            grpc: Some(GrpcSettings {
                endpoint: "127.0.0.1:0".to_string(),
                ..Default::default()
            }),
            http: None,
        };
        let (receiver, _) = receiver(Arc::clone(&consumer), protocols);
        let (tx, rx) = watch::channel(false);
        let handles = Arc::clone(&receiver).start(rx).await.unwrap();
        let addr = receiver.grpc_addr().unwrap();
        assert!(receiver.http_addr().is_none());

        let mut client = TraceServiceClient::connect(format!("http://{}", addr)).await.unwrap();

        let response = client.export(request(&spans())).await.unwrap().into_inner();
        assert!(response.partial_success.is_none());

        let response = client.export(half_malformed()).await.unwrap().into_inner();
        assert_eq!(response.partial_success.unwrap().rejected_spans, 1);

        let mut bad = request(&spans());
        bad.resource_spans[0].scope_spans[0].spans.truncate(1);
        bad.resource_spans[0].scope_spans[0].spans[0].trace_id = vec![0; 16];
        let status = client.export(bad).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        assert_eq!(consumer.calls.lock().await.len(), 2);

        tx.send(true).unwrap();
        drop(client);
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_backpressure_maps_to_unavailable() {
        let status = tonic::Status::from(ReceiveError::Refused(ConsumeError::Backpressure));
        assert_eq!(status.code(), tonic::Code::Unavailable);
        let status = tonic::Status::from(ReceiveError::Refused(ConsumeError::TooLarge { spans: 9, limit: 4 }));
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let protocols = Protocols {
            grpc: None,
            http: Some(HttpSettings {
                endpoint: taken.local_addr().unwrap().to_string(),
                ..Default::default()
            }),
        };
        let (receiver, _) = receiver(Arc::new(Recorder::default()), protocols);
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(receiver.start(rx).await, Err(ReceiveError::Bind { .. })));
    }

    #[test]
    fn test_config() {
        let config: OtlpReceiverConfig =
            serde_yaml::from_str("protocols:\n  grpc:\n  http:\n    endpoint: 127.0.0.1:9999\n").unwrap();
        assert_eq!(config.protocols.grpc.as_ref().unwrap().endpoint, "0.0.0.0:4317");
        assert_eq!(config.endpoints(), vec!["0.0.0.0:4317", "127.0.0.1:9999"]);
        assert!(config.validate().is_ok());

        let config: OtlpReceiverConfig = serde_yaml::from_str("protocols: {}").unwrap();
        assert!(config.validate().is_err());

        assert!(serde_yaml::from_str::<OtlpReceiverConfig>("protocols:\n  thrift:\n").is_err());
    }
}
