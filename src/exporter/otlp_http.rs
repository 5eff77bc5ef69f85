//! OTLP/HTTP trace exporter

use async_trait::async_trait;
use prost::Message;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Deserializer};

use super::{ExportError, NetworkSettings, SpanExporter};
use crate::model::{encode_request, otlp_json, Span};

const TRACES_PATH: &str = "/v1/traces";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpEncoding {
    #[default]
    Proto,
    Json,
}

impl HttpEncoding {
    pub fn content_type(&self) -> &'static str {
        match self {
            HttpEncoding::Proto => "application/x-protobuf",
            HttpEncoding::Json => "application/json",
        }
    }
}

/// `exporters.otlphttp`: the shared network settings plus `encoding`
#[derive(Debug, Clone)]
pub struct OtlpHttpConfig {
    pub network: NetworkSettings,
    pub encoding: HttpEncoding,
}

impl<'de> Deserialize<'de> for OtlpHttpConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let mut body = serde_yaml::Value::deserialize(deserializer)?;
        let encoding = match body.as_mapping_mut().and_then(|m| m.remove("encoding")) {
            Some(value) => serde_yaml::from_value(value).map_err(D::Error::custom)?,
            None => HttpEncoding::default(),
        };
        let network = serde_yaml::from_value(body).map_err(D::Error::custom)?;
        Ok(Self { network, encoding })
    }
}

pub struct OtlpHttpExporter {
    name: String,
    url: String,
    encoding: HttpEncoding,
    client: reqwest::Client,
}

impl OtlpHttpExporter {
    pub fn new(name: impl Into<String>, config: &OtlpHttpConfig) -> Result<Self, ExportError> {
        let network = &config.network;

        let mut headers = HeaderMap::new();
        for (key, value) in &network.headers {
            let header = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| ExportError::Setup(format!("invalid header name {:?}", key)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ExportError::Setup(format!("invalid value for header {}", key)))?;
            headers.insert(header, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(network.timeout)
            .build()
            .map_err(|e| ExportError::Setup(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            url: traces_url(&network.endpoint, network.use_tls()),
            encoding: config.encoding,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn encode(&self, spans: &[Span]) -> Result<Vec<u8>, ExportError> {
        let request = encode_request(spans);
        match self.encoding {
            HttpEncoding::Proto => Ok(request.encode_to_vec()),
            HttpEncoding::Json => serde_json::to_vec(&otlp_json::ExportTraceServiceRequest::from(&request))
                .map_err(|e| ExportError::Encode(e.to_string())),
        }
    }
}

/// Base endpoint plus `/v1/traces` unless the path is already there
fn traces_url(endpoint: &str, tls: bool) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    let base = if endpoint.contains("://") {
        endpoint.to_string()
    } else if tls {
        format!("https://{}", endpoint)
    } else {
        format!("http://{}", endpoint)
    };

    if base.ends_with(TRACES_PATH) {
        base
    } else {
        format!("{}{}", base, TRACES_PATH)
    }
}

#[async_trait]
impl SpanExporter for OtlpHttpExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, spans: &[Span]) -> Result<(), ExportError> {
        let body = self.encode(spans)?;

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, self.encoding.content_type())
            .body(body)
            .send()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(512)
            .collect();
        Err(ExportError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SpanId, TraceId};
    use axum::body::Bytes;
    use axum::{extract::State, http::HeaderMap as AxumHeaders, http::StatusCode, routing::post, Router};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Captured {
        requests: Vec<(String, Option<String>, Bytes)>,
    }

    async fn start_backend(status: StatusCode) -> (String, Arc<Mutex<Captured>>) {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let app = Router::new()
            .route(
                "/v1/traces",
                post(
                    move |State(captured): State<Arc<Mutex<Captured>>>, headers: AxumHeaders, body: Bytes| async move {
                        let content_type = headers
                            .get("content-type")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        captured.lock().await.requests.push((content_type, auth, body));
                        status
                    },
                ),
            )
            .with_state(Arc::clone(&captured));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), captured)
    }

    fn config(endpoint: &str, encoding: HttpEncoding) -> OtlpHttpConfig {
        OtlpHttpConfig {
            network: NetworkSettings::new(endpoint),
            encoding,
        }
    }

    fn spans() -> Vec<Span> {
        vec![Span::new(TraceId::new(5), SpanId::new(6), "GET /items/{item_id}", "app-a")]
    }

    #[tokio::test]
    async fn test_export_protobuf() {
        let (endpoint, captured) = start_backend(StatusCode::OK).await;
        let mut config = config(&endpoint, HttpEncoding::Proto);
        config
            .network
            .headers
            .insert("authorization".to_string(), "Bearer token".to_string());
        let exporter = OtlpHttpExporter::new("otlphttp", &config).unwrap();

        exporter.export(&spans()).await.unwrap();

        let captured = captured.lock().await;
        let (content_type, auth, body) = &captured.requests[0];
        assert_eq!(content_type, "application/x-protobuf");
        assert_eq!(auth.as_deref(), Some("Bearer token"));

        let decoded =
            opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest::decode(body.clone())
                .unwrap();
        assert_eq!(decoded.resource_spans[0].scope_spans[0].spans[0].name, "GET /items/{item_id}");
    }

    #[tokio::test]
    async fn test_export_json() {
        let (endpoint, captured) = start_backend(StatusCode::OK).await;
        let exporter = OtlpHttpExporter::new("otlphttp", &config(&endpoint, HttpEncoding::Json)).unwrap();

        exporter.export(&spans()).await.unwrap();

        let captured = captured.lock().await;
        let (content_type, _, body) = &captured.requests[0];
        assert_eq!(content_type, "application/json");
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(
            json["resourceSpans"][0]["scopeSpans"][0]["spans"][0]["spanId"],
            "0000000000000006"
        );
    }

    #[tokio::test]
    async fn test_status_classification() {
        let (endpoint, _) = start_backend(StatusCode::SERVICE_UNAVAILABLE).await;
        let exporter = OtlpHttpExporter::new("otlphttp", &config(&endpoint, HttpEncoding::Proto)).unwrap();
        let err = exporter.export(&spans()).await.unwrap_err();
        assert!(matches!(err, ExportError::Http { status: 503, .. }));
        assert!(err.is_retryable());

        let (endpoint, _) = start_backend(StatusCode::BAD_REQUEST).await;
        let exporter = OtlpHttpExporter::new("otlphttp", &config(&endpoint, HttpEncoding::Proto)).unwrap();
        assert!(!exporter.export(&spans()).await.unwrap_err().is_retryable());
    }

    #[test]
    fn test_traces_url() {
        assert_eq!(traces_url("http://tempo:4318", false), "http://tempo:4318/v1/traces");
        assert_eq!(traces_url("http://tempo:4318/", false), "http://tempo:4318/v1/traces");
        assert_eq!(traces_url("tempo:4318/v1/traces", true), "https://tempo:4318/v1/traces");
    }

    #[test]
    fn test_tls_selects_https() {
        let mut secure = config("tempo:4318", HttpEncoding::Proto);
        secure.network.tls.insecure = false;
        let exporter = OtlpHttpExporter::new("otlphttp", &secure).unwrap();
        assert_eq!(exporter.url(), "https://tempo:4318/v1/traces");

        let plain = OtlpHttpExporter::new("otlphttp", &config("tempo:4318", HttpEncoding::Proto)).unwrap();
        assert_eq!(plain.url(), "http://tempo:4318/v1/traces");
    }

    #[test]
    fn test_config_decoding() {
        let config: OtlpHttpConfig =
            serde_yaml::from_str("endpoint: http://tempo:4318\nencoding: json\ntimeout: 3s\n").unwrap();
        assert_eq!(config.encoding, HttpEncoding::Json);
        assert_eq!(config.network.timeout, std::time::Duration::from_secs(3));

        assert!(serde_yaml::from_str::<OtlpHttpConfig>("endpoint: x\nencoding: xml\n").is_err());
        assert!(serde_yaml::from_str::<OtlpHttpConfig>("endpoint: x\ncompresion: gzip\n").is_err());
    }
}
