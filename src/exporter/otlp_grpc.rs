//! OTLP/gRPC trace exporter

use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use super::{ExportError, NetworkSettings, SpanExporter};
use crate::model::{encode_request, Span};

/// `exporters.otlp`
pub type OtlpGrpcConfig = NetworkSettings;

pub struct OtlpGrpcExporter {
    name: String,
    endpoint: String,
    client: TraceServiceClient<Channel>,
    metadata: MetadataMap,
}

impl OtlpGrpcExporter {
    /// Build the client. The channel connects on first use, so an unreachable
    /// backend at startup only shows up as failed exports.
    pub fn new(name: impl Into<String>, config: &OtlpGrpcConfig) -> Result<Self, ExportError> {
        let tls = config.use_tls();
        let uri = with_scheme(&config.endpoint, tls);

        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| ExportError::Setup(format!("invalid endpoint {:?}: {}", uri, e)))?
            .connect_timeout(config.timeout);
        if tls {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_webpki_roots())
                .map_err(|e| ExportError::Setup(format!("TLS setup failed: {}", e)))?;
        }

        let mut metadata = MetadataMap::new();
        for (name, value) in &config.headers {
            let key = MetadataKey::from_bytes(name.to_ascii_lowercase().as_bytes())
                .map_err(|_| ExportError::Setup(format!("invalid header name {:?}", name)))?;
            let value = MetadataValue::try_from(value.as_str())
                .map_err(|_| ExportError::Setup(format!("invalid value for header {}", name)))?;
            metadata.insert(key, value);
        }

        Ok(Self {
            name: name.into(),
            endpoint: uri,
            client: TraceServiceClient::new(endpoint.connect_lazy()),
            metadata,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// `host:port` gets a scheme matching the TLS setting
fn with_scheme(endpoint: &str, tls: bool) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if tls {
        format!("https://{}", endpoint)
    } else {
        format!("http://{}", endpoint)
    }
}

#[async_trait]
impl SpanExporter for OtlpGrpcExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, spans: &[Span]) -> Result<(), ExportError> {
        let mut request = tonic::Request::new(encode_request(spans));
        *request.metadata_mut() = self.metadata.clone();

        let mut client = self.client.clone();
        let response = client.export(request).await.map_err(|status| ExportError::Grpc {
            code: status.code(),
            message: status.message().to_string(),
        })?;

        if let Some(partial) = response.into_inner().partial_success {
            if partial.rejected_spans > 0 {
                tracing::warn!(
                    exporter = %self.name,
                    rejected = partial.rejected_spans,
                    message = %partial.error_message,
                    "Backend rejected part of a batch"
                );
            }
        }
        Ok(())
    }
}
