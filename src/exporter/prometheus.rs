//! Pull endpoint serving connector metrics in text exposition format

use async_trait::async_trait;
use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use super::exposition::{self, CONTENT_TYPE};
use super::{ExportError, MetricsExporter};
use crate::connector::MetricsSource;

/// `exporters.prometheus`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusConfig {
    pub endpoint: String,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl PrometheusConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.trim().is_empty() {
            return Err("endpoint must not be empty".to_string());
        }
        if !self.path.starts_with('/') {
            return Err(format!("path {:?} must start with '/'", self.path));
        }
        Ok(())
    }
}

struct ScrapeState {
    sources: Vec<Arc<dyn MetricsSource>>,
}

async fn scrape(State(state): State<Arc<ScrapeState>>) -> Response {
    let families: Vec<_> = state.sources.iter().flat_map(|s| s.collect()).collect();
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], exposition::render(&families)).into_response()
}

pub fn build_router(path: &str, sources: Vec<Arc<dyn MetricsSource>>) -> Router {
    Router::new()
        .route(path, get(scrape))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(ScrapeState { sources }))
}

pub struct PrometheusExporter {
    name: String,
    config: PrometheusConfig,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl PrometheusExporter {
    pub fn new(name: impl Into<String>, config: PrometheusConfig) -> Self {
        Self {
            name: name.into(),
            config,
            local_addr: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

#[async_trait]
impl MetricsExporter for PrometheusExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        self: Arc<Self>,
        sources: Vec<Arc<dyn MetricsSource>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, ExportError> {
        let listener = TcpListener::bind(&self.config.endpoint).await.map_err(|e| {
            ExportError::Setup(format!("failed to bind {}: {}", self.config.endpoint, e))
        })?;
        let addr = listener
            .local_addr()
            .map_err(|e| ExportError::Setup(e.to_string()))?;
        *self.local_addr.lock() = Some(addr);

        let app = build_router(&self.config.path, sources);
        tracing::info!(
            exporter = %self.name,
            "Serving metrics on http://{}{}",
            addr,
            self.config.path
        );

        let name = self.name.clone();
        Ok(tokio::spawn(async move {
            let stop = async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
                tracing::error!(exporter = %name, error = %e, "Metrics endpoint failed");
            }
        }))
    }
}
