//! Running service: builds the pipeline graph from a [`Plan`], starts it
//! back to front and drains it front to back.
//!
//! Start order is exporters and connectors, metrics exporters, processors,
//! receivers, then the admin server. Shutdown reverses it: receivers stop
//! taking requests, processors flush their partial batch and close their
//! queues, exporters drain what is queued within `drain_timeout`, and the
//! pull endpoints go last.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::config::{ComponentId, Config, ConfigError};
use super::registry::{ConnectorKind, ExporterKind, Plan, ProcessorKind, ReceiverKind, Registry};
use crate::api::{self, AppState};
use crate::connector::{MetricsSource, SpanMetricsConnector};
use crate::exporter::{
    DebugExporter, DrainPhase, ExportError, ExportWorker, MetricsExporter, OtlpGrpcExporter,
    OtlpHttpExporter, PrometheusExporter, SpanExporter, WorkerSettings,
};
use crate::processor::{BatchProcessor, Downstream, Fanout, Passthrough, PipelineFanout, SpanConsumer};
use crate::receiver::{OtlpReceiver, ReceiveError, Receiver};
use crate::telemetry::{ComponentKind, StatsRegistry};

/// Extra time workers get to notice an abandoned drain before being aborted
const ABANDON_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("receiver {id}: {source}")]
    Receiver {
        id: String,
        #[source]
        source: ReceiveError,
    },

    #[error("exporter {id}: {source}")]
    Exporter {
        id: String,
        #[source]
        source: ExportError,
    },

    #[error("admin server failed to bind {endpoint}: {source}")]
    Admin {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
}

/// Entry stage of one traces pipeline
enum Stage {
    Batch(Arc<BatchProcessor>),
    Passthrough(Arc<Passthrough>),
}

impl Stage {
    fn consumer(&self) -> Arc<dyn SpanConsumer> {
        match self {
            Stage::Batch(processor) => Arc::clone(processor) as Arc<dyn SpanConsumer>,
            Stage::Passthrough(passthrough) => Arc::clone(passthrough) as Arc<dyn SpanConsumer>,
        }
    }

    fn shutdown(&self) {
        match self {
            Stage::Batch(processor) => processor.shutdown(),
            Stage::Passthrough(passthrough) => passthrough.shutdown(),
        }
    }
}

/// An address the service is listening on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub component: String,
    pub protocol: &'static str,
    pub addr: SocketAddr,
}

pub struct Service {
    stats: Arc<StatsRegistry>,
    pipelines: Vec<String>,
    listeners: Vec<Listener>,
    stages: Vec<Stage>,
    receiver_handles: Vec<JoinHandle<()>>,
    processor_handles: Vec<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
    metrics_handles: Vec<JoinHandle<()>>,
    stop_receivers: watch::Sender<bool>,
    stop_processors: watch::Sender<bool>,
    drain: watch::Sender<DrainPhase>,
    stop_metrics: watch::Sender<bool>,
    drain_timeout: Duration,
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Wait for every handle up to `limit`. Handles still running afterwards
/// stay in the vector.
async fn join_within(handles: &mut Vec<JoinHandle<()>>, limit: Duration) -> bool {
    let joined = time::timeout(limit, join_all(handles.iter_mut())).await.is_ok();
    handles.retain(|h| !h.is_finished());
    joined
}

fn abort_all(handles: &mut Vec<JoinHandle<()>>) {
    for handle in handles.drain(..) {
        handle.abort();
    }
}

fn span_exporter(
    id: &ComponentId,
    kind: &ExporterKind,
) -> Result<(Arc<dyn SpanExporter>, WorkerSettings, usize), ServiceError> {
    let name = id.to_string();
    let setup_error = |source| ServiceError::Exporter {
        id: name.clone(),
        source,
    };

    match kind {
        ExporterKind::OtlpGrpc(config) => Ok((
            Arc::new(OtlpGrpcExporter::new(&name, config).map_err(setup_error)?) as Arc<dyn SpanExporter>,
            config.worker_settings(),
            config.sending_queue.queue_size,
        )),
        ExporterKind::OtlpHttp(config) => Ok((
            Arc::new(OtlpHttpExporter::new(&name, config).map_err(setup_error)?) as Arc<dyn SpanExporter>,
            config.network.worker_settings(),
            config.network.sending_queue.queue_size,
        )),
        ExporterKind::Debug(config) => Ok((
            Arc::new(DebugExporter::new(&name, config.clone())) as Arc<dyn SpanExporter>,
            WorkerSettings::default(),
            config.sending_queue.queue_size,
        )),
        ExporterKind::Prometheus(_) => {
            Err(ConfigError::Invalid(format!("exporter {} does not support traces", id)).into())
        }
    }
}

impl Service {
    /// Validate `config` with the built-in factories and start everything
    pub async fn start(config: &Config) -> Result<Self, ServiceError> {
        Self::start_with(&Registry::default(), config).await
    }

    /// Fails without starting anything when the configuration is invalid.
    /// A listener that cannot bind stops whatever was already started.
    pub async fn start_with(registry: &Registry, config: &Config) -> Result<Self, ServiceError> {
        let plan = registry.plan(config)?;

        let mut service = Self {
            stats: Arc::new(StatsRegistry::new()),
            pipelines: plan.pipelines.keys().map(ToString::to_string).collect(),
            listeners: Vec::new(),
            stages: Vec::new(),
            receiver_handles: Vec::new(),
            processor_handles: Vec::new(),
            worker_handles: Vec::new(),
            metrics_handles: Vec::new(),
            stop_receivers: watch::channel(false).0,
            stop_processors: watch::channel(false).0,
            drain: watch::channel(DrainPhase::Running).0,
            stop_metrics: watch::channel(false).0,
            drain_timeout: config.service.shutdown.drain_timeout,
        };

        match service.build(&plan, config).await {
            Ok(()) => {
                tracing::info!(pipelines = ?service.pipelines, "Service started");
                Ok(service)
            }
            Err(e) => {
                service.shutdown().await;
                Err(e)
            }
        }
    }

    async fn build(&mut self, plan: &Plan, config: &Config) -> Result<(), ServiceError> {
        // One queue per exporter or connector, shared by every pipeline
        // that lists it. Only the fanouts keep the senders.
        let mut downstreams: BTreeMap<ComponentId, Downstream> = BTreeMap::new();
        let mut connectors: BTreeMap<ComponentId, Arc<SpanMetricsConnector>> = BTreeMap::new();

        for (_, pipeline) in plan.traces_pipelines() {
            for id in &pipeline.exporters {
                if downstreams.contains_key(id) {
                    continue;
                }
                let name = id.to_string();

                let downstream = if let Some(ConnectorKind::SpanMetrics(config)) = plan.connectors.get(id) {
                    let stats = self.stats.register(ComponentKind::Connector, &name);
                    let connector = Arc::new(SpanMetricsConnector::new(&name, config.clone(), Arc::clone(&stats)));
                    let (tx, rx) = mpsc::channel(config.queue_size);
                    self.worker_handles.push(Arc::clone(&connector).start(rx));
                    connectors.insert(id.clone(), connector);
                    Downstream::new(name, tx, stats)
                } else {
                    let kind = plan
                        .exporters
                        .get(id)
                        .ok_or_else(|| ConfigError::Invalid(format!("exporter {} is not defined", id)))?;
                    let (exporter, settings, queue_size) = span_exporter(id, kind)?;
                    let stats = self.stats.register(ComponentKind::Exporter, &name);
                    let (tx, rx) = mpsc::channel(queue_size);
                    let worker = ExportWorker::new(exporter, settings, Arc::clone(&stats));
                    self.worker_handles.push(worker.start(rx, self.drain.subscribe()));
                    Downstream::new(name, tx, stats)
                };
                downstreams.insert(id.clone(), downstream);
            }
        }

        // Metrics exporters pull from the connectors feeding their pipelines
        let mut sources: BTreeMap<&ComponentId, Vec<Arc<dyn MetricsSource>>> = BTreeMap::new();
        for (_, pipeline) in plan.metrics_pipelines() {
            for exporter_id in &pipeline.exporters {
                let list = sources.entry(exporter_id).or_default();
                for receiver_id in &pipeline.receivers {
                    if let Some(connector) = connectors.get(receiver_id) {
                        if !list.iter().any(|s| s.name() == MetricsSource::name(connector.as_ref())) {
                            list.push(Arc::clone(connector) as Arc<dyn MetricsSource>);
                        }
                    }
                }
            }
        }
        for (id, sources) in sources {
            let name = id.to_string();
            let exporter_error = |source| ServiceError::Exporter {
                id: name.clone(),
                source,
            };
            let handle = match plan.exporters.get(id) {
                Some(ExporterKind::Prometheus(config)) => {
                    let exporter = Arc::new(PrometheusExporter::new(&name, config.clone()));
                    let handle = Arc::clone(&exporter)
                        .start(sources, self.stop_metrics.subscribe())
                        .await
                        .map_err(exporter_error)?;
                    if let Some(addr) = exporter.local_addr() {
                        self.listeners.push(Listener {
                            component: name.clone(),
                            protocol: "http",
                            addr,
                        });
                    }
                    handle
                }
                Some(ExporterKind::Debug(config)) => Arc::new(DebugExporter::new(&name, config.clone()))
                    .start(sources, self.stop_metrics.subscribe())
                    .await
                    .map_err(exporter_error)?,
                _ => {
                    return Err(ConfigError::Invalid(format!("exporter {} does not support metrics", id)).into())
                }
            };
            self.metrics_handles.push(handle);
        }

        // Processors, each feeding the queues of its pipeline's exporters
        let mut receiver_targets: BTreeMap<&ComponentId, Vec<Arc<dyn SpanConsumer>>> = BTreeMap::new();
        for (pipeline_id, pipeline) in plan.traces_pipelines() {
            let fanout = Fanout::new(
                pipeline
                    .exporters
                    .iter()
                    .filter_map(|id| downstreams.get(id).cloned())
                    .collect(),
            );

            let stage = match pipeline.processors.first() {
                Some(id) => {
                    let Some(ProcessorKind::Batch(config)) = plan.processors.get(id) else {
                        return Err(ConfigError::Invalid(format!("processor {} is not defined", id)).into());
                    };
                    let name = id.to_string();
                    let stats = self.stats.register(ComponentKind::Processor, &name);
                    let processor = Arc::new(BatchProcessor::new(name, config.clone(), fanout, stats));
                    self.processor_handles
                        .push(Arc::clone(&processor).start(self.stop_processors.subscribe()));
                    Stage::Batch(processor)
                }
                None => Stage::Passthrough(Arc::new(Passthrough::new(fanout))),
            };
            tracing::debug!(pipeline = %pipeline_id, "Pipeline wired");

            for receiver_id in &pipeline.receivers {
                receiver_targets
                    .entry(receiver_id)
                    .or_default()
                    .push(stage.consumer());
            }
            self.stages.push(stage);
        }
        drop(downstreams);

        // Receivers last, so nothing is accepted before it can be delivered
        for (id, targets) in receiver_targets {
            let Some(ReceiverKind::Otlp(config)) = plan.receivers.get(id) else {
                return Err(ConfigError::Invalid(format!("receiver {} is not defined", id)).into());
            };
            let name = id.to_string();
            let stats = self.stats.register(ComponentKind::Receiver, &name);
            let consumer = Arc::new(PipelineFanout::new(targets));
            let receiver = Arc::new(OtlpReceiver::new(&name, config.clone(), consumer, stats));

            let handles = Arc::clone(&receiver)
                .start(self.stop_receivers.subscribe())
                .await
                .map_err(|source| ServiceError::Receiver {
                    id: name.clone(),
                    source,
                })?;
            self.receiver_handles.extend(handles);

            for (protocol, addr) in [("grpc", receiver.grpc_addr()), ("http", receiver.http_addr())] {
                if let Some(addr) = addr {
                    self.listeners.push(Listener {
                        component: name.clone(),
                        protocol,
                        addr,
                    });
                }
            }
        }

        if let Some(admin) = &config.service.telemetry.admin {
            let state = Arc::new(AppState::new(Arc::clone(&self.stats), self.pipelines.clone()));
            let (addr, handle) = api::run_server(&admin.endpoint, state, self.stop_metrics.subscribe())
                .await
                .map_err(|source| ServiceError::Admin {
                    endpoint: admin.endpoint.clone(),
                    source,
                })?;
            self.listeners.push(Listener {
                component: "admin".to_string(),
                protocol: "http",
                addr,
            });
            self.metrics_handles.push(handle);
        }

        Ok(())
    }

    pub fn stats(&self) -> Arc<StatsRegistry> {
        Arc::clone(&self.stats)
    }

    /// Pipeline ids in start order
    pub fn pipelines(&self) -> &[String] {
        &self.pipelines
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// Bound address of `component` for `protocol` (`grpc` or `http`)
    pub fn listener(&self, component: &str, protocol: &str) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.component == component && l.protocol == protocol)
            .map(|l| l.addr)
    }

    /// Stop in reverse start order, draining queued batches
    pub async fn shutdown(mut self) {
        let deadline = Instant::now() + self.drain_timeout;
        tracing::info!(drain_timeout = ?self.drain_timeout, "Shutting down");

        self.stop_receivers.send_replace(true);
        if !join_within(&mut self.receiver_handles, remaining(deadline)).await {
            tracing::warn!("Receivers did not stop before the drain deadline");
            abort_all(&mut self.receiver_handles);
        }

        self.stop_processors.send_replace(true);
        for stage in self.stages.drain(..) {
            stage.shutdown();
        }
        if !join_within(&mut self.processor_handles, remaining(deadline)).await {
            abort_all(&mut self.processor_handles);
        }

        self.drain.send_replace(DrainPhase::Draining);
        if !join_within(&mut self.worker_handles, remaining(deadline)).await {
            tracing::warn!(
                workers = self.worker_handles.len(),
                "Drain deadline passed, dropping queued batches"
            );
            self.drain.send_replace(DrainPhase::Abandoned);
            if !join_within(&mut self.worker_handles, ABANDON_GRACE).await {
                abort_all(&mut self.worker_handles);
            }
        }

        self.stop_metrics.send_replace(true);
        if !join_within(&mut self.metrics_handles, ABANDON_GRACE).await {
            abort_all(&mut self.metrics_handles);
        }

        let dropped: u64 = self.stats.snapshot().iter().map(|s| s.total_dropped()).sum();
        tracing::info!(dropped, "Shutdown complete");
    }
}
