//! Component factories and startup validation
//!
//! The [`Registry`] maps a component type to a factory that decodes its
//! options. [`Registry::plan`] decodes every section, checks every pipeline
//! reference and returns a [`Plan`] the service can build without further
//! checks. Nothing is bound or spawned here.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::config::{
    decode_body, ComponentId, Config, ConfigError, PipelineConfig, PipelineId, Signal,
};
use crate::connector::SpanMetricsConfig;
use crate::exporter::{DebugConfig, OtlpGrpcConfig, OtlpHttpConfig, PrometheusConfig};
use crate::processor::BatchConfig;
use crate::receiver::OtlpReceiverConfig;

const TRACES: &[Signal] = &[Signal::Traces];
const METRICS: &[Signal] = &[Signal::Metrics];
const BOTH: &[Signal] = &[Signal::Traces, Signal::Metrics];

#[derive(Debug, Clone)]
pub enum ReceiverKind {
    Otlp(OtlpReceiverConfig),
}

#[derive(Debug, Clone)]
pub enum ProcessorKind {
    Batch(BatchConfig),
}

#[derive(Debug, Clone)]
pub enum ConnectorKind {
    SpanMetrics(SpanMetricsConfig),
}

#[derive(Debug, Clone)]
pub enum ExporterKind {
    OtlpGrpc(OtlpGrpcConfig),
    OtlpHttp(OtlpHttpConfig),
    Debug(DebugConfig),
    Prometheus(PrometheusConfig),
}

type Decode<T> = fn(&ComponentId, &serde_yaml::Value) -> Result<T, ConfigError>;

/// Decodes the options of one component type
pub struct Factory<T> {
    type_name: &'static str,
    signals: &'static [Signal],
    decode: Decode<T>,
}

impl<T> Factory<T> {
    pub fn new(type_name: &'static str, signals: &'static [Signal], decode: Decode<T>) -> Self {
        Self {
            type_name,
            signals,
            decode,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn supports(&self, signal: Signal) -> bool {
        self.signals.contains(&signal)
    }

    fn unsupported(&self, kind: &str, id: &ComponentId, signal: Signal) -> String {
        let supported: Vec<&str> = self.signals.iter().map(|s| s.as_str()).collect();
        format!(
            "{} {} does not support {}; type {} handles {}",
            kind,
            id,
            signal.as_str(),
            self.type_name(),
            supported.join(", ")
        )
    }
}

/// Decode a body and run the config's own checks
fn decode<T, F>(kind: &'static str, id: &ComponentId, body: &serde_yaml::Value, validate: F) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned,
    F: FnOnce(&T) -> Result<(), String>,
{
    let config = decode_body(kind, id, body)?;
    validate(&config).map_err(|message| ConfigError::Component {
        kind,
        id: id.to_string(),
        message,
    })?;
    Ok(config)
}

/// Named factories for every component type the service knows
pub struct Registry {
    receivers: Vec<Factory<ReceiverKind>>,
    processors: Vec<Factory<ProcessorKind>>,
    connectors: Vec<Factory<ConnectorKind>>,
    exporters: Vec<Factory<ExporterKind>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            receivers: vec![Factory::new("otlp", TRACES, |id, body| {
                decode("receiver", id, body, OtlpReceiverConfig::validate).map(ReceiverKind::Otlp)
            })],
            processors: vec![Factory::new("batch", TRACES, |id, body| {
                decode("processor", id, body, BatchConfig::validate).map(ProcessorKind::Batch)
            })],
            connectors: vec![Factory::new("spanmetrics", BOTH, |id, body| {
                decode("connector", id, body, SpanMetricsConfig::validate).map(ConnectorKind::SpanMetrics)
            })],
            exporters: vec![
                Factory::new("otlp", TRACES, |id, body| {
                    decode("exporter", id, body, OtlpGrpcConfig::validate).map(ExporterKind::OtlpGrpc)
                }),
                Factory::new("otlphttp", TRACES, |id, body| {
                    decode("exporter", id, body, |c: &OtlpHttpConfig| c.network.validate())
                        .map(ExporterKind::OtlpHttp)
                }),
                Factory::new("debug", BOTH, |id, body| {
                    decode("exporter", id, body, DebugConfig::validate).map(ExporterKind::Debug)
                }),
                Factory::new("prometheus", METRICS, |id, body| {
                    decode("exporter", id, body, PrometheusConfig::validate).map(ExporterKind::Prometheus)
                }),
            ],
        }
    }
}

/// A validated configuration with every component decoded
#[derive(Debug, Clone)]
pub struct Plan {
    pub receivers: BTreeMap<ComponentId, ReceiverKind>,
    pub processors: BTreeMap<ComponentId, ProcessorKind>,
    pub connectors: BTreeMap<ComponentId, ConnectorKind>,
    pub exporters: BTreeMap<ComponentId, ExporterKind>,
    pub pipelines: BTreeMap<PipelineId, PipelineConfig>,
}

impl Plan {
    pub fn traces_pipelines(&self) -> impl Iterator<Item = (&PipelineId, &PipelineConfig)> {
        self.pipelines.iter().filter(|(id, _)| id.signal == Signal::Traces)
    }

    pub fn metrics_pipelines(&self) -> impl Iterator<Item = (&PipelineId, &PipelineConfig)> {
        self.pipelines.iter().filter(|(id, _)| id.signal == Signal::Metrics)
    }
}

/// Decoded section plus which factory produced each entry
struct Section<'r, T> {
    entries: BTreeMap<ComponentId, (T, &'r Factory<T>)>,
}

impl<'r, T> Section<'r, T> {
    fn decode(
        kind: &'static str,
        factories: &'r [Factory<T>],
        raw: &BTreeMap<ComponentId, serde_yaml::Value>,
    ) -> Result<Self, ConfigError> {
        let mut entries = BTreeMap::new();
        for (id, body) in raw {
            let factory = factories
                .iter()
                .find(|f| f.type_name() == id.type_name())
                .ok_or_else(|| ConfigError::UnknownType {
                    kind,
                    type_name: id.type_name().to_string(),
                    id: id.to_string(),
                })?;
            entries.insert(id.clone(), ((factory.decode)(id, body)?, factory));
        }
        Ok(Self { entries })
    }

    fn get(&self, id: &ComponentId) -> Option<&'r Factory<T>> {
        self.entries.get(id).map(|(_, factory)| *factory)
    }

    fn into_configs(self) -> BTreeMap<ComponentId, T> {
        self.entries.into_iter().map(|(id, (config, _))| (id, config)).collect()
    }
}

fn pipeline_error(pipeline: &PipelineId, message: String) -> ConfigError {
    ConfigError::Pipeline {
        pipeline: pipeline.to_string(),
        message,
    }
}

fn undefined(pipeline: &PipelineId, kind: &'static str, id: &ComponentId) -> ConfigError {
    ConfigError::UndefinedReference {
        pipeline: pipeline.to_string(),
        kind,
        id: id.to_string(),
    }
}

impl Registry {
    /// Decode and cross-check the whole document
    pub fn plan(&self, config: &Config) -> Result<Plan, ConfigError> {
        let receivers = Section::decode("receiver", &self.receivers, &config.receivers)?;
        let processors = Section::decode("processor", &self.processors, &config.processors)?;
        let connectors = Section::decode("connector", &self.connectors, &config.connectors)?;
        let exporters = Section::decode("exporter", &self.exporters, &config.exporters)?;

        if config.service.pipelines.is_empty() {
            return Err(ConfigError::Invalid("service.pipelines must define at least one pipeline".to_string()));
        }

        let mut processor_owner: HashMap<&ComponentId, &PipelineId> = HashMap::new();
        let mut connectors_as_exporter = BTreeSet::new();
        let mut connectors_as_receiver = BTreeSet::new();

        for (pipeline, definition) in &config.service.pipelines {
            let signal = pipeline.signal;

            if definition.receivers.is_empty() {
                return Err(pipeline_error(pipeline, "at least one receiver is required".to_string()));
            }
            if definition.exporters.is_empty() {
                return Err(pipeline_error(pipeline, "at least one exporter is required".to_string()));
            }
            if definition.processors.len() > 1 {
                return Err(pipeline_error(pipeline, "at most one processor is supported".to_string()));
            }
            for (kind, list) in [
                ("receiver", &definition.receivers),
                ("processor", &definition.processors),
                ("exporter", &definition.exporters),
            ] {
                if let Some(dup) = list.iter().enumerate().find(|(i, id)| list[..*i].contains(*id)) {
                    return Err(pipeline_error(pipeline, format!("{} {} is listed twice", kind, dup.1)));
                }
            }

            for id in &definition.receivers {
                if let Some(factory) = receivers.get(id) {
                    if !factory.supports(signal) {
                        return Err(pipeline_error(
                            pipeline,
                            factory.unsupported("receiver", id, signal),
                        ));
                    }
                } else if connectors.get(id).is_some() {
                    if signal != Signal::Metrics {
                        return Err(pipeline_error(
                            pipeline,
                            format!("connector {} can only be a receiver of a metrics pipeline", id),
                        ));
                    }
                    connectors_as_receiver.insert(id.clone());
                } else {
                    return Err(undefined(pipeline, "receiver", id));
                }
            }

            for id in &definition.processors {
                let factory = processors.get(id).ok_or_else(|| undefined(pipeline, "processor", id))?;
                if !factory.supports(signal) {
                    return Err(pipeline_error(
                        pipeline,
                        factory.unsupported("processor", id, signal),
                    ));
                }
                if let Some(other) = processor_owner.insert(id, pipeline) {
                    return Err(pipeline_error(
                        pipeline,
                        format!("processor {} is already used by pipeline {}", id, other),
                    ));
                }
            }

            for id in &definition.exporters {
                if let Some(factory) = exporters.get(id) {
                    if !factory.supports(signal) {
                        return Err(pipeline_error(
                            pipeline,
                            factory.unsupported("exporter", id, signal),
                        ));
                    }
                } else if connectors.get(id).is_some() {
                    if signal != Signal::Traces {
                        return Err(pipeline_error(
                            pipeline,
                            format!("connector {} can only be an exporter of a traces pipeline", id),
                        ));
                    }
                    connectors_as_exporter.insert(id.clone());
                } else {
                    return Err(undefined(pipeline, "exporter", id));
                }
            }
        }

        if let Some(id) = connectors_as_exporter.symmetric_difference(&connectors_as_receiver).next() {
            return Err(ConfigError::Component {
                kind: "connector",
                id: id.to_string(),
                message: "must be used as an exporter of a traces pipeline and as a receiver of a metrics pipeline"
                    .to_string(),
            });
        }

        let plan = Plan {
            receivers: receivers.into_configs(),
            processors: processors.into_configs(),
            connectors: connectors.into_configs(),
            exporters: exporters.into_configs(),
            pipelines: config.service.pipelines.clone(),
        };
        check_endpoints(&plan, config)?;
        Ok(plan)
    }
}

/// No two listeners of the running service may share an address. Port 0
/// asks the OS for a free port and never collides.
fn check_endpoints(plan: &Plan, config: &Config) -> Result<(), ConfigError> {
    let used: BTreeSet<&ComponentId> = plan
        .pipelines
        .values()
        .flat_map(|p| p.receivers.iter().chain(&p.exporters))
        .collect();

    let mut listeners: Vec<(String, &str)> = Vec::new();
    for (id, kind) in &plan.receivers {
        if used.contains(id) {
            let ReceiverKind::Otlp(receiver) = kind;
            for endpoint in receiver.endpoints() {
                listeners.push((format!("receiver {}", id), endpoint));
            }
        }
    }
    for (id, kind) in &plan.exporters {
        if let ExporterKind::Prometheus(prometheus) = kind {
            if used.contains(id) {
                listeners.push((format!("exporter {}", id), prometheus.endpoint.as_str()));
            }
        }
    }
    if let Some(admin) = &config.service.telemetry.admin {
        listeners.push(("admin server".to_string(), admin.endpoint.as_str()));
    }

    let mut seen: HashMap<&str, &str> = HashMap::new();
    for (owner, endpoint) in &listeners {
        if endpoint.ends_with(":0") {
            continue;
        }
        if let Some(first) = seen.insert(*endpoint, owner.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "{} and {} both listen on {}",
                first, owner, endpoint
            )));
        }
    }
    Ok(())
}
