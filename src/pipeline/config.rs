//! Configuration document
//!
//! ```yaml
//! receivers:
//!   otlp:
//!     protocols:
//!       grpc: { endpoint: "0.0.0.0:4317" }
//!       http: { endpoint: "0.0.0.0:4318" }
//! processors:
//!   batch: { send_batch_size: 512, timeout: 5s }
//! connectors:
//!   spanmetrics: {}
//! exporters:
//!   otlp/jaeger: { endpoint: "${JAEGER_ENDPOINT:-http://localhost:4317}" }
//!   prometheus: { endpoint: "0.0.0.0:8889" }
//! service:
//!   pipelines:
//!     traces: { receivers: [otlp], processors: [batch], exporters: [otlp/jaeger, spanmetrics] }
//!     metrics: { receivers: [spanmetrics], exporters: [prometheus] }
//! ```
//!
//! Component bodies stay as raw YAML here; each factory decodes its own.

use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::telemetry::LogConfig;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("environment variable {0} is not set and has no default")]
    MissingEnv(String),

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid id {0:?}")]
    InvalidId(String),

    #[error("unknown {kind} type {type_name:?} in {id}")]
    UnknownType {
        kind: &'static str,
        type_name: String,
        id: String,
    },

    #[error("{kind} {id}: {message}")]
    Component {
        kind: &'static str,
        id: String,
        message: String,
    },

    #[error("pipeline {pipeline} references undefined {kind} {id}")]
    UndefinedReference {
        pipeline: String,
        kind: &'static str,
        id: String,
    },

    #[error("pipeline {pipeline}: {message}")]
    Pipeline { pipeline: String, message: String },

    #[error("{0}")]
    Invalid(String),
}

/// `type[/name]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    type_name: String,
    name: Option<String>,
}

impl ComponentId {
    pub fn new(type_name: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.map(str::to_string),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

fn is_id_part(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl FromStr for ComponentId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (type_name, name) = match s.split_once('/') {
            Some((t, n)) => (t, Some(n)),
            None => (s, None),
        };
        if !is_id_part(type_name) || name.is_some_and(|n| !is_id_part(n)) {
            return Err(ConfigError::InvalidId(s.to_string()));
        }
        Ok(Self::new(type_name, name))
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}/{}", self.type_name, name),
            None => f.write_str(&self.type_name),
        }
    }
}

impl<'de> Deserialize<'de> for ComponentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Signal {
    Traces,
    Metrics,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Traces => "traces",
            Signal::Metrics => "metrics",
        }
    }
}

/// `signal[/name]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId {
    pub signal: Signal,
    pub name: Option<String>,
}

impl FromStr for PipelineId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: ComponentId = s.parse()?;
        let signal = match id.type_name() {
            "traces" => Signal::Traces,
            "metrics" => Signal::Metrics,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "pipeline {:?} has unknown signal {:?} (expected traces or metrics)",
                    s, other
                )))
            }
        };
        Ok(Self {
            signal,
            name: id.name,
        })
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}/{}", self.signal.as_str(), name),
            None => f.write_str(self.signal.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for PipelineId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The whole document
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub receivers: BTreeMap<ComponentId, serde_yaml::Value>,
    #[serde(default)]
    pub processors: BTreeMap<ComponentId, serde_yaml::Value>,
    #[serde(default)]
    pub connectors: BTreeMap<ComponentId, serde_yaml::Value>,
    #[serde(default)]
    pub exporters: BTreeMap<ComponentId, serde_yaml::Value>,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    pub pipelines: BTreeMap<PipelineId, PipelineConfig>,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub logs: LogConfig,
    /// Admin server for health and internal counters; off when absent
    #[serde(default)]
    pub admin: Option<AdminConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownConfig {
    /// Upper bound on draining every queue after receivers stop
    #[serde(default = "default_drain_timeout", with = "duration_serde")]
    pub drain_timeout: Duration,
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub receivers: Vec<ComponentId>,
    #[serde(default)]
    pub processors: Vec<ComponentId>,
    pub exporters: Vec<ComponentId>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Substitute environment variables, then parse
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let text = substitute_env(text, |var| std::env::var(var).ok())?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

/// Expand `${VAR}`, `${env:VAR}` and `${VAR:-default}`. Comment text is
/// left untouched.
pub fn substitute_env<F>(text: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let pattern = Regex::new(r"\$\{(?:env:)?([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    let mut missing = None;
    let mut expanded = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let (content, comment) = line.split_at(comment_start(line).unwrap_or(line.len()));
        let content = pattern.replace_all(content, |caps: &Captures| {
            let var = &caps[1];
            match lookup(var) {
                Some(value) => value,
                None => match caps.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => {
                        missing.get_or_insert_with(|| var.to_string());
                        String::new()
                    }
                },
            }
        });
        expanded.push_str(&content);
        expanded.push_str(comment);
    }

    match missing {
        Some(var) => Err(ConfigError::MissingEnv(var)),
        None => Ok(expanded),
    }
}

/// Byte offset of a YAML comment: a `#` at line start or after whitespace,
/// outside quotes
fn comment_start(line: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut prev: Option<char> = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (None, '#') if prev.map_or(true, char::is_whitespace) => return Some(i),
            (None, '"' | '\'') if prev.map_or(true, |p| p.is_whitespace() || matches!(p, ':' | '[' | '{' | ',')) => {
                quote = Some(c)
            }
            (Some(q), c) if c == q => quote = None,
            _ => {}
        }
        prev = Some(c);
    }
    None
}

/// Decode a component body into its typed config. An empty body (`debug:`)
/// means all defaults.
pub fn decode_body<T>(kind: &'static str, id: &ComponentId, body: &serde_yaml::Value) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned,
{
    let body = match body {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(Default::default()),
        other => other.clone(),
    };
    serde_yaml::from_value(body).map_err(|e| ConfigError::Component {
        kind,
        id: id.to_string(),
        message: e.to_string(),
    })
}

/// Durations as `"250ms"`, `"5s"`, `"1m"`, `"1h"` or integer milliseconds
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        Millis(u64),
        Text(String),
    }

    impl DurationHelper {
        fn into_duration(self) -> Result<Duration, String> {
            match self {
                DurationHelper::Millis(ms) => Ok(Duration::from_millis(ms)),
                DurationHelper::Text(text) => parse(&text),
            }
        }
    }

    pub fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let split = text
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(text.len());
        let (number, unit) = text.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration {:?}", text))?;

        let seconds = match unit.trim() {
            "ns" => value / 1e9,
            "us" | "µs" => value / 1e6,
            "ms" | "" => value / 1e3,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            other => return Err(format!("invalid duration unit {:?} in {:?}", other, text)),
        };
        Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration {:?}: {}", text, e))
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        DurationHelper::deserialize(deserializer)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }

    /// Same formats, for a list
    pub mod list {
        use super::DurationHelper;
        use serde::{Deserialize, Deserializer};
        use std::time::Duration;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Vec::<DurationHelper>::deserialize(deserializer)?
                .into_iter()
                .map(|d| d.into_duration().map_err(serde::de::Error::custom))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
receivers:
  otlp:
    protocols:
      grpc:
        endpoint: 127.0.0.1:4317
processors:
  batch:
    timeout: 5s
connectors:
  spanmetrics:
exporters:
  otlp/jaeger:
    endpoint: http://jaeger:4317
  prometheus:
    endpoint: 0.0.0.0:8889
service:
  telemetry:
    logs:
      level: debug
  pipelines:
    traces:
      receivers: [otlp]
      processors: [batch]
      exporters: [otlp/jaeger, spanmetrics]
    metrics/red:
      receivers: [spanmetrics]
      exporters: [prometheus]
"#;

    #[test]
    fn test_parse_document() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.receivers.len(), 1);
        let spanmetrics: ComponentId = "spanmetrics".parse().unwrap();
        assert!(config.connectors[&spanmetrics].is_null());
        assert_eq!(config.service.telemetry.logs.level, "debug");
        assert_eq!(config.service.shutdown.drain_timeout, Duration::from_secs(10));

        let ids: Vec<String> = config.service.pipelines.keys().map(|p| p.to_string()).collect();
        assert_eq!(ids, vec!["traces", "metrics/red"]);

        let traces_id: PipelineId = "traces".parse().unwrap();
        let traces = &config.service.pipelines[&traces_id];
        assert_eq!(traces.exporters[0].type_name(), "otlp");
        assert_eq!(traces.exporters[0].name(), Some("jaeger"));
    }

    #[test]
    fn test_component_id() {
        let id: ComponentId = "otlphttp/tempo".parse().unwrap();
        assert_eq!(id.type_name(), "otlphttp");
        assert_eq!(id.to_string(), "otlphttp/tempo");

        assert!("".parse::<ComponentId>().is_err());
        assert!("otlp/".parse::<ComponentId>().is_err());
        assert!("a b".parse::<ComponentId>().is_err());
    }

    #[test]
    fn test_unknown_signal_rejected() {
        let text = SAMPLE.replace("metrics/red:", "logs:");
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let text = SAMPLE.replace("pipelines:", "pipelins: {}\n  pipelines:");
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn test_env_substitution() {
        let lookup = |var: &str| match var {
            "JAEGER" => Some("http://jaeger:4317".to_string()),
            _ => None,
        };

        assert_eq!(
            substitute_env("endpoint: ${JAEGER}", lookup).unwrap(),
            "endpoint: http://jaeger:4317"
        );
        assert_eq!(
            substitute_env("endpoint: ${env:JAEGER}", lookup).unwrap(),
            "endpoint: http://jaeger:4317"
        );
        assert_eq!(
            substitute_env("endpoint: ${TEMPO:-http://tempo:4318}", lookup).unwrap(),
            "endpoint: http://tempo:4318"
        );
        assert!(matches!(
            substitute_env("endpoint: ${TEMPO}", lookup),
            Err(ConfigError::MissingEnv(var)) if var == "TEMPO"
        ));
    }

    #[test]
    fn test_env_substitution_skips_comments() {
        let lookup = |var: &str| (var == "JAEGER").then(|| "jaeger:4317".to_string());

        let text = "# set ${TEMPO} before start\nendpoint: ${JAEGER} # not ${TEMPO}\ntag: \"a # ${JAEGER}\"\n";
        assert_eq!(
            substitute_env(text, lookup).unwrap(),
            "# set ${TEMPO} before start\nendpoint: jaeger:4317 # not ${TEMPO}\ntag: \"a # jaeger:4317\"\n"
        );
        assert!(substitute_env("key: ${TEMPO}#x", lookup).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), SAMPLE).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.exporters.len(), 2);

        assert!(matches!(
            Config::load("/nonexistent/spanline.yaml"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_durations() {
        assert_eq!(duration_serde::parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(duration_serde::parse("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(duration_serde::parse("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(duration_serde::parse("100us").unwrap(), Duration::from_micros(100));
        assert_eq!(duration_serde::parse("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(duration_serde::parse("soon").is_err());
        assert!(duration_serde::parse("5 parsecs").is_err());
        assert!(duration_serde::parse("99999999999999999999999h")
            .unwrap_err()
            .contains("invalid duration"));

        let shutdown: ShutdownConfig = serde_yaml::from_str("drain_timeout: 750").unwrap();
        assert_eq!(shutdown.drain_timeout, Duration::from_millis(750));
    }
}
