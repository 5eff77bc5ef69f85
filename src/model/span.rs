//! Span data model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// 128-bit trace identifier. Zero is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TraceId(u128);

impl TraceId {
    pub const INVALID: TraceId = TraceId(0);

    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// Parse the 16-byte big-endian wire form
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(u128::from_be_bytes(bytes)))
    }

    /// Parse the 32 hex character form used by OTLP/JSON
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// 64-bit span identifier. Zero is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SpanId(u64);

impl SpanId {
    pub const INVALID: SpanId = SpanId(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Parse the 8-byte big-endian wire form
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(u64::from_be_bytes(bytes)))
    }

    /// Parse the 16 hex character form used by OTLP/JSON
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// OTLP span kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanKind {
    #[default]
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Unspecified => "SPAN_KIND_UNSPECIFIED",
            SpanKind::Internal => "SPAN_KIND_INTERNAL",
            SpanKind::Server => "SPAN_KIND_SERVER",
            SpanKind::Client => "SPAN_KIND_CLIENT",
            SpanKind::Producer => "SPAN_KIND_PRODUCER",
            SpanKind::Consumer => "SPAN_KIND_CONSUMER",
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => SpanKind::Internal,
            2 => SpanKind::Server,
            3 => SpanKind::Client,
            4 => SpanKind::Producer,
            5 => SpanKind::Consumer,
            _ => SpanKind::Unspecified,
        }
    }

    pub fn to_i32(self) -> i32 {
        match self {
            SpanKind::Unspecified => 0,
            SpanKind::Internal => 1,
            SpanKind::Server => 2,
            SpanKind::Client => 3,
            SpanKind::Producer => 4,
            SpanKind::Consumer => 5,
        }
    }
}

/// OTLP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

impl SpanStatus {
    /// Status code as rendered in metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Unset => "STATUS_CODE_UNSET",
            SpanStatus::Ok => "STATUS_CODE_OK",
            SpanStatus::Error => "STATUS_CODE_ERROR",
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => SpanStatus::Ok,
            2 => SpanStatus::Error,
            _ => SpanStatus::Unset,
        }
    }

    pub fn to_i32(self) -> i32 {
        match self {
            SpanStatus::Unset => 0,
            SpanStatus::Ok => 1,
            SpanStatus::Error => 2,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SpanStatus::Error)
    }
}

/// Scalar attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Int(i) => write!(f, "{}", i),
            AttributeValue::Float(v) => write!(f, "{}", v),
            AttributeValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Int(i)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Bool(b)
    }
}

/// One recorded unit of work.
///
/// Spans are never mutated after they enter a pipeline; every stage after the
/// receiver only reads them.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    /// `None` for the root of a trace
    pub parent_span_id: Option<SpanId>,
    /// Operation name
    pub name: String,
    /// Service name from resource attributes
    pub service_name: String,
    /// Instrumentation scope that produced the span
    pub scope_name: String,
    pub kind: SpanKind,
    pub start_time_unix_nano: u64,
    pub duration: Duration,
    pub status: SpanStatus,
    pub status_message: String,
    /// Span attributes in the order the producer sent them
    pub attributes: Vec<(String, AttributeValue)>,
}

impl Span {
    pub fn new(
        trace_id: TraceId,
        span_id: SpanId,
        name: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id: None,
            name: name.into(),
            service_name: service_name.into(),
            scope_name: String::new(),
            kind: SpanKind::Unspecified,
            start_time_unix_nano: 0,
            duration: Duration::ZERO,
            status: SpanStatus::Unset,
            status_message: String::new(),
            attributes: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: SpanId) -> Self {
        self.parent_span_id = Some(parent);
        self
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_start(mut self, start_time_unix_nano: u64) -> Self {
        self.start_time_unix_nano = start_time_unix_nano;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_status(mut self, status: SpanStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    pub fn end_time_unix_nano(&self) -> u64 {
        self.start_time_unix_nano
            .saturating_add(self.duration.as_nanos() as u64)
    }

    /// First attribute with the given key
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_kind_from_i32() {
        assert_eq!(SpanKind::from_i32(0), SpanKind::Unspecified);
        assert_eq!(SpanKind::from_i32(1), SpanKind::Internal);
        assert_eq!(SpanKind::from_i32(2), SpanKind::Server);
        assert_eq!(SpanKind::from_i32(3), SpanKind::Client);
        assert_eq!(SpanKind::from_i32(42), SpanKind::Unspecified);
    }

    #[test]
    fn test_trace_id_hex() {
        let id = TraceId::from_hex("5b8aa5a2d2c872e8321cf37308d69df2").unwrap();
        assert!(id.is_valid());
        assert_eq!(id.to_string(), "5b8aa5a2d2c872e8321cf37308d69df2");

        assert!(TraceId::from_hex("051581bf3cb55c13").is_none());
        assert!(TraceId::from_hex("not hex").is_none());
        assert!(!TraceId::from_bytes(&[0u8; 16]).unwrap().is_valid());
    }

    #[test]
    fn test_span_id_bytes() {
        let id = SpanId::from_bytes(&[0, 0, 0, 0, 0, 0, 1, 0]).unwrap();
        assert_eq!(id.as_u64(), 256);
        assert_eq!(id.to_string(), "0000000000000100");
        assert!(SpanId::from_bytes(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_span_builder() {
        let span = Span::new(TraceId::new(1), SpanId::new(2), "GET /items", "app-a")
            .with_parent(SpanId::new(1))
            .with_start(1_000)
            .with_duration(Duration::from_millis(5))
            .with_attribute("http.method", "GET")
            .with_attribute("http.status_code", 200);

        assert!(!span.is_root());
        assert_eq!(span.end_time_unix_nano(), 1_000 + 5_000_000);
        assert_eq!(
            span.attribute("http.status_code"),
            Some(&AttributeValue::Int(200))
        );
        assert_eq!(span.duration_ms(), 5.0);
    }
}
