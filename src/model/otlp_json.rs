//! OTLP JSON format structures (for HTTP/JSON ingest and export)
//!
//! OTLP/JSON differs from the protobuf JSON mapping in two places: trace and
//! span ids are hex strings, and 64-bit integers travel as decimal strings.

use opentelemetry_proto::tonic::collector::trace::v1 as collector;
use opentelemetry_proto::tonic::common::v1 as common;
use opentelemetry_proto::tonic::resource::v1 as resource;
use opentelemetry_proto::tonic::trace::v1 as trace;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTraceServiceRequest {
    #[serde(default)]
    pub resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpans {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
    #[serde(default)]
    pub scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSpans {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<InstrumentationScope>,
    #[serde(default)]
    pub spans: Vec<Span>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationScope {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub span_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_span_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_state: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: i32,
    #[serde(default)]
    pub start_time_unix_nano: I64String,
    #[serde(default)]
    pub end_time_unix_nano: I64String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: AnyValue,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    /// OTLP sends as string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_value: Option<I64String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub double_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default)]
    pub code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTraceServiceResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_success: Option<ExportTracePartialSuccess>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTracePartialSuccess {
    #[serde(default)]
    pub rejected_spans: I64String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

impl From<&collector::ExportTraceServiceResponse> for ExportTraceServiceResponse {
    fn from(response: &collector::ExportTraceServiceResponse) -> Self {
        Self {
            partial_success: response.partial_success.as_ref().map(|p| ExportTracePartialSuccess {
                rejected_spans: I64String(p.rejected_spans),
                error_message: p.error_message.clone(),
            }),
        }
    }
}

/// 64-bit integer that serializes as a decimal string and accepts either form
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct I64String(pub i64);

impl Serialize for I64String {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for I64String {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Str(String),
            Num(i64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Str(s) => s
                .parse::<i64>()
                .map(I64String)
                .map_err(serde::de::Error::custom),
            Repr::Num(n) => Ok(I64String(n)),
        }
    }
}

/// Hex ids that fail to decode become empty and are rejected by validation
fn decode_hex(s: &str) -> Vec<u8> {
    hex::decode(s).unwrap_or_default()
}

impl AnyValue {
    fn into_proto(self) -> common::AnyValue {
        use common::any_value::Value;

        let value = if let Some(s) = self.string_value {
            Some(Value::StringValue(s))
        } else if let Some(i) = self.int_value {
            Some(Value::IntValue(i.0))
        } else if let Some(d) = self.double_value {
            Some(Value::DoubleValue(d))
        } else {
            self.bool_value.map(Value::BoolValue)
        };
        common::AnyValue { value }
    }

    fn from_proto(value: &common::AnyValue) -> Self {
        use common::any_value::Value;

        let mut out = AnyValue::default();
        match value.value.as_ref() {
            Some(Value::StringValue(s)) => out.string_value = Some(s.clone()),
            Some(Value::IntValue(i)) => out.int_value = Some(I64String(*i)),
            Some(Value::DoubleValue(d)) => out.double_value = Some(*d),
            Some(Value::BoolValue(b)) => out.bool_value = Some(*b),
            _ => {}
        }
        out
    }
}

fn attrs_into_proto(attrs: Vec<KeyValue>) -> Vec<common::KeyValue> {
    attrs
        .into_iter()
        .map(|kv| common::KeyValue {
            key: kv.key,
            value: Some(kv.value.into_proto()),
            ..Default::default()
        })
        .collect()
}

fn attrs_from_proto(attrs: &[common::KeyValue]) -> Vec<KeyValue> {
    attrs
        .iter()
        .map(|kv| KeyValue {
            key: kv.key.clone(),
            value: kv.value.as_ref().map(AnyValue::from_proto).unwrap_or_default(),
        })
        .collect()
}

/// Negative timestamps are clamped to zero
fn to_u64(v: I64String) -> u64 {
    u64::try_from(v.0).unwrap_or(0)
}

impl From<ExportTraceServiceRequest> for collector::ExportTraceServiceRequest {
    fn from(request: ExportTraceServiceRequest) -> Self {
        collector::ExportTraceServiceRequest {
            resource_spans: request
                .resource_spans
                .into_iter()
                .map(|rs| trace::ResourceSpans {
                    resource: rs.resource.map(|r| resource::Resource {
                        attributes: attrs_into_proto(r.attributes),
                        ..Default::default()
                    }),
                    scope_spans: rs
                        .scope_spans
                        .into_iter()
                        .map(|ss| trace::ScopeSpans {
                            scope: ss.scope.map(|s| common::InstrumentationScope {
                                name: s.name,
                                version: s.version,
                                ..Default::default()
                            }),
                            spans: ss.spans.into_iter().map(span_into_proto).collect(),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                })
                .collect(),
        }
    }
}

fn span_into_proto(span: Span) -> trace::Span {
    trace::Span {
        trace_id: decode_hex(&span.trace_id),
        span_id: decode_hex(&span.span_id),
        parent_span_id: decode_hex(&span.parent_span_id),
        trace_state: span.trace_state,
        name: span.name,
        kind: span.kind,
        start_time_unix_nano: to_u64(span.start_time_unix_nano),
        end_time_unix_nano: to_u64(span.end_time_unix_nano),
        attributes: attrs_into_proto(span.attributes),
        status: span.status.map(|s| trace::Status {
            message: s.message,
            code: s.code,
        }),
        ..Default::default()
    }
}

impl From<&collector::ExportTraceServiceRequest> for ExportTraceServiceRequest {
    fn from(request: &collector::ExportTraceServiceRequest) -> Self {
        ExportTraceServiceRequest {
            resource_spans: request
                .resource_spans
                .iter()
                .map(|rs| ResourceSpans {
                    resource: rs.resource.as_ref().map(|r| Resource {
                        attributes: attrs_from_proto(&r.attributes),
                    }),
                    scope_spans: rs
                        .scope_spans
                        .iter()
                        .map(|ss| ScopeSpans {
                            scope: ss.scope.as_ref().map(|s| InstrumentationScope {
                                name: s.name.clone(),
                                version: s.version.clone(),
                            }),
                            spans: ss.spans.iter().map(span_from_proto).collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

fn span_from_proto(span: &trace::Span) -> Span {
    Span {
        trace_id: hex::encode(&span.trace_id),
        span_id: hex::encode(&span.span_id),
        parent_span_id: hex::encode(&span.parent_span_id),
        trace_state: span.trace_state.clone(),
        name: span.name.clone(),
        kind: span.kind,
        start_time_unix_nano: I64String(span.start_time_unix_nano as i64),
        end_time_unix_nano: I64String(span.end_time_unix_nano as i64),
        attributes: attrs_from_proto(&span.attributes),
        status: span.status.as_ref().map(|s| Status {
            code: s.code,
            message: s.message.clone(),
        }),
    }
}
