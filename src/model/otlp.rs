//! Conversion between OTLP protobuf messages and the span model

use std::time::Duration;

use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{
    any_value, AnyValue, InstrumentationScope, KeyValue,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{
    ResourceSpans, ScopeSpans, Span as ProtoSpan, Status,
};

use super::span::{AttributeValue, Span, SpanId, SpanKind, SpanStatus, TraceId};

/// Resource attribute carrying the service name
pub const SERVICE_NAME_KEY: &str = "service.name";

/// Service name used when the resource does not carry one
pub const UNKNOWN_SERVICE: &str = "unknown_service";

/// Structural problems that keep a span out of every pipeline
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedSpan {
    #[error("trace id must be 16 non-zero bytes")]
    InvalidTraceId,

    #[error("span id must be 8 non-zero bytes")]
    InvalidSpanId,

    #[error("parent span id must be empty or 8 bytes")]
    InvalidParentSpanId,

    #[error("span ends before it starts")]
    EndBeforeStart,
}

/// Result of decoding one export request
#[derive(Debug, Default)]
pub struct DecodedSpans {
    /// Well-formed spans in request order
    pub spans: Vec<Span>,
    /// Number of spans rejected as malformed
    pub rejected: usize,
    /// First rejection reason, reported back to the client
    pub first_error: Option<MalformedSpan>,
}

impl DecodedSpans {
    pub fn total(&self) -> usize {
        self.spans.len() + self.rejected
    }
}

/// Decode and validate every span of an export request.
///
/// Malformed spans are counted and left out; their siblings are unaffected.
pub fn decode_request(request: ExportTraceServiceRequest) -> DecodedSpans {
    let mut decoded = DecodedSpans::default();

    for resource_spans in request.resource_spans {
        let service_name = resource_spans
            .resource
            .as_ref()
            .and_then(|r| {
                r.attributes
                    .iter()
                    .find(|kv| kv.key == SERVICE_NAME_KEY)
                    .and_then(|kv| kv.value.as_ref())
                    .and_then(to_attribute_value)
            })
            .map(|v| v.to_string())
            .unwrap_or_else(|| UNKNOWN_SERVICE.to_string());

        for scope_spans in resource_spans.scope_spans {
            let scope_name = scope_spans
                .scope
                .as_ref()
                .map(|s| s.name.clone())
                .unwrap_or_default();

            for span in scope_spans.spans {
                match convert_span(span, &service_name, &scope_name) {
                    Ok(span) => decoded.spans.push(span),
                    Err(e) => {
                        decoded.rejected += 1;
                        if decoded.first_error.is_none() {
                            decoded.first_error = Some(e);
                        }
                    }
                }
            }
        }
    }

    decoded
}

/// Validate and convert a single protobuf span
pub fn convert_span(
    span: ProtoSpan,
    service_name: &str,
    scope_name: &str,
) -> Result<Span, MalformedSpan> {
    let trace_id = TraceId::from_bytes(&span.trace_id)
        .filter(|id| id.is_valid())
        .ok_or(MalformedSpan::InvalidTraceId)?;
    let span_id = SpanId::from_bytes(&span.span_id)
        .filter(|id| id.is_valid())
        .ok_or(MalformedSpan::InvalidSpanId)?;

    let parent_span_id = if span.parent_span_id.is_empty() {
        None
    } else {
        let parent =
            SpanId::from_bytes(&span.parent_span_id).ok_or(MalformedSpan::InvalidParentSpanId)?;
        // an all-zero parent is how some SDKs spell "no parent"
        parent.is_valid().then_some(parent)
    };

    if span.end_time_unix_nano < span.start_time_unix_nano {
        return Err(MalformedSpan::EndBeforeStart);
    }

    let attributes = span
        .attributes
        .iter()
        .filter_map(|kv| {
            kv.value
                .as_ref()
                .and_then(to_attribute_value)
                .map(|v| (kv.key.clone(), v))
        })
        .collect();

    let (status, status_message) = span
        .status
        .map(|s| (SpanStatus::from_i32(s.code), s.message))
        .unwrap_or_default();

    Ok(Span {
        trace_id,
        span_id,
        parent_span_id,
        name: span.name,
        service_name: service_name.to_string(),
        scope_name: scope_name.to_string(),
        kind: SpanKind::from_i32(span.kind),
        start_time_unix_nano: span.start_time_unix_nano,
        duration: Duration::from_nanos(span.end_time_unix_nano - span.start_time_unix_nano),
        status,
        status_message,
        attributes,
    })
}

/// Scalar view of an OTLP value; arrays, maps and bytes are skipped
pub fn to_attribute_value(value: &AnyValue) -> Option<AttributeValue> {
    match value.value.as_ref()? {
        any_value::Value::StringValue(s) => Some(AttributeValue::String(s.clone())),
        any_value::Value::IntValue(i) => Some(AttributeValue::Int(*i)),
        any_value::Value::DoubleValue(d) => Some(AttributeValue::Float(*d)),
        any_value::Value::BoolValue(b) => Some(AttributeValue::Bool(*b)),
        _ => None,
    }
}

pub fn to_any_value(value: &AttributeValue) -> AnyValue {
    let value = match value {
        AttributeValue::String(s) => any_value::Value::StringValue(s.clone()),
        AttributeValue::Int(i) => any_value::Value::IntValue(*i),
        AttributeValue::Float(f) => any_value::Value::DoubleValue(*f),
        AttributeValue::Bool(b) => any_value::Value::BoolValue(*b),
    };
    AnyValue { value: Some(value) }
}

fn key_value(key: &str, value: &AttributeValue) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(to_any_value(value)),
        ..Default::default()
    }
}

fn to_proto_span(span: &Span) -> ProtoSpan {
    ProtoSpan {
        trace_id: span.trace_id.to_bytes().to_vec(),
        span_id: span.span_id.to_bytes().to_vec(),
        parent_span_id: span
            .parent_span_id
            .map(|p| p.to_bytes().to_vec())
            .unwrap_or_default(),
        name: span.name.clone(),
        kind: span.kind.to_i32(),
        start_time_unix_nano: span.start_time_unix_nano,
        end_time_unix_nano: span.end_time_unix_nano(),
        attributes: span
            .attributes
            .iter()
            .map(|(k, v)| key_value(k, v))
            .collect(),
        status: Some(Status {
            message: span.status_message.clone(),
            code: span.status.to_i32(),
        }),
        ..Default::default()
    }
}

/// Build an export request, regrouping spans by service and scope.
///
/// Groups appear in first-seen order and spans keep their batch order inside
/// each group.
pub fn encode_request(spans: &[Span]) -> ExportTraceServiceRequest {
    let mut resource_spans: Vec<ResourceSpans> = Vec::new();

    for span in spans {
        let rs_idx = match resource_spans
            .iter()
            .position(|rs| resource_service_name(rs) == Some(span.service_name.as_str()))
        {
            Some(idx) => idx,
            None => {
                resource_spans.push(ResourceSpans {
                    resource: Some(Resource {
                        attributes: vec![key_value(
                            SERVICE_NAME_KEY,
                            &AttributeValue::String(span.service_name.clone()),
                        )],
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                resource_spans.len() - 1
            }
        };

        let scopes = &mut resource_spans[rs_idx].scope_spans;
        let scope_idx = match scopes.iter().position(|ss| {
            ss.scope.as_ref().map(|s| s.name.as_str()).unwrap_or_default() == span.scope_name
        }) {
            Some(idx) => idx,
            None => {
                scopes.push(ScopeSpans {
                    scope: Some(InstrumentationScope {
                        name: span.scope_name.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                scopes.len() - 1
            }
        };

        scopes[scope_idx].spans.push(to_proto_span(span));
    }

    ExportTraceServiceRequest { resource_spans }
}

fn resource_service_name(rs: &ResourceSpans) -> Option<&str> {
    rs.resource.as_ref().and_then(|r| {
        r.attributes
            .iter()
            .find(|kv| kv.key == SERVICE_NAME_KEY)
            .and_then(|kv| kv.value.as_ref())
            .and_then(|v| match v.value.as_ref() {
                Some(any_value::Value::StringValue(s)) => Some(s.as_str()),
                _ => None,
            })
    })
}
