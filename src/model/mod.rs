//! Span and metric data model, OTLP wire conversions

mod batch;
mod metric;
pub mod otlp;
pub mod otlp_json;
mod span;

pub use batch::{Batch, SharedBatch};
pub use metric::{MetricFamily, MetricType, Sample};
pub use otlp::{decode_request, encode_request, DecodedSpans, MalformedSpan};
pub use span::{AttributeValue, Span, SpanId, SpanKind, SpanStatus, TraceId};
