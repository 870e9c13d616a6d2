//! OpenTelemetry span decoding.

pub mod attrs;
pub mod decode;
pub mod semconv;

pub use attrs::{AttrMap, AttrValue};
pub use decode::{decode_export_request, Span, SpanEvent, SpanLink, SpanStatus};
pub use semconv::{IndexedGenAi, TranscriptSemConv};
