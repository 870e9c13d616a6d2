//! Thread reconstruction: spans of one run → transcripts.

pub mod extract;
pub mod threads;

pub use extract::{extract_span, SpanExtract};
pub use threads::{matching_prefix, messages_match, ConversationThread, ThreadPool};

use crate::model::Transcript;
use crate::otel::{Span, TranscriptSemConv};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

/// Everything the spans of one run contribute to its assembled form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconstruction {
    pub transcripts: Vec<Transcript>,
    pub run_metadata: Map<String, Value>,
    pub run_scores: Map<String, Value>,
}

/// Deduplicate by `(trace_id, span_id)` keeping the latest arrival, then
/// order by `(start, end, span_id)`.
pub fn canonical_span_order(spans: Vec<Span>) -> Vec<Span> {
    let mut latest: HashMap<(String, String), Span> = HashMap::with_capacity(spans.len());
    for span in spans {
        latest.insert((span.trace_id.clone(), span.span_id.clone()), span);
    }
    let mut ordered: Vec<Span> = latest.into_values().collect();
    ordered.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then(a.end_time.cmp(&b.end_time))
            .then_with(|| a.span_id.cmp(&b.span_id))
            .then_with(|| a.trace_id.cmp(&b.trace_id))
    });
    ordered
}

/// Rebuild the transcripts of `run_id` from its spans (arrival order).
pub fn reconstruct_run(run_id: &str, spans: Vec<Span>, conv: &dyn TranscriptSemConv) -> Reconstruction {
    let spans = canonical_span_order(spans);
    let mut out = Reconstruction::default();
    let mut pool = ThreadPool::new();

    for (index, span) in spans.iter().enumerate() {
        let extract = extract_span(span, conv);
        out.run_metadata.extend(extract.run_metadata);
        out.run_scores.extend(extract.run_scores);
        pool.absorb(index, extract.messages);
    }

    let threads = pool.into_threads();
    debug!(run_id, spans = spans.len(), threads = threads.len(), "reconstructed threads");

    for thread in threads {
        let transcript = build_transcript(run_id, &spans, conv, thread);
        let mut id = transcript.id.clone();
        let mut n = 1;
        while out.transcripts.iter().any(|t| t.id == id) {
            n += 1;
            id = format!("{}-{}", transcript.id, n);
        }
        out.transcripts.push(Transcript { id, ..transcript });
    }
    out
}

fn build_transcript(
    run_id: &str,
    spans: &[Span],
    conv: &dyn TranscriptSemConv,
    thread: ConversationThread,
) -> Transcript {
    // Latest attribution wins.
    let latest = |key: &str| {
        thread
            .span_indices
            .iter()
            .rev()
            .find_map(|&i| spans[i].routing_attr(key))
    };
    let id = latest(conv.transcript_id()).unwrap_or_else(|| {
        let first = thread
            .span_indices
            .first()
            .map(|&i| spans[i].span_id.as_str())
            .unwrap_or_default();
        derived_transcript_id(run_id, first)
    });

    Transcript {
        id,
        agent_run_id: run_id.to_string(),
        transcript_group_id: latest(conv.transcript_group_id()),
        name: None,
        description: None,
        messages: thread.messages,
        metadata: Map::new(),
    }
}

/// Stable id for a thread no span named: derived from the run and the
/// thread's first span.
pub fn derived_transcript_id(run_id: &str, first_span_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(first_span_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}
