//! Ingestion boundary.
//!
//! Every call makes sure the collection exists, appends the fragment(s) and
//! marks the affected runs dirty in one transaction, then asks for a
//! processing pass. Callers only see whether the write itself succeeded.

use crate::error::{IngestError, IngestResult, StoreError};
use crate::model::{FieldsPayload, FragmentCategory, FragmentKey, MetadataPayload, ScorePayload};
use crate::otel::{decode_export_request, IndexedGenAi, Span, TranscriptSemConv};
use crate::queue::PassRequester;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Ingestor {
    store: Store,
    requester: Arc<dyn PassRequester>,
    conv: Arc<dyn TranscriptSemConv + Send + Sync>,
}

impl Ingestor {
    pub fn new(store: Store, requester: Arc<dyn PassRequester>) -> Self {
        Self {
            store,
            requester,
            conv: Arc::new(IndexedGenAi),
        }
    }

    pub fn with_semconv(mut self, conv: Arc<dyn TranscriptSemConv + Send + Sync>) -> Self {
        self.conv = conv;
        self
    }

    /// Decode an OTLP/JSON trace export and store its spans, one fragment
    /// per run. Returns the number of spans decoded.
    pub fn submit_spans(&self, collection_id: &str, payload: &[u8]) -> IngestResult<usize> {
        require("collection_id", collection_id)?;
        let spans = decode_export_request(payload)?;
        let decoded = spans.len();

        let mut by_run: BTreeMap<String, Vec<Span>> = BTreeMap::new();
        for span in spans {
            if let Some(claimed) = span.routing_attr(self.conv.collection_id()) {
                if claimed != collection_id {
                    debug!(collection = %collection_id, span_collection = %claimed, "span names another collection; ingestion call wins");
                }
            }
            match span.routing_attr(self.conv.agent_run_id()) {
                Some(run_id) => by_run.entry(run_id).or_default().push(span),
                None => {
                    warn!(collection = %collection_id, span_id = %span.span_id, "span has no agent_run_id; dropped");
                }
            }
        }

        let mut batch = Vec::with_capacity(by_run.len());
        for (run_id, spans) in &by_run {
            let key = FragmentKey::collection(collection_id).with_run(run_id);
            let payload = serde_json::to_value(spans).map_err(StoreError::from)?;
            batch.push((key, FragmentCategory::Span, payload));
        }
        self.store.append_batch(collection_id, &batch)?;
        if !batch.is_empty() {
            self.requester.request_processing_pass(collection_id);
        }

        info!(collection = %collection_id, spans = decoded, runs = by_run.len(), "spans ingested");
        Ok(decoded)
    }

    pub fn submit_score(
        &self,
        collection_id: &str,
        run_id: &str,
        name: &str,
        value: Value,
        timestamp: DateTime<Utc>,
    ) -> IngestResult<()> {
        require("score name", name)?;
        let payload = ScorePayload {
            name: name.to_string(),
            value,
            timestamp,
        };
        self.submit_one(
            FragmentKey::collection(collection_id).with_run(run_id),
            FragmentCategory::Score,
            &payload,
        )
    }

    pub fn submit_metadata(
        &self,
        collection_id: &str,
        run_id: &str,
        metadata: Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> IngestResult<()> {
        let payload = MetadataPayload {
            metadata,
            timestamp,
        };
        self.submit_one(
            FragmentKey::collection(collection_id).with_run(run_id),
            FragmentCategory::Metadata,
            &payload,
        )
    }

    /// Fields: `name`, `description`, `parent_transcript_group_id`, `metadata`.
    pub fn submit_transcript_group_metadata(
        &self,
        collection_id: &str,
        run_id: &str,
        group_id: &str,
        fields: Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> IngestResult<()> {
        require("transcript_group_id", group_id)?;
        self.submit_one(
            FragmentKey::collection(collection_id)
                .with_run(run_id)
                .with_group(group_id),
            FragmentCategory::TranscriptGroupMetadata,
            &FieldsPayload { fields, timestamp },
        )
    }

    /// Fields: `name`, `description`, `metadata`.
    pub fn submit_transcript_metadata(
        &self,
        collection_id: &str,
        run_id: &str,
        transcript_id: &str,
        fields: Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> IngestResult<()> {
        require("transcript_id", transcript_id)?;
        self.submit_one(
            FragmentKey::collection(collection_id)
                .with_run(run_id)
                .with_transcript(transcript_id),
            FragmentCategory::TranscriptMetadata,
            &FieldsPayload { fields, timestamp },
        )
    }

    fn submit_one(
        &self,
        key: FragmentKey,
        category: FragmentCategory,
        payload: &impl Serialize,
    ) -> IngestResult<()> {
        require("collection_id", &key.collection_id)?;
        let run_id = key.agent_run_id.clone().unwrap_or_default();
        require("agent_run_id", &run_id)?;

        let value = serde_json::to_value(payload).map_err(StoreError::from)?;
        let collection_id = key.collection_id.clone();
        let ids = self
            .store
            .append_batch(&collection_id, &[(key, category, value)])?;
        self.requester.request_processing_pass(&collection_id);
        debug!(collection = %collection_id, run_id = %run_id, fragment_id = ?ids.first(), category = category.as_str(), "fragment stored");
        Ok(())
    }
}

fn require(what: &str, value: &str) -> IngestResult<()> {
    if value.trim().is_empty() {
        return Err(IngestError::Invalid {
            message: format!("{} must not be empty", what),
        });
    }
    Ok(())
}
