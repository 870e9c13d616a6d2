//! Run assembly: reconstructed transcripts plus explicit score, metadata, and
//! group fragments → one [`AgentRun`], validated and persisted.

use crate::error::ReconstructionError;
use crate::model::{
    AgentRun, FieldsPayload, Fragment, FragmentCategory, FragmentKey, MetadataPayload, ScorePayload,
    Transcript, TranscriptGroup,
};
use crate::otel::{Span, TranscriptSemConv};
use crate::reconstruct::{reconstruct_run, Reconstruction};
use crate::store::Store;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw fragments of one run, in arrival order per category.
#[derive(Debug, Clone, Default)]
pub struct RunFragments {
    pub spans: Vec<Span>,
    pub scores: Vec<ScorePayload>,
    pub metadata: Vec<MetadataPayload>,
    /// `(group id, fields)`
    pub group_fields: Vec<(String, FieldsPayload)>,
    /// `(transcript id, fields)`
    pub transcript_fields: Vec<(String, FieldsPayload)>,
}

impl RunFragments {
    pub fn load(store: &Store, collection_id: &str, run_id: &str) -> Result<Self, ReconstructionError> {
        let key = FragmentKey::collection(collection_id).with_run(run_id);

        let mut spans = Vec::new();
        for stored in store.query(&key, FragmentCategory::Span)? {
            let batch: Vec<Span> = parse_payload(&stored, FragmentCategory::Span)?;
            spans.extend(batch);
        }

        let scores: Vec<ScorePayload> = store
            .query(&key, FragmentCategory::Score)?
            .iter()
            .map(|s| parse_payload(s, FragmentCategory::Score))
            .collect::<Result<_, _>>()?;
        let metadata: Vec<MetadataPayload> = store
            .query(&key, FragmentCategory::Metadata)?
            .iter()
            .map(|s| parse_payload(s, FragmentCategory::Metadata))
            .collect::<Result<_, _>>()?;

        let mut group_fields = Vec::new();
        for stored in store.query(&key, FragmentCategory::TranscriptGroupMetadata)? {
            let fields = parse_payload(&stored, FragmentCategory::TranscriptGroupMetadata)?;
            let group_id = keyed_id(&stored, stored.key.transcript_group_id.as_deref())?;
            group_fields.push((group_id, fields));
        }

        let mut transcript_fields = Vec::new();
        for stored in store.query(&key, FragmentCategory::TranscriptMetadata)? {
            let fields = parse_payload(&stored, FragmentCategory::TranscriptMetadata)?;
            let transcript_id = keyed_id(&stored, stored.key.transcript_id.as_deref())?;
            transcript_fields.push((transcript_id, fields));
        }

        Ok(Self {
            spans,
            scores,
            metadata,
            group_fields,
            transcript_fields,
        })
    }
}

fn parse_payload<T: DeserializeOwned>(
    stored: &Fragment,
    category: FragmentCategory,
) -> Result<T, ReconstructionError> {
    serde_json::from_value(stored.payload.clone()).map_err(|e| ReconstructionError::BadFragment {
        fragment_id: stored.id,
        category: category.as_str(),
        message: e.to_string(),
    })
}

fn keyed_id(stored: &Fragment, id: Option<&str>) -> Result<String, ReconstructionError> {
    id.map(String::from)
        .ok_or_else(|| ReconstructionError::InvalidStructure {
            message: format!("fragment {} is missing its key id", stored.id),
        })
}

/// Pure assembly. `stored_groups` resolves which referenced group ids
/// already exist in storage.
pub fn assemble_run(
    collection_id: &str,
    run_id: &str,
    reconstruction: Reconstruction,
    fragments: &RunFragments,
    stored_groups: impl FnOnce(&BTreeSet<String>) -> Result<BTreeSet<String>, ReconstructionError>,
) -> Result<AgentRun, ReconstructionError> {
    let Reconstruction {
        mut transcripts,
        run_metadata,
        run_scores,
    } = reconstruction;

    // Span-derived values first; explicit fragments override on collision.
    let mut metadata = run_metadata;
    for payload in &fragments.metadata {
        metadata.extend(payload.metadata.clone());
    }
    let mut scores = run_scores;
    for payload in &fragments.scores {
        scores.insert(payload.name.clone(), payload.value.clone());
    }

    let groups = order_groups(run_id, build_groups(run_id, &fragments.group_fields));
    apply_transcript_fields(&mut transcripts, &fragments.transcript_fields);

    let batch: BTreeSet<&str> = groups.iter().map(|g| g.id.as_str()).collect();
    let unresolved: BTreeSet<String> = transcripts
        .iter()
        .filter_map(|t| t.transcript_group_id.as_deref())
        .filter(|id| !batch.contains(id))
        .map(String::from)
        .collect();
    if !unresolved.is_empty() {
        let known = stored_groups(&unresolved)?;
        for transcript in &mut transcripts {
            let missing = transcript
                .transcript_group_id
                .as_ref()
                .is_some_and(|g| unresolved.contains(g) && !known.contains(g));
            if missing {
                warn!(
                    run_id,
                    transcript_id = %transcript.id,
                    group_id = ?transcript.transcript_group_id,
                    "dropping reference to unknown transcript group"
                );
                transcript.transcript_group_id = None;
            }
        }
    }

    Ok(AgentRun {
        id: run_id.to_string(),
        collection_id: collection_id.to_string(),
        metadata,
        scores,
        transcript_groups: groups,
        transcripts,
    })
}

/// Fold group field fragments, later fields overriding earlier ones. Groups
/// come out in order of first appearance; parents absent from the batch are
/// dropped.
pub fn build_groups(run_id: &str, group_fields: &[(String, FieldsPayload)]) -> Vec<TranscriptGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, TranscriptGroup> = BTreeMap::new();

    for (group_id, payload) in group_fields {
        let group = groups.entry(group_id.clone()).or_insert_with(|| {
            order.push(group_id.clone());
            TranscriptGroup {
                id: group_id.clone(),
                agent_run_id: run_id.to_string(),
                name: None,
                description: None,
                parent_transcript_group_id: None,
                metadata: Map::new(),
            }
        });
        for (field, value) in &payload.fields {
            match field.as_str() {
                "name" => group.name = text_value(value),
                "description" => group.description = text_value(value),
                "parent_transcript_group_id" => group.parent_transcript_group_id = text_value(value),
                "metadata" => merge_metadata(&mut group.metadata, value),
                other => {
                    debug!(run_id, group_id = %group_id, field = other, "ignoring unknown group field");
                }
            }
        }
    }

    let ids: HashSet<String> = groups.keys().cloned().collect();
    order
        .into_iter()
        .filter_map(|id| groups.remove(&id))
        .map(|mut group| {
            if let Some(parent) = &group.parent_transcript_group_id {
                if !ids.contains(parent) {
                    warn!(
                        run_id,
                        group_id = %group.id,
                        parent_id = %parent,
                        "dropping parent reference to group absent from batch"
                    );
                    group.parent_transcript_group_id = None;
                }
            }
            group
        })
        .collect()
}

/// Parent-before-child order. A cycle is broken by dropping the parent
/// reference of the group that closes it.
pub fn order_groups(run_id: &str, groups: Vec<TranscriptGroup>) -> Vec<TranscriptGroup> {
    let ids: Vec<String> = groups.iter().map(|g| g.id.clone()).collect();
    let mut by_id: BTreeMap<String, TranscriptGroup> =
        groups.into_iter().map(|g| (g.id.clone(), g)).collect();

    let mut done: HashSet<String> = HashSet::new();
    let mut ordered: Vec<String> = Vec::with_capacity(ids.len());

    for start in &ids {
        let mut chain: Vec<String> = Vec::new();
        let mut cursor = Some(start.clone());
        while let Some(id) = cursor {
            if done.contains(&id) {
                break;
            }
            if chain.contains(&id) {
                if let Some(last) = chain.last().and_then(|l| by_id.get_mut(l)) {
                    warn!(run_id, group_id = %last.id, parent_id = %id, "breaking transcript group cycle");
                    last.parent_transcript_group_id = None;
                }
                break;
            }
            cursor = by_id
                .get(&id)
                .and_then(|g| g.parent_transcript_group_id.clone());
            chain.push(id);
        }
        for id in chain.into_iter().rev() {
            if done.insert(id.clone()) {
                ordered.push(id);
            }
        }
    }

    ordered
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

fn apply_transcript_fields(transcripts: &mut [Transcript], fields: &[(String, FieldsPayload)]) {
    for (transcript_id, payload) in fields {
        let Some(transcript) = transcripts.iter_mut().find(|t| &t.id == transcript_id) else {
            debug!(transcript_id = %transcript_id, "metadata for transcript with no messages");
            continue;
        };
        for (field, value) in &payload.fields {
            match field.as_str() {
                "name" => transcript.name = text_value(value),
                "description" => transcript.description = text_value(value),
                "metadata" => merge_metadata(&mut transcript.metadata, value),
                _ => {}
            }
        }
    }
}

fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn merge_metadata(target: &mut Map<String, Value>, value: &Value) {
    if let Value::Object(map) = value {
        target.extend(map.clone());
    }
}

/// Rebuilds and persists one run from its fragments.
pub trait RunRebuilder: Send + Sync {
    fn rebuild(&self, collection_id: &str, run_id: &str) -> Result<AgentRun, ReconstructionError>;
}

/// Loads, reconstructs, assembles, and saves one run.
pub struct RunAssembler {
    store: Store,
    conv: Arc<dyn TranscriptSemConv + Send + Sync>,
}

impl RunAssembler {
    pub fn new(store: Store, conv: Arc<dyn TranscriptSemConv + Send + Sync>) -> Self {
        Self { store, conv }
    }
}

impl RunRebuilder for RunAssembler {
    fn rebuild(&self, collection_id: &str, run_id: &str) -> Result<AgentRun, ReconstructionError> {
        let fragments = RunFragments::load(&self.store, collection_id, run_id)?;
        let reconstruction = reconstruct_run(run_id, fragments.spans.clone(), self.conv.as_ref());
        let run = assemble_run(collection_id, run_id, reconstruction, &fragments, |ids| {
            Ok(self.store.existing_group_ids(run_id, ids)?)
        })?;
        self.store.save_agent_run(&run)?;
        debug!(
            collection = %collection_id,
            run_id,
            transcripts = run.transcripts.len(),
            groups = run.transcript_groups.len(),
            semconv = self.conv.version(),
            "saved agent run"
        );
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatMessage, Role};
    use chrono::Utc;
    use serde_json::json;

    fn fields(value: Value) -> FieldsPayload {
        FieldsPayload {
            fields: value.as_object().cloned().unwrap(),
            timestamp: Utc::now(),
        }
    }

    fn transcript(id: &str, group: Option<&str>) -> Transcript {
        Transcript {
            id: id.into(),
            agent_run_id: "r".into(),
            transcript_group_id: group.map(String::from),
            name: None,
            description: None,
            messages: vec![ChatMessage::new(Role::User, "hi")],
            metadata: Map::new(),
        }
    }

    #[test]
    fn missing_parent_is_dropped_not_fatal() {
        let frags = vec![
            ("C".to_string(), fields(json!({"parent_transcript_group_id": "Z"}))),
            ("B".to_string(), fields(json!({"parent_transcript_group_id": "A"}))),
            ("A".to_string(), fields(json!({"name": "root"}))),
        ];
        let groups = order_groups("r", build_groups("r", &frags));
        let ids: Vec<_> = groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["C", "A", "B"]);
        assert_eq!(groups[0].parent_transcript_group_id, None);
        assert_eq!(groups[2].parent_transcript_group_id.as_deref(), Some("A"));
    }

    #[test]
    fn later_group_fields_override_earlier_ones() {
        let frags = vec![
            ("A".to_string(), fields(json!({"name": "first", "description": "kept", "metadata": {"x": 1}}))),
            ("A".to_string(), fields(json!({"name": "second", "metadata": {"y": 2}}))),
        ];
        let groups = build_groups("r", &frags);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name.as_deref(), Some("second"));
        assert_eq!(groups[0].description.as_deref(), Some("kept"));
        assert_eq!(Value::Object(groups[0].metadata.clone()), json!({"x": 1, "y": 2}));
    }

    #[test]
    fn cycle_is_broken_and_order_is_parent_first() {
        let frags = vec![
            ("A".to_string(), fields(json!({"parent_transcript_group_id": "B"}))),
            ("B".to_string(), fields(json!({"parent_transcript_group_id": "A"}))),
            ("C".to_string(), fields(json!({"parent_transcript_group_id": "A"}))),
        ];
        let groups = order_groups("r", build_groups("r", &frags));
        let position = |id: &str| groups.iter().position(|g| g.id == id).unwrap();
        let roots = groups
            .iter()
            .filter(|g| g.parent_transcript_group_id.is_none())
            .count();
        assert_eq!(roots, 1);
        for g in &groups {
            if let Some(parent) = &g.parent_transcript_group_id {
                assert!(position(parent) < position(&g.id));
            }
        }
    }

    #[test]
    fn explicit_scores_and_metadata_win_over_span_derived() {
        let mut reconstruction = Reconstruction::default();
        reconstruction.run_scores.insert("acc".into(), json!(0.1));
        reconstruction.run_metadata.insert("env".into(), json!("span"));
        let fragments = RunFragments {
            scores: vec![
                ScorePayload { name: "acc".into(), value: json!(0.5), timestamp: Utc::now() },
                ScorePayload { name: "acc".into(), value: json!(0.7), timestamp: Utc::now() },
            ],
            metadata: vec![MetadataPayload {
                metadata: json!({"env": "explicit"}).as_object().cloned().unwrap(),
                timestamp: Utc::now(),
            }],
            ..RunFragments::default()
        };
        let run = assemble_run("c", "r", reconstruction, &fragments, |_| Ok(BTreeSet::new())).unwrap();
        assert_eq!(run.scores["acc"], json!(0.7));
        assert_eq!(run.metadata["env"], json!("explicit"));
    }

    #[test]
    fn transcript_group_reference_checked_against_batch_and_storage() {
        let reconstruction = Reconstruction {
            transcripts: vec![
                transcript("t1", Some("in-batch")),
                transcript("t2", Some("stored")),
                transcript("t3", Some("nowhere")),
            ],
            ..Reconstruction::default()
        };
        let fragments = RunFragments {
            group_fields: vec![("in-batch".into(), fields(json!({"name": "g"})))],
            transcript_fields: vec![("t1".into(), fields(json!({"name": "main"})))],
            ..RunFragments::default()
        };
        let run = assemble_run("c", "r", reconstruction, &fragments, |ids| {
            assert!(!ids.contains("in-batch"));
            Ok(ids.iter().filter(|id| *id == "stored").cloned().collect())
        })
        .unwrap();
        let groups: Vec<_> = run
            .transcripts
            .iter()
            .map(|t| t.transcript_group_id.as_deref())
            .collect();
        assert_eq!(groups, vec![Some("in-batch"), Some("stored"), None]);
        assert_eq!(run.transcripts[0].name.as_deref(), Some("main"));
    }
}
