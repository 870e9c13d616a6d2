//! Fragment, run-status, and reconstructed domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of telemetry carried by a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentCategory {
    Span,
    Score,
    Metadata,
    TranscriptMetadata,
    TranscriptGroupMetadata,
}

impl FragmentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentCategory::Span => "span",
            FragmentCategory::Score => "score",
            FragmentCategory::Metadata => "metadata",
            FragmentCategory::TranscriptMetadata => "transcript_metadata",
            FragmentCategory::TranscriptGroupMetadata => "transcript_group_metadata",
        }
    }
}

/// Hierarchical address of a fragment: collection, then whichever of run,
/// group, and transcript are known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentKey {
    pub collection_id: String,
    pub agent_run_id: Option<String>,
    pub transcript_group_id: Option<String>,
    pub transcript_id: Option<String>,
}

impl FragmentKey {
    pub fn collection(collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            ..Self::default()
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.agent_run_id = Some(run_id.into());
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.transcript_group_id = Some(group_id.into());
        self
    }

    pub fn with_transcript(mut self, transcript_id: impl Into<String>) -> Self {
        self.transcript_id = Some(transcript_id.into());
        self
    }

    /// Full storage key. Segments are labelled so that an absent middle
    /// component never makes two keys collide.
    pub fn path(&self) -> String {
        let mut path = key_segment("c", &self.collection_id);
        for (label, value) in self.optional_segments() {
            if let Some(value) = value {
                path.push('/');
                path.push_str(&key_segment(label, value));
            }
        }
        path
    }

    /// Longest key prefix shared by every fragment under this key: the
    /// collection plus the leading run of present components.
    pub fn prefix(&self) -> String {
        let mut path = key_segment("c", &self.collection_id);
        for (label, value) in self.optional_segments() {
            match value {
                Some(value) => {
                    path.push('/');
                    path.push_str(&key_segment(label, value));
                }
                None => break,
            }
        }
        path
    }

    fn optional_segments(&self) -> [(&'static str, Option<&str>); 3] {
        [
            ("r", self.agent_run_id.as_deref()),
            ("g", self.transcript_group_id.as_deref()),
            ("t", self.transcript_id.as_deref()),
        ]
    }
}

fn key_segment(label: &str, value: &str) -> String {
    format!("{}={}", label, value.replace('%', "%25").replace('/', "%2F"))
}

/// One immutable unit of raw telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// Arrival order within the store.
    pub id: i64,
    pub key: FragmentKey,
    pub category: FragmentCategory,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Processing state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    NeedsProcessing,
    Processing,
    Completed,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::NeedsProcessing => "NEEDS_PROCESSING",
            ProcessingStatus::Processing => "PROCESSING",
            ProcessingStatus::Completed => "COMPLETED",
            ProcessingStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEEDS_PROCESSING" => Some(ProcessingStatus::NeedsProcessing),
            "PROCESSING" => Some(ProcessingStatus::Processing),
            "COMPLETED" => Some(ProcessingStatus::Completed),
            "ERROR" => Some(ProcessingStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Dirty-bit bookkeeping for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub collection_id: String,
    pub status: ProcessingStatus,
    pub current_version: i64,
    pub processed_version: i64,
    pub error_count: u32,
    /// Most recent failures, oldest first.
    pub error_history: Vec<ErrorEntry>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" | "developer" => Some(Role::System),
            "user" | "human" => Some(Role::User),
            "assistant" | "ai" | "model" => Some(Role::Assistant),
            "tool" | "function" | "ipython" => Some(Role::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            reasoning: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub id: String,
    pub agent_run_id: String,
    pub transcript_group_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptGroup {
    pub id: String,
    pub agent_run_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub parent_transcript_group_id: Option<String>,
    pub metadata: Map<String, Value>,
}

/// A fully reconstructed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub collection_id: String,
    pub metadata: Map<String, Value>,
    pub scores: Map<String, Value>,
    /// Parent-before-child order.
    pub transcript_groups: Vec<TranscriptGroup>,
    pub transcripts: Vec<Transcript>,
}

/// Payload of a `score` fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorePayload {
    pub name: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

/// Payload of a `metadata` fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataPayload {
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Payload of `transcript_metadata` and `transcript_group_metadata`
/// fragments. Each present field overrides the same field from earlier
/// fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldsPayload {
    pub fields: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}
