/// Attribute names used to route spans and pull conversation messages out of
/// them.
pub trait TranscriptSemConv {
    fn version(&self) -> &'static str;

    // Routing
    fn agent_run_id(&self) -> &'static str;
    fn transcript_group_id(&self) -> &'static str;
    fn transcript_id(&self) -> &'static str;
    fn collection_id(&self) -> &'static str;

    // Indexed message sequences
    fn prompt_prefix(&self) -> &'static str;
    fn completion_prefix(&self) -> &'static str;

    // Span-derived run data
    fn run_metadata_prefix(&self) -> &'static str;
    fn run_score_prefix(&self) -> &'static str;
}

/// Flattened `gen_ai.prompt.{i}.*` / `gen_ai.completion.{i}.*` layout, as
/// emitted by the common LLM instrumentation libraries.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexedGenAi;

impl TranscriptSemConv for IndexedGenAi {
    fn version(&self) -> &'static str {
        "indexed-1"
    }

    fn agent_run_id(&self) -> &'static str {
        "agent_run_id"
    }
    fn transcript_group_id(&self) -> &'static str {
        "transcript_group_id"
    }
    fn transcript_id(&self) -> &'static str {
        "transcript_id"
    }
    fn collection_id(&self) -> &'static str {
        "collection_id"
    }

    fn prompt_prefix(&self) -> &'static str {
        "gen_ai.prompt"
    }
    fn completion_prefix(&self) -> &'static str {
        "gen_ai.completion"
    }

    fn run_metadata_prefix(&self) -> &'static str {
        "agent_run.metadata"
    }
    fn run_score_prefix(&self) -> &'static str {
        "agent_run.score"
    }
}
