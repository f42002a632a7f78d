pub use lcm_compaction::PassOutcome;

use lcm_core::{NewMessagePart, Role};

#[derive(Debug, Clone)]
pub struct IngestMessage {
    pub role: Role,
    pub content: String,
    pub parts: Vec<NewMessagePart>,
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapOutput {
    pub bootstrapped: bool,
    pub imported_messages: usize,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IngestBatchOutput {
    pub ingested_count: usize,
}

#[derive(Debug, Clone)]
pub struct AfterTurnInput {
    pub session_file: String,
    pub messages: Vec<IngestMessage>,
    pub pre_prompt_message_count: usize,
    pub auto_compaction_summary: Option<String>,
    pub heartbeat: bool,
    pub token_budget: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct AfterTurnOutput {
    pub ingested_count: usize,
    pub compaction_attempted: bool,
    pub compacted: bool,
}

#[derive(Debug, Clone)]
pub struct AssembleInput {
    pub messages: Vec<IngestMessage>,
    pub token_budget: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum AssembledLine {
    Stored(lcm_assembler::AssembledMessage),
    Live(IngestMessage),
}

#[derive(Debug, Clone)]
pub struct AssembleOutput {
    pub messages: Vec<AssembledLine>,
    pub estimated_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionTarget {
    Budget,
    Threshold,
}

#[derive(Debug, Clone)]
pub struct CompactInput {
    pub session_file: String,
    pub token_budget: Option<u32>,
    pub current_token_count: Option<u32>,
    pub compaction_target: CompactionTarget,
    pub custom_instructions: Option<String>,
    pub force: bool,
    pub legacy_manual_compaction: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CompactOutput {
    pub ok: bool,
    pub compacted: bool,
    pub reason: Option<String>,
    pub result: Vec<PassOutcome>,
}
