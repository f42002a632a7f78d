//! Core entities of the LCM data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::PartBody;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "system" => Self::System,
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: i64,
    pub session_id: String,
    pub title: Option<String>,
    pub bootstrapped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub conversation_id: i64,
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
}

/// A message not yet assigned a `message_id` / `created_at`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: i64,
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub token_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePart {
    pub part_id: i64,
    pub message_id: i64,
    pub session_id: String,
    pub ordinal: i32,
    pub body: PartBody,
}

/// A part not yet assigned a `part_id`.
#[derive(Debug, Clone)]
pub struct NewMessagePart {
    pub ordinal: i32,
    pub body: PartBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryKind {
    Leaf,
    Condensed,
}

impl SummaryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Leaf => "leaf",
            Self::Condensed => "condensed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "leaf" => Self::Leaf,
            "condensed" => Self::Condensed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub summary_id: String,
    pub conversation_id: i64,
    pub kind: SummaryKind,
    pub depth: u32,
    pub content: String,
    pub token_count: u32,
    pub file_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A summary not yet assigned a `summary_id` / `created_at`.
#[derive(Debug, Clone)]
pub struct NewSummary {
    pub summary_id: String,
    pub conversation_id: i64,
    pub kind: SummaryKind,
    pub depth: u32,
    pub content: String,
    pub token_count: u32,
    pub file_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextItemType {
    Message,
    Summary,
}

/// An entry in the active ordered sequence for a conversation: either a
/// raw message or a summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub conversation_id: i64,
    pub ordinal: i64,
    pub item_type: ContextItemType,
    pub message_id: Option<i64>,
    pub summary_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ContextItem {
    pub fn is_message(&self) -> bool {
        self.item_type == ContextItemType::Message
    }

    pub fn is_summary(&self) -> bool {
        self.item_type == ContextItemType::Summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LargeFile {
    pub file_id: String,
    pub conversation_id: i64,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub byte_size: Option<i64>,
    pub storage_uri: String,
    pub exploration_summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLargeFile {
    pub file_id: String,
    pub conversation_id: i64,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub byte_size: Option<i64>,
    pub storage_uri: String,
    pub exploration_summary: Option<String>,
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    FullText,
    Regex,
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub query: String,
    pub mode: Option<SearchMode>,
    pub conversation_id: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl SearchQuery {
    pub fn mode_or_default(&self) -> SearchMode {
        self.mode.unwrap_or(SearchMode::FullText)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSearchHit {
    pub message_id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub snippet: String,
    pub created_at: DateTime<Utc>,
    pub rank: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarySearchHit {
    pub summary_id: String,
    pub conversation_id: i64,
    pub kind: SummaryKind,
    pub snippet: String,
    pub created_at: DateTime<Utc>,
    pub rank: f64,
}
