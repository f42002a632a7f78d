//! Structured content carried by a [`MessagePart`](crate::types::MessagePart).
//!
//! Provider/tool content arrives as heterogeneous duck-typed blocks (text,
//! reasoning, tool call, tool result, patch, file reference, …). Modeled
//! here as a closed sum type with a tag per variant; anything the engine
//! doesn't have a first-class shape for is preserved verbatim under
//! [`PartBody::Agent`] so round-tripping through the store is lossless.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartType {
    Text,
    Reasoning,
    Tool,
    Patch,
    File,
    Subtask,
    Compaction,
    StepStart,
    StepFinish,
    Snapshot,
    Agent,
    Retry,
}

impl PartType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Reasoning => "reasoning",
            Self::Tool => "tool",
            Self::Patch => "patch",
            Self::File => "file",
            Self::Subtask => "subtask",
            Self::Compaction => "compaction",
            Self::StepStart => "step_start",
            Self::StepFinish => "step_finish",
            Self::Snapshot => "snapshot",
            Self::Agent => "agent",
            Self::Retry => "retry",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "text" => Self::Text,
            "reasoning" => Self::Reasoning,
            "tool" => Self::Tool,
            "patch" => Self::Patch,
            "file" => Self::File,
            "subtask" => Self::Subtask,
            "compaction" => Self::Compaction,
            "step_start" => Self::StepStart,
            "step_finish" => Self::StepFinish,
            "snapshot" => Self::Snapshot,
            "agent" => Self::Agent,
            "retry" => Self::Retry,
            _ => return None,
        })
    }
}

/// A single content block within a [`MessagePart`](crate::types::MessagePart).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartBody {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    Tool {
        call_id: String,
        name: String,
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Patch {
        file_path: String,
        diff: String,
    },
    File {
        file_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Subtask {
        subtask_id: String,
        description: String,
    },
    /// A durable compaction event. `metadata` carries
    /// `{conversation_id, pass, level, tokens_before, tokens_after,
    /// created_summary_id, created_summary_ids, condensed_pass_occurred}`.
    Compaction {
        metadata: Value,
    },
    StepStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    StepFinish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Snapshot {
        snapshot_id: String,
    },
    /// Opaque variant: preserved verbatim so lossless round-tripping holds
    /// even for block shapes the engine has no first-class model for.
    Agent {
        kind: String,
        metadata: Value,
    },
    Retry {
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl PartBody {
    pub fn part_type(&self) -> PartType {
        match self {
            Self::Text { .. } => PartType::Text,
            Self::Reasoning { .. } => PartType::Reasoning,
            Self::Tool { .. } => PartType::Tool,
            Self::Patch { .. } => PartType::Patch,
            Self::File { .. } => PartType::File,
            Self::Subtask { .. } => PartType::Subtask,
            Self::Compaction { .. } => PartType::Compaction,
            Self::StepStart { .. } => PartType::StepStart,
            Self::StepFinish { .. } => PartType::StepFinish,
            Self::Snapshot { .. } => PartType::Snapshot,
            Self::Agent { .. } => PartType::Agent,
            Self::Retry { .. } => PartType::Retry,
        }
    }

    /// Returns the text if this is a `Text` or `Reasoning` variant.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } | Self::Reasoning { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn as_tool(&self) -> Option<(&str, &str)> {
        match self {
            Self::Tool { call_id, name, .. } => Some((call_id, name)),
            _ => None,
        }
    }

    pub fn is_tool_call_without_result(&self) -> bool {
        matches!(self, Self::Tool { output: None, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let body = PartBody::Tool {
            call_id: "call_1".into(),
            name: "bash".into(),
            input: serde_json::json!({"command": "ls"}),
            output: Some("file.txt".into()),
            is_error: Some(false),
        };
        let json = serde_json::to_string(&body).unwrap();
        let back: PartBody = serde_json::from_str(&json).unwrap();
        assert_eq!(body, back);
        assert_eq!(back.part_type(), PartType::Tool);
    }

    #[test]
    fn opaque_agent_variant_preserves_metadata() {
        let body = PartBody::Agent {
            kind: "voice_marker".into(),
            metadata: serde_json::json!({"unrecognized": true}),
        };
        let json = serde_json::to_string(&body).unwrap();
        let back: PartBody = serde_json::from_str(&json).unwrap();
        assert_eq!(body, back);
    }
}
