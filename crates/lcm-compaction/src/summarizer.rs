//! The injected summarizer collaborator: the engine depends only on this
//! trait's interface, never on a concrete LLM client.

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct SummarizeOptions {
    pub previous_summary: Option<String>,
    pub is_condensed: bool,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, aggressive: bool, options: &SummarizeOptions) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryLevel {
    Normal,
    Aggressive,
    Fallback,
}

impl SummaryLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Aggressive => "aggressive",
            Self::Fallback => "fallback",
        }
    }
}
