//! Read-side engine over the LCM stores: resolve an opaque id, search
//! messages/summaries, and walk the summary DAG bounded by a token budget.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use lcm_core::{ids, LargeFile, MessageSearchHit, Role, SearchMode, SearchQuery, Summary, SummaryKind, SummarySearchHit};
use lcm_store::{ConversationStore, SummaryStore};
use serde::Serialize;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescribeKind {
    Summary,
    File,
    Message,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryView {
    pub summary_id: String,
    pub kind: SummaryKind,
    pub depth: u32,
    pub content: String,
    pub token_count: u32,
    pub message_ids: Vec<i64>,
    pub parent_ids: Vec<String>,
    pub child_ids: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub message_id: i64,
    pub role: Role,
    pub content: String,
    pub token_count: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileView {
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub byte_size: Option<i64>,
    pub storage_uri: String,
    pub exploration_summary: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DescribeResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: DescribeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SummaryView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrepScope {
    Messages,
    Summaries,
    Both,
}

#[derive(Debug, Clone)]
pub struct GrepInput {
    pub query: String,
    pub mode: Option<SearchMode>,
    pub scope: GrepScope,
    pub conversation_id: Option<i64>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub before: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GrepOutput {
    pub messages: Vec<MessageSearchHit>,
    pub summaries: Vec<SummarySearchHit>,
    pub total_matches: usize,
}

#[derive(Debug, Clone)]
pub struct ExpandInput {
    pub summary_id: String,
    pub depth: u32,
    pub token_cap: u32,
    pub include_messages: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpandOutput {
    pub children: Vec<SummaryView>,
    pub messages: Vec<MessageView>,
    pub estimated_tokens: u32,
    pub truncated: bool,
    pub cited_ids: Vec<String>,
}

pub struct RetrievalEngine {
    conversations: Arc<ConversationStore>,
    summaries: Arc<SummaryStore>,
}

impl RetrievalEngine {
    pub fn new(conversations: Arc<ConversationStore>, summaries: Arc<SummaryStore>) -> Self {
        Self {
            conversations,
            summaries,
        }
    }

    #[instrument(skip(self))]
    pub fn describe(&self, id: &str) -> Result<DescribeResponse> {
        if ids::is_summary_id(id) {
            if let Some(summary) = self.summaries.get_summary(id)? {
                let view = self.summary_view(&summary)?;
                return Ok(DescribeResponse {
                    id: id.to_owned(),
                    kind: DescribeKind::Summary,
                    summary: Some(view),
                    file: None,
                    message: None,
                });
            }
        } else if ids::is_file_id(id) {
            if let Some(file) = self.summaries.get_large_file(id)? {
                return Ok(DescribeResponse {
                    id: id.to_owned(),
                    kind: DescribeKind::File,
                    summary: None,
                    file: Some(file_view(&file)),
                    message: None,
                });
            }
        } else if let Ok(message_id) = id.parse::<i64>() {
            if let Some(message) = self.conversations.get_message_by_id(message_id)? {
                return Ok(DescribeResponse {
                    id: id.to_owned(),
                    kind: DescribeKind::Message,
                    summary: None,
                    file: None,
                    message: Some(message_view(&message)),
                });
            }
        }
        Ok(DescribeResponse {
            id: id.to_owned(),
            kind: DescribeKind::None,
            summary: None,
            file: None,
            message: None,
        })
    }

    #[instrument(skip(self, input), fields(limit = input.limit))]
    pub fn grep(&self, input: &GrepInput) -> Result<GrepOutput> {
        let query = SearchQuery {
            query: input.query.clone(),
            mode: input.mode,
            conversation_id: input.conversation_id,
            since: input.since,
            before: input.before,
            limit: input.limit,
        };

        let messages = if matches!(input.scope, GrepScope::Messages | GrepScope::Both) {
            self.conversations.search_messages(&query)?
        } else {
            Vec::new()
        };
        let summaries = if matches!(input.scope, GrepScope::Summaries | GrepScope::Both) {
            self.summaries.search_summaries(&query)?
        } else {
            Vec::new()
        };

        let total_matches = messages.len() + summaries.len();
        Ok(GrepOutput {
            messages,
            summaries,
            total_matches,
        })
    }

    /// BFS over the summary DAG via `get_summary_parents` (the constituent,
    /// lower-depth summaries a node was built from), bounded by `depth`
    /// levels and `token_cap` total tokens, with a visited set for cycle
    /// safety.
    #[instrument(skip(self, input), fields(summary_id = %input.summary_id))]
    pub fn expand(&self, input: &ExpandInput) -> Result<ExpandOutput> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(input.summary_id.clone());

        let mut frontier = vec![input.summary_id.clone()];
        let mut children = Vec::new();
        let mut messages = Vec::new();
        let mut cited_ids = Vec::new();
        let mut tokens_used = 0u32;
        let mut truncated = false;
        let mut stop = false;

        for _level in 1..=input.depth.max(1) {
            if stop {
                break;
            }
            let mut next_frontier = Vec::new();
            for id in &frontier {
                if stop {
                    break;
                }
                let parent_ids = self.summaries.get_summary_parents(id)?;
                for parent_id in parent_ids {
                    if stop {
                        break;
                    }
                    if !visited.insert(parent_id.clone()) {
                        continue;
                    }
                    let Some(summary) = self.summaries.get_summary(&parent_id)? else {
                        continue;
                    };
                    if tokens_used + summary.token_count > input.token_cap {
                        truncated = true;
                        stop = true;
                        break;
                    }
                    tokens_used += summary.token_count;
                    cited_ids.push(parent_id.clone());
                    next_frontier.push(parent_id.clone());
                    children.push(self.summary_view(&summary)?);

                    if input.include_messages && summary.kind == SummaryKind::Leaf {
                        for message_id in self.summaries.get_summary_messages(&parent_id)? {
                            let Some(message) = self.conversations.get_message_by_id(message_id)? else {
                                continue;
                            };
                            if tokens_used + message.token_count > input.token_cap {
                                truncated = true;
                                stop = true;
                                break;
                            }
                            tokens_used += message.token_count;
                            cited_ids.push(message.message_id.to_string());
                            messages.push(message_view(&message));
                        }
                    }
                }
            }
            frontier = next_frontier;
            if frontier.is_empty() {
                break;
            }
        }

        Ok(ExpandOutput {
            children,
            messages,
            estimated_tokens: tokens_used,
            truncated,
            cited_ids,
        })
    }

    fn summary_view(&self, summary: &Summary) -> Result<SummaryView> {
        let message_ids = self.summaries.get_summary_messages(&summary.summary_id)?;
        let parent_ids = self.summaries.get_summary_parents(&summary.summary_id)?;
        let child_ids = self.summaries.get_summary_children(&summary.summary_id)?;
        Ok(SummaryView {
            summary_id: summary.summary_id.clone(),
            kind: summary.kind,
            depth: summary.depth,
            content: summary.content.clone(),
            token_count: summary.token_count,
            message_ids,
            parent_ids,
            child_ids,
            created_at: summary.created_at,
        })
    }
}

fn message_view(message: &lcm_core::Message) -> MessageView {
    MessageView {
        message_id: message.message_id,
        role: message.role,
        content: message.content.clone(),
        token_count: message.token_count,
        created_at: message.created_at,
    }
}

fn file_view(file: &LargeFile) -> FileView {
    FileView {
        file_id: file.file_id.clone(),
        file_name: file.file_name.clone(),
        mime_type: file.mime_type.clone(),
        byte_size: file.byte_size,
        storage_uri: file.storage_uri.clone(),
        exploration_summary: file.exploration_summary.clone(),
        created_at: file.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcm_core::{NewLargeFile, NewSummary, Role as R};
    use lcm_store::Db;

    fn setup() -> (RetrievalEngine, Arc<ConversationStore>, Arc<SummaryStore>, i64) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let conversations = Arc::new(ConversationStore::new(db.clone()));
        let summaries = Arc::new(SummaryStore::new(db));
        let conv = conversations.get_or_create_conversation("s1").unwrap();
        let engine = RetrievalEngine::new(conversations.clone(), summaries.clone());
        (engine, conversations, summaries, conv.conversation_id)
    }

    #[test]
    fn describe_resolves_message_summary_file_and_none() {
        let (engine, conversations, summaries, conv_id) = setup();
        let msg = conversations.create_message(conv_id, 1, R::User, "hi").unwrap();

        let leaf = summaries
            .insert_summary(NewSummary {
                summary_id: "sum_leaf1".into(),
                conversation_id: conv_id,
                kind: SummaryKind::Leaf,
                depth: 0,
                content: "a leaf summary".into(),
                token_count: 4,
                file_ids: vec![],
            })
            .unwrap();
        let file = summaries
            .insert_large_file(NewLargeFile {
                file_id: "file_aaaaaaaaaaaaaaaa".into(),
                conversation_id: conv_id,
                file_name: Some("notes.txt".into()),
                mime_type: Some("text/plain".into()),
                byte_size: Some(128),
                storage_uri: "/tmp/notes.txt".into(),
                exploration_summary: None,
            })
            .unwrap();

        assert_eq!(
            engine.describe(&msg.message_id.to_string()).unwrap().kind,
            DescribeKind::Message
        );
        assert_eq!(engine.describe(&leaf.summary_id).unwrap().kind, DescribeKind::Summary);
        assert_eq!(engine.describe(&file.file_id).unwrap().kind, DescribeKind::File);
        assert_eq!(engine.describe("sum_doesnotexist").unwrap().kind, DescribeKind::None);
    }

    #[test]
    fn grep_full_text_finds_ingested_message() {
        let (engine, conversations, _summaries, conv_id) = setup();
        conversations
            .create_message(conv_id, 1, R::User, "the quick brown fox")
            .unwrap();

        let output = engine
            .grep(&GrepInput {
                query: "fox".into(),
                mode: None,
                scope: GrepScope::Messages,
                conversation_id: Some(conv_id),
                since: None,
                before: None,
                limit: 10,
            })
            .unwrap();
        assert_eq!(output.total_matches, 1);
    }

    #[test]
    fn expand_walks_parents_and_respects_token_cap() {
        let (engine, conversations, summaries, conv_id) = setup();
        let msg = conversations.create_message(conv_id, 1, R::User, "source turn").unwrap();
        let leaf = summaries
            .insert_summary(NewSummary {
                summary_id: "sum_leafA".into(),
                conversation_id: conv_id,
                kind: SummaryKind::Leaf,
                depth: 0,
                content: "leaf content".into(),
                token_count: 4,
                file_ids: vec![],
            })
            .unwrap();
        summaries
            .link_summary_to_messages(&leaf.summary_id, vec![msg.message_id])
            .unwrap();
        let condensed = summaries
            .insert_summary(NewSummary {
                summary_id: "sum_condensedA".into(),
                conversation_id: conv_id,
                kind: SummaryKind::Condensed,
                depth: 1,
                content: "condensed content".into(),
                token_count: 6,
                file_ids: vec![],
            })
            .unwrap();
        summaries
            .link_summary_to_parents(&condensed.summary_id, vec![leaf.summary_id.clone()])
            .unwrap();

        let output = engine
            .expand(&ExpandInput {
                summary_id: condensed.summary_id.clone(),
                depth: 1,
                token_cap: 1000,
                include_messages: true,
            })
            .unwrap();

        assert_eq!(output.children.len(), 1);
        assert_eq!(output.children[0].summary_id, leaf.summary_id);
        assert_eq!(output.messages.len(), 1);
        assert!(!output.truncated);

        let capped = engine
            .expand(&ExpandInput {
                summary_id: condensed.summary_id,
                depth: 1,
                token_cap: 1,
                include_messages: true,
            })
            .unwrap();
        assert!(capped.truncated);
        assert!(capped.children.is_empty());
    }
}
