//! Context assembler: reconstructs a bounded, role-valid
//! transcript from a conversation's `context_items`, interleaving raw
//! messages and rehydrated summaries and fitting a token budget.

use std::sync::Arc;

use anyhow::Result;
use lcm_core::{ContextItemType, PartBody, Role};
use lcm_store::{ConversationStore, SummaryStore};
use tracing::{info_span, warn};

#[derive(Debug, Clone)]
pub enum AssembledContent {
    Text(String),
    Blocks(Vec<PartBody>),
}

#[derive(Debug, Clone)]
pub struct AssembledMessage {
    pub role: Role,
    pub content: AssembledContent,
    pub token_count: u32,
}

impl AssembledMessage {
    pub fn as_text(&self) -> String {
        match &self.content {
            AssembledContent::Text(text) => text.clone(),
            AssembledContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(PartBody::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssembleStats {
    pub raw_message_count: usize,
    pub summary_count: usize,
    pub total_context_items: usize,
}

#[derive(Debug, Clone)]
pub struct AssembleOutput {
    pub messages: Vec<AssembledMessage>,
    pub estimated_tokens: u32,
    pub stats: AssembleStats,
}

#[derive(Debug, Clone)]
pub struct AssembleInput {
    pub conversation_id: i64,
    pub token_budget: u32,
    pub fresh_tail_count: usize,
}

pub struct ContextAssembler {
    conversations: Arc<ConversationStore>,
    summaries: Arc<SummaryStore>,
}

impl ContextAssembler {
    pub fn new(conversations: Arc<ConversationStore>, summaries: Arc<SummaryStore>) -> Self {
        Self {
            conversations,
            summaries,
        }
    }

    /// Never returns `Err`: any internal failure degrades to a pass-through
    /// of the raw stored messages with `estimated_tokens = 0`.
    pub fn assemble(&self, input: &AssembleInput) -> AssembleOutput {
        let span = info_span!("assemble", conversation_id = input.conversation_id);
        let _enter = span.enter();

        match self.try_assemble(input) {
            Ok(output) => output,
            Err(error) => {
                warn!(%error, "assembler failed, falling back to pass-through");
                self.pass_through(input.conversation_id)
            }
        }
    }

    fn pass_through(&self, conversation_id: i64) -> AssembleOutput {
        let raw = self
            .conversations
            .get_messages(conversation_id, None, None)
            .unwrap_or_default();
        let stats = AssembleStats {
            raw_message_count: raw.len(),
            summary_count: 0,
            total_context_items: raw.len(),
        };
        let messages = raw
            .into_iter()
            .map(|m| AssembledMessage {
                role: m.role,
                content: AssembledContent::Text(m.content),
                token_count: m.token_count,
            })
            .collect();
        AssembleOutput {
            messages,
            estimated_tokens: 0,
            stats,
        }
    }

    fn try_assemble(&self, input: &AssembleInput) -> Result<AssembleOutput> {
        let items = self.summaries.get_context_items(input.conversation_id)?;

        let tail_start = fresh_tail_start(&items, input.fresh_tail_count);

        let mut rendered = Vec::with_capacity(items.len());
        let mut raw_message_count = 0usize;
        let mut summary_count = 0usize;

        for (idx, item) in items.iter().enumerate() {
            let is_tail = idx >= tail_start;
            match item.item_type {
                ContextItemType::Message => {
                    let message_id = item.message_id.expect("message item missing message_id");
                    let Some(message) = self.conversations.get_message_by_id(message_id)? else {
                        continue;
                    };
                    let parts = self.conversations.get_message_parts(message_id)?;
                    raw_message_count += 1;
                    rendered.push((
                        rehydrate_message(message.role, message.content, message.token_count, &parts),
                        is_tail,
                    ));
                }
                ContextItemType::Summary => {
                    let summary_id = item.summary_id.clone().expect("summary item missing summary_id");
                    let Some(summary) = self.summaries.get_summary(&summary_id)? else {
                        continue;
                    };
                    summary_count += 1;
                    let text = format!("[Summary ID: {}]\n{}", summary.summary_id, summary.content);
                    rendered.push((
                        AssembledMessage {
                            role: Role::User,
                            content: AssembledContent::Text(text),
                            token_count: summary.token_count,
                        },
                        is_tail,
                    ));
                }
            }
        }

        // `repair_invariants` can drop or insert messages, shifting every
        // later index — the fresh-tail boundary is carried through per item
        // rather than recomputed as a raw index, so it still lands on the
        // same messages afterward.
        let repaired = repair_invariants(rendered);
        let tail_start = repaired.iter().position(|(_, is_tail)| *is_tail).unwrap_or(repaired.len());
        let repaired: Vec<AssembledMessage> = repaired.into_iter().map(|(message, _)| message).collect();
        let fitted = fit_budget(repaired, input.token_budget, tail_start);

        let estimated_tokens: u32 = fitted.iter().map(|m| m.token_count).sum();
        Ok(AssembleOutput {
            messages: fitted,
            estimated_tokens,
            stats: AssembleStats {
                raw_message_count,
                summary_count,
                total_context_items: items.len(),
            },
        })
    }
}

/// Index where the fresh tail begins: walk backward from the end until
/// `fresh_tail_count` message-type items have been counted, keeping any
/// summary items interleaved inside that span.
fn fresh_tail_start(items: &[lcm_core::ContextItem], fresh_tail_count: usize) -> usize {
    if fresh_tail_count == 0 {
        return items.len();
    }
    let mut seen_messages = 0usize;
    for (idx, item) in items.iter().enumerate().rev() {
        if item.is_message() {
            seen_messages += 1;
        }
        if seen_messages >= fresh_tail_count {
            return idx;
        }
    }
    0
}

fn rehydrate_message(
    role: Role,
    content: String,
    token_count: u32,
    parts: &[lcm_core::MessagePart],
) -> AssembledMessage {
    let structural = parts.iter().any(|p| {
        !matches!(
            p.body.part_type(),
            lcm_core::PartType::Text | lcm_core::PartType::Reasoning
        )
    });

    if structural {
        let blocks = parts.iter().map(|p| p.body.clone()).collect();
        AssembledMessage {
            role,
            content: AssembledContent::Blocks(blocks),
            token_count,
        }
    } else {
        AssembledMessage {
            role,
            content: AssembledContent::Text(content),
            token_count,
        }
    }
}

/// Step 4/5: drop orphan tool results, synthesize missing tool results for
/// dangling tool calls, and degrade legacy tool-role rows with no call id.
///
/// Each message carries whether it belongs to the fresh tail alongside it,
/// since dropping and inserting messages here shifts every later index —
/// a raw index captured before this pass would no longer point at the same
/// messages afterward. Dropped messages take their flag with them;
/// synthesized tool results inherit the flag of the call they resolve.
fn repair_invariants(messages: Vec<(AssembledMessage, bool)>) -> Vec<(AssembledMessage, bool)> {
    let mut seen_call_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut out: Vec<(AssembledMessage, bool)> = Vec::with_capacity(messages.len());

    for (message, is_tail) in messages {
        let AssembledContent::Blocks(blocks) = &message.content else {
            if message.role == Role::Tool {
                // Legacy row: no structured tool_call_id available, degrade to assistant.
                out.push((
                    AssembledMessage {
                        role: Role::Assistant,
                        content: message.content,
                        token_count: message.token_count,
                    },
                    is_tail,
                ));
            } else {
                out.push((message, is_tail));
            }
            continue;
        };

        let has_orphan_result = blocks.iter().any(|b| match b {
            PartBody::Tool { call_id, output: Some(_), .. } => !seen_call_ids.contains(call_id),
            _ => false,
        });

        if has_orphan_result && message.role == Role::Tool {
            continue;
        }

        for block in blocks {
            if let PartBody::Tool { call_id, output: None, .. } = block {
                seen_call_ids.insert(call_id.clone());
            }
        }

        out.push((message, is_tail));
    }

    // Synthesize empty tool results for calls that never got one, directly
    // after the message that made the call.
    let mut resolved: std::collections::HashSet<String> = std::collections::HashSet::new();
    for (message, _) in &out {
        if let AssembledContent::Blocks(blocks) = &message.content {
            for block in blocks {
                if let PartBody::Tool { call_id, output: Some(_), .. } = block {
                    resolved.insert(call_id.clone());
                }
            }
        }
    }

    let mut final_out = Vec::with_capacity(out.len());
    for (message, is_tail) in out {
        let pending_calls: Vec<(String, String)> = match &message.content {
            AssembledContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    PartBody::Tool { call_id, name, output: None, .. }
                        if !resolved.contains(call_id) =>
                    {
                        Some((call_id.clone(), name.clone()))
                    }
                    _ => None,
                })
                .collect(),
            AssembledContent::Text(_) => Vec::new(),
        };
        final_out.push((message, is_tail));
        for (call_id, name) in pending_calls {
            final_out.push((
                AssembledMessage {
                    role: Role::Tool,
                    content: AssembledContent::Blocks(vec![PartBody::Tool {
                        call_id,
                        name,
                        input: serde_json::Value::Null,
                        output: Some(String::new()),
                        is_error: Some(false),
                    }]),
                    token_count: 0,
                },
                is_tail,
            ));
        }
    }

    final_out
}

/// Step 6: greedy oldest-first eviction of non-tail items until the total
/// fits `budget`, or only tail items remain.
fn fit_budget(messages: Vec<AssembledMessage>, budget: u32, tail_start: usize) -> Vec<AssembledMessage> {
    let tail_start = tail_start.min(messages.len());
    let mut total: u32 = messages.iter().map(|m| m.token_count).sum();

    let mut head: Vec<AssembledMessage> = messages[..tail_start].to_vec();
    let tail: Vec<AssembledMessage> = messages[tail_start..].to_vec();

    let mut idx = 0;
    while total > budget && idx < head.len() {
        total = total.saturating_sub(head[idx].token_count);
        idx += 1;
    }

    head.drain(..idx);
    head.extend(tail);
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcm_core::Role as R;
    use lcm_store::Db;

    fn setup() -> (Arc<ConversationStore>, Arc<SummaryStore>, i64) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let conversations = Arc::new(ConversationStore::new(db.clone()));
        let summaries = Arc::new(SummaryStore::new(db));
        let conv = conversations.get_or_create_conversation("s1").unwrap();
        (conversations, summaries, conv.conversation_id)
    }

    #[test]
    fn ingest_then_assemble_pass_through() {
        let (conversations, summaries, conv_id) = setup();
        for i in 0..5 {
            let content = format!("Message {i}");
            let msg = conversations
                .create_message(conv_id, i + 1, R::User, content)
                .unwrap();
            summaries.append_context_message(conv_id, msg.message_id).unwrap();
        }

        let assembler = ContextAssembler::new(conversations, summaries);
        let output = assembler.assemble(&AssembleInput {
            conversation_id: conv_id,
            token_budget: 100_000,
            fresh_tail_count: 0,
        });

        assert_eq!(output.messages.len(), 5);
        assert_eq!(output.stats.raw_message_count, 5);
        assert_eq!(output.stats.summary_count, 0);
    }

    #[test]
    fn fresh_tail_is_never_evicted() {
        let (conversations, summaries, conv_id) = setup();
        for i in 0..3 {
            let content = format!("M{i} {}", "y".repeat(796));
            let msg = conversations
                .create_message(conv_id, i + 1, R::User, content)
                .unwrap();
            summaries.append_context_message(conv_id, msg.message_id).unwrap();
        }

        let assembler = ContextAssembler::new(conversations, summaries);
        let output = assembler.assemble(&AssembleInput {
            conversation_id: conv_id,
            token_budget: 100,
            fresh_tail_count: 8,
        });

        assert_eq!(output.messages.len(), 3);
    }

    #[test]
    fn fresh_tail_survives_orphan_drop_ahead_of_it() {
        use lcm_core::NewMessagePart;

        let (conversations, summaries, conv_id) = setup();

        // An orphaned tool result ahead of the tail: repair_invariants drops
        // it, shrinking the vector by one before the tail boundary.
        let orphan = conversations.create_message(conv_id, 1, R::Tool, "orphan result").unwrap();
        conversations
            .create_message_parts(
                orphan.message_id,
                "s1",
                vec![NewMessagePart {
                    ordinal: 0,
                    body: PartBody::Tool {
                        call_id: "call-missing".to_owned(),
                        name: "lookup".to_owned(),
                        input: serde_json::Value::Null,
                        output: Some("result".to_owned()),
                        is_error: Some(false),
                    },
                }],
            )
            .unwrap();
        summaries.append_context_message(conv_id, orphan.message_id).unwrap();

        for i in 0..3 {
            let content = format!("tail {i} {}", "y".repeat(796));
            let msg = conversations.create_message(conv_id, i + 2, R::User, content).unwrap();
            summaries.append_context_message(conv_id, msg.message_id).unwrap();
        }

        let assembler = ContextAssembler::new(conversations, summaries);
        let output = assembler.assemble(&AssembleInput {
            conversation_id: conv_id,
            token_budget: 100,
            fresh_tail_count: 3,
        });

        assert_eq!(output.messages.len(), 3, "the orphan drop must not shift a tail message into the evictable head");
        for message in &output.messages {
            assert!(message.as_text().starts_with("tail"), "every surviving message must be a genuine fresh-tail message");
        }
    }

    #[test]
    fn empty_store_falls_back_to_pass_through_with_zero_tokens() {
        let (conversations, summaries, conv_id) = setup();
        let assembler = ContextAssembler::new(conversations, summaries);
        let output = assembler.assemble(&AssembleInput {
            conversation_id: conv_id,
            token_budget: 100,
            fresh_tail_count: 0,
        });
        assert!(output.messages.is_empty());
    }
}
