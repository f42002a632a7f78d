//! `CompactionEngine`: the hard/soft triggers and the two-pass
//! leaf/condensed compaction loop — a trigger check, a summarization step
//! with escalation, and an atomic splice back into the durable store.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use lcm_core::{estimate_tokens, ContextItem, ContextItemType, LcmError, NewMessagePart, NewSummary, PartBody, Role, SummaryKind};
use lcm_store::{ConversationStore, SummaryStore};
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::config::CompactionConfig;
use crate::summarizer::{SummarizeOptions, Summarizer, SummaryLevel};
use crate::types::{CompactUntilResult, LeafTriggerDecision, PassOutcome, TriggerDecision};

/// One resolved context item together with what it costs and, for
/// summaries, the depth it sits at — the unit selection runs over.
struct ItemDetail {
    ordinal: i64,
    item_type: ContextItemType,
    token_count: u32,
    message_id: Option<i64>,
    summary_id: Option<String>,
    depth: Option<u32>,
    content: String,
}

pub struct CompactionEngine {
    conversations: Arc<ConversationStore>,
    summaries: Arc<SummaryStore>,
    config: CompactionConfig,
    summarizer: Arc<dyn Summarizer>,
}

impl CompactionEngine {
    pub fn new(
        conversations: Arc<ConversationStore>,
        summaries: Arc<SummaryStore>,
        config: CompactionConfig,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            conversations,
            summaries,
            config,
            summarizer,
        })
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Hard (token-budget) trigger: `max(stored, observed) > threshold * budget`.
    pub fn evaluate(&self, conversation_id: i64, token_budget: u32, observed: Option<u32>) -> Result<TriggerDecision> {
        let stored = self.summaries.get_context_token_count(conversation_id)? as u32;
        let effective = observed.map_or(stored, |o| stored.max(o));
        let threshold = (self.config.context_threshold * token_budget as f64).floor() as u32;
        Ok(TriggerDecision {
            should_compact: effective > threshold,
            stored_tokens: stored,
            threshold,
        })
    }

    /// Soft (idle-time) trigger: raw message tokens outside the fresh tail
    /// alone exceed `leaf_chunk_tokens`.
    pub fn evaluate_leaf_trigger(&self, conversation_id: i64) -> Result<LeafTriggerDecision> {
        let items = self.summaries.get_context_items(conversation_id)?;
        let tail_start = fresh_tail_start(&items, self.config.fresh_tail_count);
        let mut raw_tokens = 0u32;
        for item in &items[..tail_start] {
            if item.is_message() {
                if let Some(message_id) = item.message_id {
                    if let Some(message) = self.conversations.get_message_by_id(message_id)? {
                        raw_tokens += message.token_count;
                    }
                }
            }
        }
        Ok(LeafTriggerDecision {
            should_compact: raw_tokens >= self.config.leaf_chunk_tokens,
            raw_tokens_outside_tail: raw_tokens,
            threshold: self.config.leaf_chunk_tokens,
        })
    }

    /// Incremental bound: one leaf pass plus up to `incremental_max_depth`
    /// condensed passes. `force` relaxes fanout gates to the hard-trigger
    /// minimums, as under a hard trigger progress matters more than shape.
    #[instrument(skip(self))]
    pub async fn compact_leaf(&self, conversation_id: i64, force: bool) -> Result<Vec<PassOutcome>> {
        let mut outcomes = Vec::new();
        let leaf_min_fanout = if force { 2 } else { self.config.leaf_min_fanout };

        match self.run_leaf_pass(conversation_id, leaf_min_fanout).await? {
            Some(outcome) if outcome.progressed() => outcomes.push(outcome),
            _ => return Ok(outcomes),
        }

        let condensed_min_fanout = if force {
            self.config.condensed_min_fanout_hard
        } else {
            self.config.condensed_min_fanout
        };
        for _ in 0..self.config.incremental_max_depth {
            match self.run_condensed_pass(conversation_id, condensed_min_fanout).await? {
                Some(outcome) if outcome.progressed() => outcomes.push(outcome),
                _ => break,
            }
        }
        self.emit_pass_events(conversation_id, &outcomes);
        Ok(outcomes)
    }

    /// Repeats leaf passes to exhaustion, then condensed passes to
    /// exhaustion. Stops as soon as a pass makes no progress.
    #[instrument(skip(self))]
    pub async fn compact_full_sweep(&self, conversation_id: i64, force: bool) -> Result<Vec<PassOutcome>> {
        let leaf_min_fanout = if force { 2 } else { self.config.leaf_min_fanout };
        let condensed_min_fanout = if force {
            self.config.condensed_min_fanout_hard
        } else {
            self.config.condensed_min_fanout
        };

        let mut outcomes = Vec::new();
        loop {
            match self.run_leaf_pass(conversation_id, leaf_min_fanout).await? {
                Some(outcome) if outcome.progressed() => outcomes.push(outcome),
                _ => break,
            }
        }
        loop {
            match self.run_condensed_pass(conversation_id, condensed_min_fanout).await? {
                Some(outcome) if outcome.progressed() => outcomes.push(outcome),
                _ => break,
            }
        }
        self.emit_pass_events(conversation_id, &outcomes);
        Ok(outcomes)
    }

    /// Repeats full sweeps until the context token total is at or below
    /// `target`, no sweep makes progress, or `max_rounds` is exhausted. A
    /// caller-provided `current_token_count` equal to `target` forces one
    /// sweep up front, so a caller sitting exactly at `target` still gets
    /// headroom for provider-side framing instead of a zero-round no-op.
    #[instrument(skip(self))]
    pub async fn compact_until_under(
        &self,
        conversation_id: i64,
        target: u32,
        force: bool,
        current_token_count: Option<u32>,
    ) -> Result<CompactUntilResult> {
        let mut current = self.summaries.get_context_token_count(conversation_id)? as u32;
        let mut rounds = 0u32;
        let mut outcomes = Vec::new();

        if current_token_count == Some(target) {
            let sweep = self.compact_full_sweep(conversation_id, true).await?;
            rounds += 1;
            outcomes.extend(sweep);
            current = self.summaries.get_context_token_count(conversation_id)? as u32;
        }

        while current > target && rounds < self.config.max_rounds {
            let sweep = self.compact_full_sweep(conversation_id, force).await?;
            rounds += 1;
            if sweep.is_empty() {
                break;
            }
            outcomes.extend(sweep);
            let next = self.summaries.get_context_token_count(conversation_id)? as u32;
            if next >= current {
                break;
            }
            current = next;
        }

        Ok(CompactUntilResult {
            succeeded: current <= target,
            rounds,
            tokens: current,
            outcomes,
        })
    }

    async fn run_leaf_pass(&self, conversation_id: i64, min_fanout: usize) -> Result<Option<PassOutcome>> {
        let items = self.summaries.get_context_items(conversation_id)?;
        let tail_start = fresh_tail_start(&items, self.config.fresh_tail_count);
        let eligible = self.resolve_items(&items[..tail_start])?;

        let Some((start, end)) = select_message_run(&eligible, self.config.leaf_chunk_tokens) else {
            return Ok(None);
        };
        if end - start < min_fanout {
            return Ok(None);
        }

        let chunk = &eligible[start..end];
        let source_message_ids: Vec<i64> = chunk.iter().map(|d| d.message_id.unwrap()).collect();
        let concatenated = chunk
            .iter()
            .map(|d| d.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let previous_summary = previous_summary_content(&self.summaries, &eligible, start)?;
        let options = SummarizeOptions {
            previous_summary,
            is_condensed: false,
        };

        let tokens_before = self.summaries.get_context_token_count(conversation_id)? as u32;
        let (content, level) = self.escalate_summarize(&concatenated, &options).await?;

        let now = Utc::now();
        let token_count = estimate_tokens(&content);
        let summary_id = lcm_core::ids::new_summary_id(&content, now);
        let file_ids = extract_file_ids(&concatenated, &content);

        self.summaries.insert_summary(NewSummary {
            summary_id: summary_id.clone(),
            conversation_id,
            kind: SummaryKind::Leaf,
            depth: 0,
            content,
            token_count,
            file_ids,
        })?;
        self.summaries
            .link_summary_to_messages(&summary_id, source_message_ids)?;
        self.summaries.replace_context_range_with_summary(
            conversation_id,
            chunk[0].ordinal,
            chunk[chunk.len() - 1].ordinal + 1,
            &summary_id,
        )?;

        let tokens_after = self.summaries.get_context_token_count(conversation_id)? as u32;
        info!(conversation_id, %summary_id, tokens_before, tokens_after, "leaf compaction pass");

        Ok(Some(PassOutcome {
            pass: "leaf",
            level,
            tokens_before,
            tokens_after,
            created_summary_id: summary_id,
            depth: 0,
        }))
    }

    async fn run_condensed_pass(&self, conversation_id: i64, min_fanout: usize) -> Result<Option<PassOutcome>> {
        let items = self.summaries.get_context_items(conversation_id)?;
        let tail_start = fresh_tail_start(&items, self.config.fresh_tail_count);
        let eligible = self.resolve_items(&items[..tail_start])?;
        let depths = self
            .summaries
            .get_distinct_depths_in_context(conversation_id, Some(tail_start as i64))?;

        for depth in depths {
            if let Some(outcome) = self
                .try_condensed_pass_at_depth(conversation_id, &eligible, depth, min_fanout)
                .await?
            {
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    async fn try_condensed_pass_at_depth(
        &self,
        conversation_id: i64,
        eligible: &[ItemDetail],
        depth: u32,
        min_fanout: usize,
    ) -> Result<Option<PassOutcome>> {
        let Some((start, end)) = select_summary_run(eligible, depth, self.config.leaf_chunk_tokens) else {
            return Ok(None);
        };

        let chunk = &eligible[start..end];
        let fanout = chunk.len();
        let target_floor = self
            .config
            .condensed_target_tokens
            .max((self.config.leaf_chunk_tokens as f64 * 0.1).floor() as u32);
        let total_tokens: u32 = chunk.iter().map(|d| d.token_count).sum();

        if fanout < min_fanout || total_tokens < target_floor {
            return Ok(None);
        }

        let parent_ids: Vec<String> = chunk.iter().map(|d| d.summary_id.clone().unwrap()).collect();
        let concatenated = chunk
            .iter()
            .map(|d| d.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let previous_summary = if depth == 0 {
            previous_summary_content(&self.summaries, eligible, start)?
        } else {
            None
        };
        let options = SummarizeOptions {
            previous_summary,
            is_condensed: true,
        };

        let tokens_before = self.summaries.get_context_token_count(conversation_id)? as u32;
        let (content, level) = self.escalate_summarize(&concatenated, &options).await?;

        let now = Utc::now();
        let token_count = estimate_tokens(&content);
        let summary_id = lcm_core::ids::new_summary_id(&content, now);
        let file_ids = extract_file_ids(&concatenated, &content);
        let new_depth = depth + 1;

        self.summaries.insert_summary(NewSummary {
            summary_id: summary_id.clone(),
            conversation_id,
            kind: SummaryKind::Condensed,
            depth: new_depth,
            content,
            token_count,
            file_ids,
        })?;
        self.summaries.link_summary_to_parents(&summary_id, parent_ids)?;
        self.summaries.replace_context_range_with_summary(
            conversation_id,
            chunk[0].ordinal,
            chunk[chunk.len() - 1].ordinal + 1,
            &summary_id,
        )?;

        let tokens_after = self.summaries.get_context_token_count(conversation_id)? as u32;
        info!(conversation_id, %summary_id, depth = new_depth, tokens_before, tokens_after, "condensed compaction pass");

        Ok(Some(PassOutcome {
            pass: "condensed",
            level,
            tokens_before,
            tokens_after,
            created_summary_id: summary_id,
            depth: new_depth,
        }))
    }

    /// Escalation ladder: normal summarizer call, then aggressive, then a
    /// deterministic character-truncation fallback. Stops at the first step
    /// whose output is strictly smaller (in estimated tokens) than the
    /// input, bounding the ladder to at most two summarizer calls.
    async fn escalate_summarize(&self, text: &str, options: &SummarizeOptions) -> Result<(String, SummaryLevel)> {
        let input_tokens = estimate_tokens(text);

        let normal = self
            .summarizer
            .summarize(text, false, options)
            .await
            .map_err(|e| LcmError::SummarizerFailure { reason: e.to_string() })
            .context("normal summarization call failed")?;
        if estimate_tokens(&normal) < input_tokens {
            return Ok((normal, SummaryLevel::Normal));
        }
        warn!(input_tokens, "normal summarization did not shrink input, escalating");

        let aggressive = self
            .summarizer
            .summarize(text, true, options)
            .await
            .map_err(|e| LcmError::SummarizerFailure { reason: e.to_string() })
            .context("aggressive summarization call failed")?;
        if estimate_tokens(&aggressive) < input_tokens {
            return Ok((aggressive, SummaryLevel::Aggressive));
        }
        warn!(input_tokens, "aggressive summarization did not shrink input, falling back to truncation");

        const FALLBACK_MAX_CHARS: usize = 512 * 4;
        let truncated: String = text.chars().take(FALLBACK_MAX_CHARS).collect();
        let fallback = format!("{truncated}\n[Truncated from {input_tokens} tokens]");
        Ok((fallback, SummaryLevel::Fallback))
    }

    /// Emits one durable event per accepted pass in `outcomes`. All events
    /// from the same `compact_leaf`/`compact_full_sweep` call share
    /// `created_summary_ids` (every summary created in that call) and
    /// `condensed_pass_occurred` (whether any pass in the call was a
    /// condensed pass), so a leaf event still records that a condensed pass
    /// immediately followed it.
    fn emit_pass_events(&self, conversation_id: i64, outcomes: &[PassOutcome]) {
        if outcomes.is_empty() {
            return;
        }
        let created_summary_ids: Vec<String> = outcomes.iter().map(|o| o.created_summary_id.clone()).collect();
        let condensed_pass_occurred = outcomes.iter().any(|o| o.pass == "condensed");
        for outcome in outcomes {
            self.emit_compaction_event(
                conversation_id,
                outcome.pass,
                outcome.level,
                outcome.tokens_before,
                outcome.tokens_after,
                outcome.created_summary_id.clone(),
                created_summary_ids.clone(),
                condensed_pass_occurred,
            );
        }
    }

    /// Best-effort: failures to persist the event never abort the pass that
    /// already committed the summary + splice.
    #[allow(clippy::too_many_arguments)]
    fn emit_compaction_event(
        &self,
        conversation_id: i64,
        pass: &'static str,
        level: SummaryLevel,
        tokens_before: u32,
        tokens_after: u32,
        created_summary_id: String,
        created_summary_ids: Vec<String>,
        condensed_pass_occurred: bool,
    ) {
        let metadata = serde_json::json!({
            "conversation_id": conversation_id,
            "pass": pass,
            "level": level.as_str(),
            "tokens_before": tokens_before,
            "tokens_after": tokens_after,
            "created_summary_id": created_summary_id,
            "created_summary_ids": created_summary_ids,
            "condensed_pass_occurred": condensed_pass_occurred,
        });
        let result = (|| -> Result<()> {
            let seq = self.conversations.get_max_seq(conversation_id)? + 1;
            let message = self.conversations.create_message(
                conversation_id,
                seq,
                Role::System,
                format!("[compaction:{pass}:{}]", level.as_str()),
            )?;
            self.conversations.create_message_parts(
                message.message_id,
                "compaction-engine",
                vec![NewMessagePart {
                    ordinal: 0,
                    body: PartBody::Compaction { metadata },
                }],
            )?;
            Ok(())
        })();
        if let Err(error) = result {
            warn!(%error, conversation_id, "failed to persist compaction event, continuing");
        }
    }

    fn resolve_items(&self, items: &[ContextItem]) -> Result<Vec<ItemDetail>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item.item_type {
                ContextItemType::Message => {
                    let message_id = item.message_id.context("message item missing message_id")?;
                    let message = self
                        .conversations
                        .get_message_by_id(message_id)?
                        .context("context item references a missing message")?;
                    out.push(ItemDetail {
                        ordinal: item.ordinal,
                        item_type: ContextItemType::Message,
                        token_count: message.token_count,
                        message_id: Some(message_id),
                        summary_id: None,
                        depth: None,
                        content: message.content,
                    });
                }
                ContextItemType::Summary => {
                    let summary_id = item.summary_id.clone().context("summary item missing summary_id")?;
                    let summary = self
                        .summaries
                        .get_summary(&summary_id)?
                        .context("context item references a missing summary")?;
                    out.push(ItemDetail {
                        ordinal: item.ordinal,
                        item_type: ContextItemType::Summary,
                        token_count: summary.token_count,
                        message_id: None,
                        summary_id: Some(summary_id),
                        depth: Some(summary.depth),
                        content: summary.content,
                    });
                }
            }
        }
        Ok(out)
    }
}

fn previous_summary_content(summaries: &SummaryStore, eligible: &[ItemDetail], run_start: usize) -> Result<Option<String>> {
    if run_start == 0 {
        return Ok(None);
    }
    let prior = &eligible[run_start - 1];
    if prior.item_type != ContextItemType::Summary {
        return Ok(None);
    }
    let Some(summary_id) = &prior.summary_id else {
        return Ok(None);
    };
    Ok(summaries.get_summary(summary_id)?.map(|s| s.content))
}

/// Index where the fresh tail begins: walk backward until `fresh_tail_count`
/// message-type items have been counted.
fn fresh_tail_start(items: &[ContextItem], fresh_tail_count: usize) -> usize {
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

/// The oldest contiguous run of message-type items, extended while the
/// running total stays within `leaf_chunk_tokens` (always including at
/// least the first eligible message). Returns `(start, end)` as indices
/// into `eligible`, exclusive of `end`.
fn select_message_run(eligible: &[ItemDetail], leaf_chunk_tokens: u32) -> Option<(usize, usize)> {
    let start = eligible.iter().position(|d| d.item_type == ContextItemType::Message)?;
    let mut end = start;
    let mut total = 0u32;
    while end < eligible.len() && eligible[end].item_type == ContextItemType::Message {
        let next_total = total + eligible[end].token_count;
        if end > start && next_total > leaf_chunk_tokens {
            break;
        }
        total = next_total;
        end += 1;
    }
    Some((start, end))
}

/// The oldest contiguous run of summary items at exactly `depth`, extended
/// while the running total stays within `leaf_chunk_tokens`.
fn select_summary_run(eligible: &[ItemDetail], depth: u32, leaf_chunk_tokens: u32) -> Option<(usize, usize)> {
    let start = eligible
        .iter()
        .position(|d| d.item_type == ContextItemType::Summary && d.depth == Some(depth))?;
    let mut end = start;
    let mut total = 0u32;
    while end < eligible.len()
        && eligible[end].item_type == ContextItemType::Summary
        && eligible[end].depth == Some(depth)
    {
        let next_total = total + eligible[end].token_count;
        if end > start && next_total > leaf_chunk_tokens {
            break;
        }
        total = next_total;
        end += 1;
    }
    Some((start, end))
}

fn file_id_pattern() -> Regex {
    Regex::new(r"file_[0-9a-f]{16}").expect("static file id pattern is valid")
}

/// File ids referenced by either the source text or the produced summary,
/// deduplicated, order preserved.
fn extract_file_ids(source: &str, summary: &str) -> Vec<String> {
    let pattern = file_id_pattern();
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for hit in pattern.find_iter(source).chain(pattern.find_iter(summary)) {
        let id = hit.as_str().to_owned();
        if seen.insert(id.clone()) {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lcm_core::Role as R;
    use lcm_store::Db;

    struct StubSummarizer;

    #[async_trait]
    impl Summarizer for StubSummarizer {
        async fn summarize(&self, text: &str, aggressive: bool, _options: &SummarizeOptions) -> Result<String> {
            if aggressive {
                Ok(format!("short summary of {} chars", text.len().min(9)))
            } else {
                // Deliberately doesn't shrink, to exercise escalation in some tests.
                Ok(text.to_owned())
            }
        }
    }

    struct ShrinkingSummarizer;

    #[async_trait]
    impl Summarizer for ShrinkingSummarizer {
        async fn summarize(&self, text: &str, _aggressive: bool, _options: &SummarizeOptions) -> Result<String> {
            Ok(format!("summary of {} messages", text.matches("Message").count().max(1)))
        }
    }

    fn setup(summarizer: Arc<dyn Summarizer>) -> (CompactionEngine, Arc<ConversationStore>, Arc<SummaryStore>, i64) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let conversations = Arc::new(ConversationStore::new(db.clone()));
        let summaries = Arc::new(SummaryStore::new(db));
        let conv = conversations.get_or_create_conversation("s1").unwrap();
        let mut config = CompactionConfig::default();
        config.leaf_chunk_tokens = 50;
        config.leaf_min_fanout = 2;
        config.fresh_tail_count = 1;
        let engine = CompactionEngine::new(conversations.clone(), summaries.clone(), config, summarizer).unwrap();
        (engine, conversations, summaries, conv.conversation_id)
    }

    #[tokio::test]
    async fn leaf_pass_compacts_oldest_messages_and_keeps_tail() {
        let (engine, conversations, summaries, conv_id) = setup(Arc::new(ShrinkingSummarizer));
        for i in 0..6 {
            let msg = conversations
                .create_message(conv_id, i + 1, R::User, format!("Message number {i}"))
                .unwrap();
            summaries.append_context_message(conv_id, msg.message_id).unwrap();
        }

        let outcomes = engine.compact_leaf(conv_id, false).await.unwrap();
        assert!(!outcomes.is_empty());
        assert_eq!(outcomes[0].pass, "leaf");

        let items = summaries.get_context_items(conv_id).unwrap();
        let ordinals: Vec<i64> = items.iter().map(|i| i.ordinal).collect();
        assert_eq!(ordinals, (0..ordinals.len() as i64).collect::<Vec<_>>());
        assert!(items.last().unwrap().is_message(), "fresh tail must remain a raw message");
    }

    #[tokio::test]
    async fn below_min_fanout_produces_no_pass() {
        let (engine, conversations, summaries, conv_id) = setup(Arc::new(ShrinkingSummarizer));
        let msg = conversations.create_message(conv_id, 1, R::User, "only message").unwrap();
        summaries.append_context_message(conv_id, msg.message_id).unwrap();

        let outcomes = engine.compact_leaf(conv_id, false).await.unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn escalation_falls_back_to_truncation_when_summarizer_never_shrinks() {
        let (engine, conversations, summaries, conv_id) = setup(Arc::new(StubSummarizer));
        for i in 0..3 {
            let msg = conversations
                .create_message(conv_id, i + 1, R::User, "x".repeat(40))
                .unwrap();
            summaries.append_context_message(conv_id, msg.message_id).unwrap();
        }

        let outcomes = engine.compact_leaf(conv_id, true).await.unwrap();
        assert_eq!(outcomes[0].level, SummaryLevel::Fallback);
    }

    #[tokio::test]
    async fn condensed_pass_links_parents_and_increments_depth() {
        let (engine, conversations, summaries, conv_id) = setup(Arc::new(ShrinkingSummarizer));
        for i in 0..12 {
            let msg = conversations
                .create_message(conv_id, i + 1, R::User, format!("Message number {i}"))
                .unwrap();
            summaries.append_context_message(conv_id, msg.message_id).unwrap();
        }
        let outcomes = engine.compact_full_sweep(conv_id, true).await.unwrap();
        let condensed = outcomes.iter().find(|o| o.pass == "condensed");
        if let Some(outcome) = condensed {
            assert_eq!(outcome.depth, 1);
            let parents = summaries.get_summary_parents(&outcome.created_summary_id).unwrap();
            assert!(parents.len() >= 2);
        }
    }
}
