//! Per-session serialized entry point: `bootstrap / ingest / ingest_batch /
//! after_turn / assemble / compact / evaluate_leaf_trigger /
//! compact_leaf_async / dispose`, composing the store, assembler,
//! compaction, and retrieval crates behind a per-`session_id` FIFO.

mod large_files;
mod session_file;
mod types;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use lcm_assembler::ContextAssembler;
use lcm_compaction::CompactionEngine;
use lcm_core::ids;
use lcm_retrieval::RetrievalEngine;
use lcm_store::{ConversationStore, Db, SummaryStore};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{instrument, warn};

pub use large_files::default_storage_root;
pub use session_file::{SessionFileMessage, SessionFileReader};
pub use types::{
    AfterTurnInput, AfterTurnOutput, AssembleInput, AssembleOutput, AssembledLine,
    BootstrapOutput, CompactInput, CompactOutput, CompactionTarget, IngestBatchOutput,
    IngestMessage, PassOutcome,
};

#[derive(Debug, Clone)]
pub struct FacadeConfig {
    pub large_file_token_threshold: u32,
    pub storage_root: PathBuf,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            large_file_token_threshold: 2_000,
            storage_root: default_storage_root(),
        }
    }
}

pub struct Facade {
    conversations: Arc<ConversationStore>,
    summaries: Arc<SummaryStore>,
    assembler: ContextAssembler,
    compaction: CompactionEngine,
    retrieval: RetrievalEngine,
    session_file_reader: Arc<dyn SessionFileReader>,
    config: FacadeConfig,
    session_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Facade {
    pub fn open(
        db_path: impl AsRef<std::path::Path>,
        compaction_config: lcm_compaction::CompactionConfig,
        summarizer: Arc<dyn lcm_compaction::Summarizer>,
        session_file_reader: Arc<dyn SessionFileReader>,
        config: FacadeConfig,
    ) -> Result<Self> {
        let db = Arc::new(Db::open(db_path)?);
        Self::from_db(db, compaction_config, summarizer, session_file_reader, config)
    }

    pub fn open_in_memory(
        compaction_config: lcm_compaction::CompactionConfig,
        summarizer: Arc<dyn lcm_compaction::Summarizer>,
        session_file_reader: Arc<dyn SessionFileReader>,
        config: FacadeConfig,
    ) -> Result<Self> {
        let db = Arc::new(Db::open_in_memory()?);
        Self::from_db(db, compaction_config, summarizer, session_file_reader, config)
    }

    fn from_db(
        db: Arc<Db>,
        compaction_config: lcm_compaction::CompactionConfig,
        summarizer: Arc<dyn lcm_compaction::Summarizer>,
        session_file_reader: Arc<dyn SessionFileReader>,
        config: FacadeConfig,
    ) -> Result<Self> {
        let conversations = Arc::new(ConversationStore::new(db.clone()));
        let summaries = Arc::new(SummaryStore::new(db));
        let assembler = ContextAssembler::new(conversations.clone(), summaries.clone());
        let compaction = CompactionEngine::new(
            conversations.clone(),
            summaries.clone(),
            compaction_config,
            summarizer,
        )?;
        let retrieval = RetrievalEngine::new(conversations.clone(), summaries.clone());
        Ok(Self {
            conversations,
            summaries,
            assembler,
            compaction,
            retrieval,
            session_file_reader,
            config,
            session_locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn retrieval(&self) -> &RetrievalEngine {
        &self.retrieval
    }

    fn session_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.session_locks.lock().expect("session lock map poisoned");
        locks
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Releases this facade's hold on `session_id`'s serialization lock.
    /// Safe to call even if a lock was never taken for this session.
    pub fn dispose(&self, session_id: &str) {
        self.session_locks
            .lock()
            .expect("session lock map poisoned")
            .remove(session_id);
    }

    #[instrument(skip(self))]
    pub async fn bootstrap(&self, session_id: &str, session_file: &str) -> Result<BootstrapOutput> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let conversation = self.conversations.get_or_create_conversation(session_id)?;
        let session_messages = match self.session_file_reader.read(session_file).await {
            Ok(messages) => messages,
            Err(error) => {
                return Ok(BootstrapOutput {
                    bootstrapped: false,
                    imported_messages: 0,
                    reason: Some(format!("failed to read session file: {error}")),
                });
            }
        };

        let stored = self.conversations.get_messages(conversation.conversation_id, None, None)?;
        let stored_hashes: Vec<String> = stored
            .iter()
            .map(|m| ids::content_hash(m.role.as_str(), &m.content))
            .collect();
        let session_hashes: Vec<String> = session_messages
            .iter()
            .map(|m| ids::content_hash(m.role.as_str(), &m.content))
            .collect();

        let overlap = suffix_prefix_overlap(&stored_hashes, &session_hashes);
        let to_import = &session_messages[overlap..];

        let mut imported = 0usize;
        if !to_import.is_empty() {
            let mut seq = self.conversations.get_max_seq(conversation.conversation_id)?;
            let mut news = Vec::with_capacity(to_import.len());
            for message in to_import {
                seq += 1;
                news.push(lcm_core::NewMessage {
                    conversation_id: conversation.conversation_id,
                    seq,
                    role: message.role,
                    content: message.content.clone(),
                    token_count: lcm_core::estimate_tokens(&message.content),
                });
            }
            let created = self.conversations.create_messages_bulk(news)?;
            self.summaries
                .append_context_messages(conversation.conversation_id, created.iter().map(|m| m.message_id).collect())?;
            imported = created.len();
        }

        if conversation.bootstrapped_at.is_none() {
            self.conversations.mark_conversation_bootstrapped(conversation.conversation_id)?;
        }

        Ok(BootstrapOutput {
            bootstrapped: true,
            imported_messages: imported,
            reason: None,
        })
    }

    #[instrument(skip(self, message))]
    pub async fn ingest(&self, session_id: &str, message: IngestMessage, heartbeat: bool) -> Result<()> {
        if heartbeat {
            return Ok(());
        }
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        self.ingest_locked(session_id, message).await?;
        Ok(())
    }

    #[instrument(skip(self, messages))]
    pub async fn ingest_batch(
        &self,
        session_id: &str,
        messages: Vec<IngestMessage>,
        heartbeat: bool,
    ) -> Result<IngestBatchOutput> {
        if heartbeat {
            return Ok(IngestBatchOutput::default());
        }
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        let mut ingested_count = 0usize;
        for message in messages {
            self.ingest_locked(session_id, message).await?;
            ingested_count += 1;
        }
        Ok(IngestBatchOutput { ingested_count })
    }

    /// Caller must already hold this session's lock.
    async fn ingest_locked(&self, session_id: &str, message: IngestMessage) -> Result<i64> {
        let conversation = self.conversations.get_or_create_conversation(session_id)?;
        let content = large_files::intercept_large_files(
            &self.summaries,
            &self.config.storage_root,
            conversation.conversation_id,
            self.config.large_file_token_threshold,
            &message.content,
        )
        .await?;
        let seq = self.conversations.get_max_seq(conversation.conversation_id)? + 1;
        let stored = self
            .conversations
            .create_message(conversation.conversation_id, seq, message.role, content)?;
        if !message.parts.is_empty() {
            self.conversations
                .create_message_parts(stored.message_id, session_id, message.parts)?;
        }
        self.summaries
            .append_context_message(conversation.conversation_id, stored.message_id)?;
        Ok(stored.message_id)
    }

    #[instrument(skip(self, input))]
    pub async fn after_turn(&self, session_id: &str, input: AfterTurnInput) -> Result<AfterTurnOutput> {
        if input.heartbeat {
            return Ok(AfterTurnOutput::default());
        }
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let new_messages = input.messages.into_iter().skip(input.pre_prompt_message_count);
        let mut ingested_count = 0usize;
        for message in new_messages {
            self.ingest_locked(session_id, message).await?;
            ingested_count += 1;
        }

        if let Some(summary_text) = input.auto_compaction_summary {
            let conversation = self.conversations.get_or_create_conversation(session_id)?;
            let now = chrono::Utc::now();
            let token_count = lcm_core::estimate_tokens(&summary_text);
            let summary_id = ids::new_summary_id(&summary_text, now);
            self.summaries.insert_summary(lcm_core::NewSummary {
                summary_id: summary_id.clone(),
                conversation_id: conversation.conversation_id,
                kind: lcm_core::SummaryKind::Leaf,
                depth: 0,
                content: summary_text,
                token_count,
                file_ids: vec![],
            })?;
            self.summaries.append_context_summary(conversation.conversation_id, &summary_id)?;
        }

        let mut compaction_attempted = false;
        let mut compacted = false;
        if let Some(token_budget) = input.token_budget {
            let conversation = self.conversations.get_or_create_conversation(session_id)?;
            let leaf_trigger = self.compaction.evaluate_leaf_trigger(conversation.conversation_id)?;
            if leaf_trigger.should_compact {
                compaction_attempted = true;
                let target = (self.compaction.config().context_threshold * token_budget as f64).floor() as u32;
                match self
                    .compaction
                    .compact_until_under(conversation.conversation_id, target, false, None)
                    .await
                {
                    Ok(result) => compacted = !result.outcomes.is_empty(),
                    Err(error) => warn!(%error, session_id, "best-effort after-turn compaction failed"),
                }
            }
        }

        Ok(AfterTurnOutput {
            ingested_count,
            compaction_attempted,
            compacted,
        })
    }

    /// Fallback semantics: stored context empty, clearly trailing
    /// the live transcript, or the assembler erroring all degrade to the
    /// live `messages[]` passed through unchanged with `estimated_tokens = 0`.
    #[instrument(skip(self, input))]
    pub async fn assemble(&self, session_id: &str, input: AssembleInput) -> Result<AssembleOutput> {
        let conversation = self.conversations.get_or_create_conversation(session_id)?;
        let stored_count = self.summaries.get_context_items(conversation.conversation_id)?.len();
        let has_summaries = !self
            .summaries
            .get_summaries_by_conversation(conversation.conversation_id)?
            .is_empty();

        let trails_live = !has_summaries && stored_count < input.messages.len();
        if stored_count == 0 || trails_live {
            return Ok(AssembleOutput {
                messages: input.messages.into_iter().map(AssembledLine::Live).collect(),
                estimated_tokens: 0,
            });
        }

        let output = self.assembler.assemble(&lcm_assembler::AssembleInput {
            conversation_id: conversation.conversation_id,
            token_budget: input.token_budget.unwrap_or(u32::MAX),
            fresh_tail_count: self.compaction.config().fresh_tail_count,
        });

        Ok(AssembleOutput {
            messages: output.messages.into_iter().map(AssembledLine::Stored).collect(),
            estimated_tokens: output.estimated_tokens,
        })
    }

    #[instrument(skip(self, input))]
    pub async fn compact(&self, session_id: &str, input: CompactInput) -> Result<CompactOutput> {
        let Some(token_budget) = input.token_budget else {
            return Ok(CompactOutput {
                ok: false,
                compacted: false,
                reason: Some("missing token budget".to_owned()),
                result: vec![],
            });
        };

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let conversation = self.conversations.get_or_create_conversation(session_id)?;
        let force = input.force || input.legacy_manual_compaction;
        let decision = self
            .compaction
            .evaluate(conversation.conversation_id, token_budget, input.current_token_count)?;

        if !force && !decision.should_compact {
            return Ok(CompactOutput {
                ok: true,
                compacted: false,
                reason: Some("below compaction threshold".to_owned()),
                result: vec![],
            });
        }

        let outcomes = if force {
            self.compaction.compact_full_sweep(conversation.conversation_id, true).await?
        } else {
            let target = match input.compaction_target {
                CompactionTarget::Budget => token_budget,
                CompactionTarget::Threshold => decision.threshold,
            };
            self.compaction
                .compact_until_under(conversation.conversation_id, target, false, input.current_token_count)
                .await?
                .outcomes
        };

        let compacted = !outcomes.is_empty();
        Ok(CompactOutput {
            ok: true,
            compacted,
            reason: None,
            result: outcomes,
        })
    }

    #[instrument(skip(self))]
    pub async fn evaluate_leaf_trigger(&self, session_id: &str) -> Result<lcm_compaction::LeafTriggerDecision> {
        let conversation = self.conversations.get_or_create_conversation(session_id)?;
        self.compaction.evaluate_leaf_trigger(conversation.conversation_id)
    }

    #[instrument(skip(self))]
    pub async fn compact_leaf_async(&self, session_id: &str, force: bool) -> Result<Vec<PassOutcome>> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        let conversation = self.conversations.get_or_create_conversation(session_id)?;
        self.compaction.compact_leaf(conversation.conversation_id, force).await
    }
}

/// Largest `k` such that `session[..k]` equals the last `k` entries of
/// `stored` — the overlap `bootstrap` reconciliation needs to find the
/// missing suffix to import.
fn suffix_prefix_overlap(stored: &[String], session: &[String]) -> usize {
    let max_k = stored.len().min(session.len());
    for k in (0..=max_k).rev() {
        if stored[stored.len() - k..] == session[..k] {
            return k;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcm_compaction::{SummarizeOptions, Summarizer};
    use lcm_core::Role as R;

    struct EchoSummarizer;

    #[async_trait::async_trait]
    impl Summarizer for EchoSummarizer {
        async fn summarize(&self, text: &str, _aggressive: bool, _options: &SummarizeOptions) -> Result<String> {
            Ok(format!("summary of {} chars", text.len().min(9)))
        }
    }

    struct EmptySessionFileReader;

    #[async_trait::async_trait]
    impl SessionFileReader for EmptySessionFileReader {
        async fn read(&self, _session_file: &str) -> Result<Vec<SessionFileMessage>> {
            Ok(vec![])
        }
    }

    fn facade() -> Facade {
        Facade::open_in_memory(
            lcm_compaction::CompactionConfig::default(),
            Arc::new(EchoSummarizer),
            Arc::new(EmptySessionFileReader),
            FacadeConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn ingest_then_assemble_passes_through_raw_messages() {
        let facade = facade();
        for i in 0..5 {
            facade
                .ingest(
                    "s1",
                    IngestMessage {
                        role: if i % 2 == 0 { R::User } else { R::Assistant },
                        content: format!("Message {i}"),
                        parts: vec![],
                    },
                    false,
                )
                .await
                .unwrap();
        }

        let output = facade
            .assemble(
                "s1",
                AssembleInput {
                    messages: vec![],
                    token_budget: Some(100_000),
                },
            )
            .await
            .unwrap();
        assert_eq!(output.messages.len(), 5);
    }

    #[tokio::test]
    async fn compact_without_token_budget_reports_missing_budget() {
        let facade = facade();
        let result = facade
            .compact(
                "s1",
                CompactInput {
                    session_file: "unused".into(),
                    token_budget: None,
                    current_token_count: None,
                    compaction_target: CompactionTarget::Budget,
                    custom_instructions: None,
                    force: false,
                    legacy_manual_compaction: false,
                },
            )
            .await
            .unwrap();
        assert!(!result.ok);
        assert_eq!(result.reason.as_deref(), Some("missing token budget"));
    }

    #[tokio::test]
    async fn heartbeat_ingest_never_mutates_state() {
        let facade = facade();
        facade
            .ingest(
                "s1",
                IngestMessage {
                    role: R::User,
                    content: "should not persist".into(),
                    parts: vec![],
                },
                true,
            )
            .await
            .unwrap();

        let output = facade
            .assemble(
                "s1",
                AssembleInput {
                    messages: vec![],
                    token_budget: Some(1000),
                },
            )
            .await
            .unwrap();
        assert!(output.messages.is_empty());
    }

    #[tokio::test]
    async fn dispose_then_reuse_session_still_works() {
        let facade = facade();
        facade
            .ingest(
                "s1",
                IngestMessage {
                    role: R::User,
                    content: "hello".into(),
                    parts: vec![],
                },
                false,
            )
            .await
            .unwrap();
        facade.dispose("s1");
        facade
            .ingest(
                "s1",
                IngestMessage {
                    role: R::User,
                    content: "world".into(),
                    parts: vec![],
                },
                false,
            )
            .await
            .unwrap();

        let output = facade
            .assemble(
                "s1",
                AssembleInput {
                    messages: vec![],
                    token_budget: Some(1000),
                },
            )
            .await
            .unwrap();
        assert_eq!(output.messages.len(), 2);
    }
}
