//! Facade-level integration scenarios: build a real store, drive the
//! public API end to end, and assert on the returned envelopes.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lcm_compaction::{CompactionConfig, SummarizeOptions, Summarizer};
use lcm_core::Role;
use lcm_facade::{
    AfterTurnInput, AssembleInput, CompactInput, CompactionTarget, Facade, FacadeConfig,
    IngestMessage, SessionFileMessage, SessionFileReader,
};

struct RecordingSummarizer;

#[async_trait]
impl Summarizer for RecordingSummarizer {
    async fn summarize(&self, text: &str, aggressive: bool, _options: &SummarizeOptions) -> Result<String> {
        if aggressive {
            Ok("Aggressively summarized.".to_owned())
        } else {
            Ok(format!("Summary: condensed version of {} chars", text.len()))
        }
    }
}

struct StaticSessionFileReader(Vec<SessionFileMessage>);

#[async_trait]
impl SessionFileReader for StaticSessionFileReader {
    async fn read(&self, _session_file: &str) -> Result<Vec<SessionFileMessage>> {
        Ok(self.0.clone())
    }
}

fn facade_with_session_file(messages: Vec<SessionFileMessage>) -> Facade {
    facade_with_config(messages, CompactionConfig::default())
}

fn facade_with_config(messages: Vec<SessionFileMessage>, compaction_config: CompactionConfig) -> Facade {
    Facade::open_in_memory(
        compaction_config,
        Arc::new(RecordingSummarizer),
        Arc::new(StaticSessionFileReader(messages)),
        FacadeConfig::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn ingest_then_assemble_pass_through() {
    let facade = facade_with_session_file(vec![]);
    for i in 0..5 {
        facade
            .ingest(
                "s1",
                IngestMessage {
                    role: if i % 2 == 0 { Role::User } else { Role::Assistant },
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
async fn leaf_compaction_creates_summary_and_prunes_oldest() {
    let facade = facade_with_session_file(vec![]);
    for i in 0..10 {
        facade
            .ingest(
                "s1",
                IngestMessage {
                    role: Role::User,
                    content: format!("Turn {i}: discussion about topic {i}"),
                    parts: vec![],
                },
                false,
            )
            .await
            .unwrap();
    }

    let result = facade
        .compact(
            "s1",
            CompactInput {
                session_file: "unused".into(),
                token_budget: Some(10_000),
                current_token_count: None,
                compaction_target: CompactionTarget::Budget,
                custom_instructions: None,
                force: true,
                legacy_manual_compaction: false,
            },
        )
        .await
        .unwrap();

    assert!(result.ok);
    assert!(result.compacted);
    assert!(result.result.iter().any(|o| o.pass == "leaf"));
    assert!(
        result
            .result
            .iter()
            .find(|o| o.pass == "leaf")
            .unwrap()
            .created_summary_id
            .starts_with("sum_")
    );
}

#[tokio::test]
async fn bootstrap_imports_missing_suffix_and_is_idempotent() {
    let session_messages = vec![
        SessionFileMessage {
            role: Role::User,
            content: "hello".into(),
        },
        SessionFileMessage {
            role: Role::Assistant,
            content: "hi there".into(),
        },
        SessionFileMessage {
            role: Role::User,
            content: "new turn not yet stored".into(),
        },
    ];
    let facade = facade_with_session_file(session_messages);

    facade
        .ingest(
            "s1",
            IngestMessage {
                role: Role::User,
                content: "hello".into(),
                parts: vec![],
            },
            false,
        )
        .await
        .unwrap();
    facade
        .ingest(
            "s1",
            IngestMessage {
                role: Role::Assistant,
                content: "hi there".into(),
            parts: vec![],
            },
            false,
        )
        .await
        .unwrap();

    let first = facade.bootstrap("s1", "session.log").await.unwrap();
    assert!(first.bootstrapped);
    assert_eq!(first.imported_messages, 1, "only the missing suffix turn is imported");

    let second = facade.bootstrap("s1", "session.log").await.unwrap();
    assert_eq!(second.imported_messages, 0, "re-bootstrap is idempotent once the tail matches");
}

#[tokio::test]
async fn after_turn_runs_best_effort_compaction_under_pressure() {
    let mut config = CompactionConfig::default();
    config.leaf_chunk_tokens = 80;
    config.leaf_min_fanout = 2;
    config.fresh_tail_count = 2;
    let facade = facade_with_config(vec![], config);
    let messages: Vec<IngestMessage> = (0..12)
        .map(|i| IngestMessage {
            role: Role::User,
            content: format!("Turn {i}: {}", "word ".repeat(20)),
            parts: vec![],
        })
        .collect();

    let output = facade
        .after_turn(
            "s1",
            AfterTurnInput {
                session_file: "unused".into(),
                messages,
                pre_prompt_message_count: 0,
                auto_compaction_summary: None,
                heartbeat: false,
                token_budget: Some(50),
            },
        )
        .await
        .unwrap();

    assert_eq!(output.ingested_count, 12);
    assert!(output.compaction_attempted);
}
