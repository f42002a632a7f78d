//! High-level, transaction-per-call API over [`crate::summary_ops`].

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use lcm_core::{
    ContextItem, LargeFile, NewLargeFile, NewSummary, SearchQuery, Summary, SummarySearchHit,
};
use tracing::instrument;

use crate::Db;
use crate::conversation_ops;
use crate::summary_ops;

#[derive(Clone)]
pub struct SummaryStore {
    db: Arc<Db>,
}

impl SummaryStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    #[instrument(skip(self, new), fields(summary_id = %new.summary_id))]
    pub fn insert_summary(&self, new: NewSummary) -> Result<Summary> {
        let now = Utc::now();
        self.db
            .with_transaction(move |conn| summary_ops::insert_summary_tx(conn, &new, now))
    }

    pub fn link_summary_to_messages(&self, summary_id: &str, message_ids: Vec<i64>) -> Result<()> {
        let summary_id = summary_id.to_owned();
        self.db.with_transaction(move |conn| {
            summary_ops::link_summary_to_messages_tx(conn, &summary_id, &message_ids)
        })
    }

    pub fn link_summary_to_parents(&self, summary_id: &str, parent_ids: Vec<String>) -> Result<()> {
        let summary_id = summary_id.to_owned();
        self.db.with_transaction(move |conn| {
            summary_ops::link_summary_to_parents_tx(conn, &summary_id, &parent_ids)
        })
    }

    pub fn get_summary(&self, summary_id: &str) -> Result<Option<Summary>> {
        self.db
            .with_read(|conn| summary_ops::get_summary_tx(conn, summary_id))
    }

    pub fn get_summaries_by_conversation(&self, conversation_id: i64) -> Result<Vec<Summary>> {
        self.db
            .with_read(|conn| summary_ops::get_summaries_by_conversation_tx(conn, conversation_id))
    }

    pub fn get_summary_messages(&self, summary_id: &str) -> Result<Vec<i64>> {
        self.db
            .with_read(|conn| summary_ops::get_summary_messages_tx(conn, summary_id))
    }

    pub fn get_summary_parents(&self, summary_id: &str) -> Result<Vec<String>> {
        self.db
            .with_read(|conn| summary_ops::get_summary_parents_tx(conn, summary_id))
    }

    pub fn get_summary_children(&self, summary_id: &str) -> Result<Vec<String>> {
        self.db
            .with_read(|conn| summary_ops::get_summary_children_tx(conn, summary_id))
    }

    pub fn get_context_items(&self, conversation_id: i64) -> Result<Vec<ContextItem>> {
        self.db
            .with_read(|conn| summary_ops::get_context_items_tx(conn, conversation_id))
    }

    pub fn append_context_message(&self, conversation_id: i64, message_id: i64) -> Result<()> {
        let now = Utc::now();
        self.db.with_transaction(move |conn| {
            summary_ops::append_context_message_tx(conn, conversation_id, message_id, now)
        })
    }

    pub fn append_context_messages(&self, conversation_id: i64, message_ids: Vec<i64>) -> Result<()> {
        let now = Utc::now();
        self.db.with_transaction(move |conn| {
            summary_ops::append_context_messages_tx(conn, conversation_id, &message_ids, now)
        })
    }

    pub fn append_context_summary(&self, conversation_id: i64, summary_id: &str) -> Result<()> {
        let summary_id = summary_id.to_owned();
        let now = Utc::now();
        self.db.with_transaction(move |conn| {
            summary_ops::append_context_summary_tx(conn, conversation_id, &summary_id, now)
        })
    }

    #[instrument(skip(self))]
    pub fn replace_context_range_with_summary(
        &self,
        conversation_id: i64,
        start_ordinal: i64,
        end_ordinal: i64,
        summary_id: &str,
    ) -> Result<()> {
        let summary_id = summary_id.to_owned();
        let now = Utc::now();
        self.db.with_transaction(move |conn| {
            summary_ops::replace_context_range_with_summary_tx(
                conn,
                conversation_id,
                start_ordinal,
                end_ordinal,
                &summary_id,
                now,
            )
        })
    }

    pub fn get_context_token_count(&self, conversation_id: i64) -> Result<i64> {
        self.db
            .with_read(|conn| summary_ops::get_context_token_count_tx(conn, conversation_id))
    }

    pub fn get_distinct_depths_in_context(
        &self,
        conversation_id: i64,
        max_ordinal_exclusive: Option<i64>,
    ) -> Result<Vec<u32>> {
        self.db.with_read(|conn| {
            summary_ops::get_distinct_depths_in_context_tx(
                conn,
                conversation_id,
                max_ordinal_exclusive,
            )
        })
    }

    #[instrument(skip(self, query), fields(limit = query.limit))]
    pub fn search_summaries(&self, query: &SearchQuery) -> Result<Vec<SummarySearchHit>> {
        self.db
            .with_read(|conn| summary_ops::search_summaries_tx(conn, query))
    }

    pub fn insert_large_file(&self, new: NewLargeFile) -> Result<LargeFile> {
        let now = Utc::now();
        self.db
            .with_transaction(move |conn| summary_ops::insert_large_file_tx(conn, &new, now))
    }

    pub fn get_large_file(&self, file_id: &str) -> Result<Option<LargeFile>> {
        self.db
            .with_read(|conn| summary_ops::get_large_file_tx(conn, file_id))
    }

    pub fn get_large_files_by_conversation(&self, conversation_id: i64) -> Result<Vec<LargeFile>> {
        self.db
            .with_read(|conn| summary_ops::get_large_files_by_conversation_tx(conn, conversation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcm_core::SummaryKind;

    #[test]
    fn insert_and_fetch_summary() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let conversation_id = db
            .with_transaction(|conn| {
                conversation_ops::get_or_create_conversation_tx(conn, "s1", Utc::now())
            })
            .unwrap();
        let store = SummaryStore::new(db);
        let summary = store
            .insert_summary(NewSummary {
                summary_id: "sum_abc".into(),
                conversation_id,
                kind: SummaryKind::Leaf,
                depth: 0,
                content: "a summary of the early turns".into(),
                token_count: 8,
                file_ids: vec![],
            })
            .unwrap();
        let fetched = store.get_summary(&summary.summary_id).unwrap().unwrap();
        assert_eq!(fetched.content, summary.content);
    }
}
