//! High-level, transaction-per-call API over [`crate::conversation_ops`].

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use lcm_core::{Conversation, Message, MessagePart, NewMessage, NewMessagePart, Role};
use lcm_core::{MessageSearchHit, SearchQuery};
use tracing::instrument;

use crate::Db;
use crate::conversation_ops;

#[derive(Clone)]
pub struct ConversationStore {
    db: Arc<Db>,
}

impl ConversationStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Shared handle, used by callers (e.g. the compaction engine) that
    /// need to compose a write against both this store and [`crate::SummaryStore`]
    /// inside a single transaction.
    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    #[instrument(skip(self))]
    pub fn get_or_create_conversation(&self, session_id: &str) -> Result<Conversation> {
        let now = Utc::now();
        let session_id = session_id.to_owned();
        self.db.with_transaction(move |conn| {
            let conversation_id =
                conversation_ops::get_or_create_conversation_tx(conn, &session_id, now)?;
            conn.query_row(
                "SELECT conversation_id, session_id, title, bootstrapped_at, created_at, updated_at
                 FROM conversations WHERE conversation_id = ?1",
                [conversation_id],
                |row| {
                    let bootstrapped_ms: Option<i64> = row.get(3)?;
                    let created_ms: i64 = row.get(4)?;
                    let updated_ms: i64 = row.get(5)?;
                    Ok(Conversation {
                        conversation_id: row.get(0)?,
                        session_id: row.get(1)?,
                        title: row.get(2)?,
                        bootstrapped_at: bootstrapped_ms.map(crate::helpers::dt_from_ms),
                        created_at: crate::helpers::dt_from_ms(created_ms),
                        updated_at: crate::helpers::dt_from_ms(updated_ms),
                    })
                },
            )
            .map_err(anyhow::Error::from)
        })
    }

    #[instrument(skip(self, content))]
    pub fn create_message(
        &self,
        conversation_id: i64,
        seq: i64,
        role: Role,
        content: impl Into<String>,
    ) -> Result<Message> {
        let content = content.into();
        let token_count = lcm_core::estimate_tokens(&content);
        let new = NewMessage {
            conversation_id,
            seq,
            role,
            content,
            token_count,
        };
        let now = Utc::now();
        self.db
            .with_transaction(move |conn| conversation_ops::create_message_tx(conn, &new, now))
    }

    pub fn create_messages_bulk(&self, news: Vec<NewMessage>) -> Result<Vec<Message>> {
        let now = Utc::now();
        self.db
            .with_transaction(move |conn| conversation_ops::create_messages_bulk_tx(conn, &news, now))
    }

    pub fn create_message_parts(
        &self,
        message_id: i64,
        session_id: &str,
        parts: Vec<NewMessagePart>,
    ) -> Result<Vec<MessagePart>> {
        let session_id = session_id.to_owned();
        self.db.with_transaction(move |conn| {
            conversation_ops::create_message_parts_tx(conn, message_id, &session_id, &parts)
        })
    }

    pub fn get_message_by_id(&self, message_id: i64) -> Result<Option<Message>> {
        self.db
            .with_read(|conn| conversation_ops::get_message_by_id_tx(conn, message_id))
    }

    pub fn get_messages(
        &self,
        conversation_id: i64,
        after_seq: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        self.db.with_read(|conn| {
            conversation_ops::get_messages_tx(conn, conversation_id, after_seq, limit)
        })
    }

    pub fn get_message_parts(&self, message_id: i64) -> Result<Vec<MessagePart>> {
        self.db
            .with_read(|conn| conversation_ops::get_message_parts_tx(conn, message_id))
    }

    pub fn get_max_seq(&self, conversation_id: i64) -> Result<i64> {
        self.db
            .with_read(|conn| conversation_ops::get_max_seq_tx(conn, conversation_id))
    }

    pub fn get_message_count(&self, conversation_id: i64) -> Result<i64> {
        self.db
            .with_read(|conn| conversation_ops::get_message_count_tx(conn, conversation_id))
    }

    pub fn get_last_message(&self, conversation_id: i64) -> Result<Option<Message>> {
        self.db
            .with_read(|conn| conversation_ops::get_last_message_tx(conn, conversation_id))
    }

    pub fn has_message(&self, conversation_id: i64, role: Role, content: &str) -> Result<bool> {
        self.db
            .with_read(|conn| conversation_ops::has_message_tx(conn, conversation_id, role, content))
    }

    pub fn count_messages_by_identity(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
    ) -> Result<i64> {
        self.db.with_read(|conn| {
            conversation_ops::count_messages_by_identity_tx(conn, conversation_id, role, content)
        })
    }

    #[instrument(skip(self, query), fields(limit = query.limit))]
    pub fn search_messages(&self, query: &SearchQuery) -> Result<Vec<MessageSearchHit>> {
        self.db
            .with_read(|conn| conversation_ops::search_messages_tx(conn, query))
    }

    pub fn mark_conversation_bootstrapped(&self, conversation_id: i64) -> Result<()> {
        let now = Utc::now();
        self.db.with_transaction(move |conn| {
            conversation_ops::mark_conversation_bootstrapped_tx(conn, conversation_id, now)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_message_then_read_back() {
        let store = ConversationStore::new(Arc::new(Db::open_in_memory().unwrap()));
        let conv = store.get_or_create_conversation("s1").unwrap();
        let msg = store
            .create_message(conv.conversation_id, 1, Role::User, "hello")
            .unwrap();
        let fetched = store.get_message_by_id(msg.message_id).unwrap().unwrap();
        assert_eq!(fetched.content, "hello");
    }
}
