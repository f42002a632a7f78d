use anyhow::Result;
use rusqlite::Connection;

/// Idempotent schema migration, applied lazily on first open.
pub(crate) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            conversation_id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL UNIQUE,
            title TEXT,
            bootstrapped_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            message_id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(conversation_id),
            seq INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(conversation_id, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conv ON messages(conversation_id, seq);
        CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);

        CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
            content,
            content='messages',
            content_rowid='message_id'
        );

        CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
            INSERT INTO messages_fts(rowid, content) VALUES (new.message_id, new.content);
        END;

        CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
            INSERT INTO messages_fts(messages_fts, rowid, content) VALUES ('delete', old.message_id, old.content);
        END;

        CREATE TABLE IF NOT EXISTS message_parts (
            part_id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id INTEGER NOT NULL REFERENCES messages(message_id),
            session_id TEXT NOT NULL,
            part_type TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            payload_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_message_parts_message ON message_parts(message_id, ordinal);

        CREATE TABLE IF NOT EXISTS summaries (
            summary_id TEXT PRIMARY KEY,
            conversation_id INTEGER NOT NULL REFERENCES conversations(conversation_id),
            kind TEXT NOT NULL,
            depth INTEGER NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            file_ids TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_summaries_conv ON summaries(conversation_id, depth);

        CREATE VIRTUAL TABLE IF NOT EXISTS summaries_fts USING fts5(
            content,
            content='summaries',
            content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS summaries_ai AFTER INSERT ON summaries BEGIN
            INSERT INTO summaries_fts(rowid, content) VALUES (new.rowid, new.content);
        END;

        CREATE TRIGGER IF NOT EXISTS summaries_ad AFTER DELETE ON summaries BEGIN
            INSERT INTO summaries_fts(summaries_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
        END;

        CREATE TABLE IF NOT EXISTS summary_messages (
            summary_id TEXT NOT NULL REFERENCES summaries(summary_id),
            message_id INTEGER NOT NULL REFERENCES messages(message_id),
            ordinal INTEGER NOT NULL,
            PRIMARY KEY (summary_id, message_id)
        );

        CREATE INDEX IF NOT EXISTS idx_summary_messages_message ON summary_messages(message_id);

        CREATE TABLE IF NOT EXISTS summary_parents (
            summary_id TEXT NOT NULL REFERENCES summaries(summary_id),
            parent_summary_id TEXT NOT NULL REFERENCES summaries(summary_id),
            ordinal INTEGER NOT NULL,
            PRIMARY KEY (summary_id, parent_summary_id)
        );

        CREATE INDEX IF NOT EXISTS idx_summary_parents_parent ON summary_parents(parent_summary_id);

        CREATE TABLE IF NOT EXISTS context_items (
            conversation_id INTEGER NOT NULL REFERENCES conversations(conversation_id),
            ordinal INTEGER NOT NULL,
            item_type TEXT NOT NULL,
            message_id INTEGER REFERENCES messages(message_id),
            summary_id TEXT REFERENCES summaries(summary_id),
            created_at INTEGER NOT NULL,
            PRIMARY KEY (conversation_id, ordinal)
        );

        CREATE TABLE IF NOT EXISTS large_files (
            file_id TEXT PRIMARY KEY,
            conversation_id INTEGER NOT NULL REFERENCES conversations(conversation_id),
            file_name TEXT,
            mime_type TEXT,
            byte_size INTEGER,
            storage_uri TEXT NOT NULL,
            exploration_summary TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_large_files_conv ON large_files(conversation_id);
        ",
    )?;

    Ok(())
}
