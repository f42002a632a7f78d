//! Free functions over the conversation/message tables, each taking `&Connection` so
//! callers can compose several of them inside one [`crate::Db::with_transaction`]
//! closure rather than nesting transactions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lcm_core::{LcmError, Message, MessagePart, NewMessage, NewMessagePart, Role};
use lcm_core::{MessageSearchHit, SearchMode, SearchQuery};
use rusqlite::{Connection, OptionalExtension, params};

use crate::helpers::{dt_from_ms, fts_query, ms_from_dt, snippet_around, snippet_for_regex_match};

pub(crate) fn get_or_create_conversation_tx(
    conn: &Connection,
    session_id: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT conversation_id FROM conversations WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        return Ok(id);
    }

    let now_ms = ms_from_dt(now);
    conn.execute(
        "INSERT INTO conversations (session_id, created_at, updated_at) VALUES (?1, ?2, ?2)",
        params![session_id, now_ms],
    )
    .context("failed to insert conversation")?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn create_message_tx(
    conn: &Connection,
    new: &NewMessage,
    now: DateTime<Utc>,
) -> Result<Message> {
    let now_ms = ms_from_dt(now);
    let result = conn.execute(
        "INSERT INTO messages (conversation_id, seq, role, content, token_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            new.conversation_id,
            new.seq,
            new.role.as_str(),
            new.content,
            new.token_count,
            now_ms
        ],
    );

    match result {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(anyhow::Error::from(LcmError::DuplicateSeq {
                conversation_id: new.conversation_id.to_string(),
                seq: new.seq,
            }));
        }
        Err(e) => return Err(e).context("failed to insert message"),
    }

    Ok(Message {
        message_id: conn.last_insert_rowid(),
        conversation_id: new.conversation_id,
        seq: new.seq,
        role: new.role,
        content: new.content.clone(),
        token_count: new.token_count,
        created_at: now,
    })
}

pub(crate) fn create_messages_bulk_tx(
    conn: &Connection,
    news: &[NewMessage],
    now: DateTime<Utc>,
) -> Result<Vec<Message>> {
    news.iter()
        .map(|new| create_message_tx(conn, new, now))
        .collect()
}

pub(crate) fn create_message_parts_tx(
    conn: &Connection,
    message_id: i64,
    session_id: &str,
    parts: &[NewMessagePart],
) -> Result<Vec<MessagePart>> {
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        let payload = serde_json::to_string(&part.body).context("failed to encode part body")?;
        conn.execute(
            "INSERT INTO message_parts (message_id, session_id, part_type, ordinal, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message_id,
                session_id,
                part.body.part_type().as_str(),
                part.ordinal,
                payload
            ],
        )
        .context("failed to insert message part")?;
        out.push(MessagePart {
            part_id: conn.last_insert_rowid(),
            message_id,
            session_id: session_id.to_owned(),
            ordinal: part.ordinal,
            body: part.body.clone(),
        });
    }
    Ok(out)
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(3)?;
    let created_ms: i64 = row.get(5)?;
    Ok(Message {
        message_id: row.get(0)?,
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        role: Role::from_str(&role_str).unwrap_or(Role::User),
        content: row.get(4)?,
        token_count: row.get::<_, i64>(6)? as u32,
        created_at: dt_from_ms(created_ms),
    })
}

const MESSAGE_COLUMNS: &str =
    "message_id, conversation_id, seq, role, content, created_at, token_count";

pub(crate) fn get_message_by_id_tx(conn: &Connection, message_id: i64) -> Result<Option<Message>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?1"),
        params![message_id],
        message_from_row,
    )
    .optional()
    .context("failed to read message")
}

pub(crate) fn get_messages_tx(
    conn: &Connection,
    conversation_id: i64,
    after_seq: Option<i64>,
    limit: Option<usize>,
) -> Result<Vec<Message>> {
    let after_seq = after_seq.unwrap_or(-1);
    let limit = limit.map_or(i64::MAX, |l| l as i64);
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE conversation_id = ?1 AND seq > ?2
         ORDER BY seq ASC
         LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(params![conversation_id, after_seq, limit], message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn get_message_parts_tx(conn: &Connection, message_id: i64) -> Result<Vec<MessagePart>> {
    let mut stmt = conn.prepare(
        "SELECT part_id, message_id, session_id, ordinal, payload_json
         FROM message_parts WHERE message_id = ?1 ORDER BY ordinal ASC",
    )?;
    let rows = stmt
        .query_map(params![message_id], |row| {
            let payload: String = row.get(4)?;
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i32>(3)?,
                payload,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(part_id, message_id, session_id, ordinal, payload)| {
            let body = serde_json::from_str(&payload).context("failed to decode part body")?;
            Ok(MessagePart {
                part_id,
                message_id,
                session_id,
                ordinal,
                body,
            })
        })
        .collect()
}

pub(crate) fn get_max_seq_tx(conn: &Connection, conversation_id: i64) -> Result<i64> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(seq) FROM messages WHERE conversation_id = ?1",
        params![conversation_id],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0))
}

pub(crate) fn get_message_count_tx(conn: &Connection, conversation_id: i64) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
        params![conversation_id],
        |row| row.get(0),
    )?)
}

pub(crate) fn get_last_message_tx(
    conn: &Connection,
    conversation_id: i64,
) -> Result<Option<Message>> {
    conn.query_row(
        &format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT 1"
        ),
        params![conversation_id],
        message_from_row,
    )
    .optional()
    .context("failed to read last message")
}

pub(crate) fn has_message_tx(
    conn: &Connection,
    conversation_id: i64,
    role: Role,
    content: &str,
) -> Result<bool> {
    Ok(count_messages_by_identity_tx(conn, conversation_id, role, content)? > 0)
}

pub(crate) fn count_messages_by_identity_tx(
    conn: &Connection,
    conversation_id: i64,
    role: Role,
    content: &str,
) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND role = ?2 AND content = ?3",
        params![conversation_id, role.as_str(), content],
        |row| row.get(0),
    )?)
}

pub(crate) fn search_messages_tx(
    conn: &Connection,
    query: &SearchQuery,
) -> Result<Vec<MessageSearchHit>> {
    match query.mode_or_default() {
        SearchMode::FullText => search_messages_full_text(conn, query),
        SearchMode::Regex => search_messages_regex(conn, query),
    }
}

fn search_messages_full_text(conn: &Connection, query: &SearchQuery) -> Result<Vec<MessageSearchHit>> {
    let match_expr = fts_query(&query.query);
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT m.message_id, m.conversation_id, m.role, m.content, m.created_at, bm25(messages_fts) AS rank
         FROM messages_fts
         JOIN messages m ON m.message_id = messages_fts.rowid
         WHERE messages_fts MATCH ?1",
    );
    let mut conv_filter = String::new();
    if query.conversation_id.is_some() {
        conv_filter.push_str(" AND m.conversation_id = ?2");
    }
    sql.push_str(&conv_filter);
    if let Some(since) = query.since {
        sql.push_str(&format!(" AND m.created_at >= {}", ms_from_dt(since)));
    }
    if let Some(before) = query.before {
        sql.push_str(&format!(" AND m.created_at < {}", ms_from_dt(before)));
    }
    sql.push_str(" ORDER BY rank ASC, m.created_at DESC LIMIT ?3");

    let limit = if query.limit == 0 { i64::MAX } else { query.limit as i64 };
    let mut stmt = conn.prepare(&sql)?;

    let rows: Vec<(i64, i64, String, String, i64, f64)> = if let Some(conv_id) = query.conversation_id
    {
        stmt.query_map(params![match_expr, conv_id, limit], row_tuple)?
            .collect::<rusqlite::Result<_>>()?
    } else {
        stmt.query_map(params![match_expr, limit], row_tuple)?
            .collect::<rusqlite::Result<_>>()?
    };

    Ok(rows
        .into_iter()
        .map(|(message_id, conversation_id, role, content, created_ms, rank)| MessageSearchHit {
            message_id,
            conversation_id,
            role: Role::from_str(&role).unwrap_or(Role::User),
            snippet: snippet_around(&content, &query.query),
            created_at: dt_from_ms(created_ms),
            rank: -rank,
        })
        .collect())
}

fn row_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, i64, String, String, i64, f64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn search_messages_regex(conn: &Connection, query: &SearchQuery) -> Result<Vec<MessageSearchHit>> {
    let re = regex::Regex::new(&query.query).context("invalid regex")?;

    let mut sql = String::from(
        "SELECT message_id, conversation_id, role, content, created_at
         FROM messages WHERE 1=1",
    );
    if query.conversation_id.is_some() {
        sql.push_str(" AND conversation_id = ?1");
    }
    if let Some(since) = query.since {
        sql.push_str(&format!(" AND created_at >= {}", ms_from_dt(since)));
    }
    if let Some(before) = query.before {
        sql.push_str(&format!(" AND created_at < {}", ms_from_dt(before)));
    }
    sql.push_str(" ORDER BY seq ASC");

    let mut stmt = conn.prepare(&sql)?;
    let limit = if query.limit == 0 { usize::MAX } else { query.limit };

    let rows: Vec<(i64, i64, String, String, i64)> = if let Some(conv_id) = query.conversation_id {
        stmt.query_map(params![conv_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?
        .collect::<rusqlite::Result<_>>()?
    } else {
        stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?
        .collect::<rusqlite::Result<_>>()?
    };

    let mut hits = Vec::new();
    for (message_id, conversation_id, role, content, created_ms) in rows {
        if hits.len() >= limit {
            break;
        }
        if let Some(m) = re.find(&content) {
            hits.push(MessageSearchHit {
                message_id,
                conversation_id,
                role: Role::from_str(&role).unwrap_or(Role::User),
                snippet: snippet_for_regex_match(&content, m.start(), m.end()),
                created_at: dt_from_ms(created_ms),
                rank: 0.0,
            });
        }
    }
    Ok(hits)
}

pub(crate) fn mark_conversation_bootstrapped_tx(
    conn: &Connection,
    conversation_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET bootstrapped_at = ?2, updated_at = ?2 WHERE conversation_id = ?1",
        params![conversation_id, ms_from_dt(now)],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Db;

    fn new_msg(conv: i64, seq: i64, content: &str) -> NewMessage {
        NewMessage {
            conversation_id: conv,
            seq,
            role: Role::User,
            content: content.to_owned(),
            token_count: lcm_core::estimate_tokens(content),
        }
    }

    #[test]
    fn duplicate_seq_surfaces_as_lcm_error() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_transaction(|conn| {
            let conv = get_or_create_conversation_tx(conn, "s1", now)?;
            create_message_tx(conn, &new_msg(conv, 1, "hi"), now)?;
            Ok(conv)
        })
        .unwrap();

        let err = db
            .with_transaction(|conn| create_message_tx(conn, &new_msg(1, 1, "again"), now))
            .unwrap_err();
        let lcm_err = err.downcast_ref::<LcmError>().unwrap();
        assert!(matches!(lcm_err, LcmError::DuplicateSeq { .. }));
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();
        let (a, b) = db
            .with_transaction(|conn| {
                let a = get_or_create_conversation_tx(conn, "s1", now)?;
                let b = get_or_create_conversation_tx(conn, "s1", now)?;
                Ok((a, b))
            })
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn full_text_search_ranks_and_filters_by_conversation() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_transaction(|conn| {
            let conv = get_or_create_conversation_tx(conn, "s1", now)?;
            create_message_tx(conn, &new_msg(conv, 1, "the quick brown fox"), now)?;
            create_message_tx(conn, &new_msg(conv, 2, "a slow turtle"), now)?;
            Ok(())
        })
        .unwrap();

        let hits = db
            .with_read(|conn| {
                search_messages_tx(
                    conn,
                    &SearchQuery {
                        query: "fox".into(),
                        mode: Some(SearchMode::FullText),
                        conversation_id: None,
                        since: None,
                        before: None,
                        limit: 10,
                    },
                )
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].snippet.contains("fox"));
    }

    #[test]
    fn regex_search_preserves_insertion_order_within_limit() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_transaction(|conn| {
            let conv = get_or_create_conversation_tx(conn, "s1", now)?;
            create_message_tx(conn, &new_msg(conv, 1, "file_0123456789abcdef ref"), now)?;
            create_message_tx(conn, &new_msg(conv, 2, "file_fedcba9876543210 ref"), now)?;
            Ok(())
        })
        .unwrap();

        let hits = db
            .with_read(|conn| {
                search_messages_tx(
                    conn,
                    &SearchQuery {
                        query: r"file_[0-9a-f]{16}".into(),
                        mode: Some(SearchMode::Regex),
                        conversation_id: None,
                        since: None,
                        before: None,
                        limit: 1,
                    },
                )
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, 1);
    }
}
