//! Free functions over the summary/context-item tables, composable inside a single
//! [`crate::Db::with_transaction`] the same way as `conversation_ops`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lcm_core::{
    ContextItem, ContextItemType, LargeFile, LcmError, NewLargeFile, NewSummary, SearchMode,
    SearchQuery, Summary, SummaryKind, SummarySearchHit,
};
use rusqlite::{Connection, OptionalExtension, params};

use crate::helpers::{dt_from_ms, fts_query, ms_from_dt, snippet_around, snippet_for_regex_match};

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Summary> {
    let kind_str: String = row.get(2)?;
    let created_ms: i64 = row.get(6)?;
    let file_ids_raw: String = row.get(7)?;
    Ok(Summary {
        summary_id: row.get(0)?,
        conversation_id: row.get(1)?,
        kind: SummaryKind::from_str(&kind_str).unwrap_or(SummaryKind::Leaf),
        depth: row.get::<_, i64>(3)? as u32,
        content: row.get(4)?,
        token_count: row.get::<_, i64>(5)? as u32,
        file_ids: crate::helpers::from_json(&file_ids_raw),
        created_at: dt_from_ms(created_ms),
    })
}

const SUMMARY_COLUMNS: &str =
    "summary_id, conversation_id, kind, depth, content, token_count, created_at, file_ids";

pub(crate) fn insert_summary_tx(
    conn: &Connection,
    new: &NewSummary,
    now: DateTime<Utc>,
) -> Result<Summary> {
    if new.kind == SummaryKind::Leaf && new.depth != 0 {
        anyhow::bail!(anyhow::Error::from(LcmError::InvariantViolation {
            detail: format!("leaf summary {} must have depth 0", new.summary_id),
        }));
    }

    let now_ms = ms_from_dt(now);
    let file_ids_json = crate::helpers::to_json(&new.file_ids);
    conn.execute(
        "INSERT INTO summaries (summary_id, conversation_id, kind, depth, content, token_count, file_ids, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            new.summary_id,
            new.conversation_id,
            new.kind.as_str(),
            new.depth,
            new.content,
            new.token_count,
            file_ids_json,
            now_ms
        ],
    )
    .context("failed to insert summary")?;

    Ok(Summary {
        summary_id: new.summary_id.clone(),
        conversation_id: new.conversation_id,
        kind: new.kind,
        depth: new.depth,
        content: new.content.clone(),
        token_count: new.token_count,
        file_ids: new.file_ids.clone(),
        created_at: now,
    })
}

pub(crate) fn link_summary_to_messages_tx(
    conn: &Connection,
    summary_id: &str,
    message_ids: &[i64],
) -> Result<()> {
    for (ordinal, message_id) in message_ids.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO summary_messages (summary_id, message_id, ordinal) VALUES (?1, ?2, ?3)",
            params![summary_id, message_id, ordinal as i64],
        )?;
    }
    Ok(())
}

pub(crate) fn link_summary_to_parents_tx(
    conn: &Connection,
    summary_id: &str,
    parent_ids: &[String],
) -> Result<()> {
    let child = get_summary_tx(conn, summary_id)?
        .with_context(|| format!("summary {summary_id} does not exist"))?;

    let mut max_parent_depth = 0u32;
    for parent_id in parent_ids {
        let parent = get_summary_tx(conn, parent_id)?
            .with_context(|| format!("parent summary {parent_id} does not exist"))?;
        max_parent_depth = max_parent_depth.max(parent.depth);
        if parent_id == summary_id {
            anyhow::bail!(anyhow::Error::from(LcmError::InvariantViolation {
                detail: format!("summary {summary_id} cannot be its own parent"),
            }));
        }
    }

    if !parent_ids.is_empty() && child.depth <= max_parent_depth {
        anyhow::bail!(anyhow::Error::from(LcmError::InvariantViolation {
            detail: format!(
                "summary {summary_id} depth {} must exceed max parent depth {max_parent_depth}",
                child.depth
            ),
        }));
    }

    for (ordinal, parent_id) in parent_ids.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO summary_parents (summary_id, parent_summary_id, ordinal) VALUES (?1, ?2, ?3)",
            params![summary_id, parent_id, ordinal as i64],
        )?;
    }
    Ok(())
}

pub(crate) fn get_summary_tx(conn: &Connection, summary_id: &str) -> Result<Option<Summary>> {
    conn.query_row(
        &format!("SELECT {SUMMARY_COLUMNS} FROM summaries WHERE summary_id = ?1"),
        params![summary_id],
        summary_from_row,
    )
    .optional()
    .context("failed to read summary")
}

pub(crate) fn get_summaries_by_conversation_tx(
    conn: &Connection,
    conversation_id: i64,
) -> Result<Vec<Summary>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUMMARY_COLUMNS} FROM summaries WHERE conversation_id = ?1 ORDER BY depth ASC, created_at ASC"
    ))?;
    Ok(stmt
        .query_map(params![conversation_id], summary_from_row)?
        .collect::<rusqlite::Result<_>>()?)
}

pub(crate) fn get_summary_messages_tx(conn: &Connection, summary_id: &str) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT message_id FROM summary_messages WHERE summary_id = ?1 ORDER BY ordinal ASC",
    )?;
    Ok(stmt
        .query_map(params![summary_id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?)
}

pub(crate) fn get_summary_parents_tx(conn: &Connection, summary_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT parent_summary_id FROM summary_parents WHERE summary_id = ?1 ORDER BY ordinal ASC",
    )?;
    Ok(stmt
        .query_map(params![summary_id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?)
}

pub(crate) fn get_summary_children_tx(conn: &Connection, summary_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT summary_id FROM summary_parents WHERE parent_summary_id = ?1 ORDER BY ordinal ASC",
    )?;
    Ok(stmt
        .query_map(params![summary_id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?)
}

fn context_item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextItem> {
    let item_type: String = row.get(2)?;
    let created_ms: i64 = row.get(5)?;
    Ok(ContextItem {
        conversation_id: row.get(0)?,
        ordinal: row.get(1)?,
        item_type: if item_type == "message" {
            ContextItemType::Message
        } else {
            ContextItemType::Summary
        },
        message_id: row.get(3)?,
        summary_id: row.get(4)?,
        created_at: dt_from_ms(created_ms),
    })
}

const CONTEXT_ITEM_COLUMNS: &str =
    "conversation_id, ordinal, item_type, message_id, summary_id, created_at";

pub(crate) fn get_context_items_tx(
    conn: &Connection,
    conversation_id: i64,
) -> Result<Vec<ContextItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONTEXT_ITEM_COLUMNS} FROM context_items WHERE conversation_id = ?1 ORDER BY ordinal ASC"
    ))?;
    Ok(stmt
        .query_map(params![conversation_id], context_item_from_row)?
        .collect::<rusqlite::Result<_>>()?)
}

fn next_ordinal(conn: &Connection, conversation_id: i64) -> Result<i64> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(ordinal) FROM context_items WHERE conversation_id = ?1",
        params![conversation_id],
        |row| row.get(0),
    )?;
    Ok(max.map_or(0, |m| m + 1))
}

pub(crate) fn append_context_message_tx(
    conn: &Connection,
    conversation_id: i64,
    message_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let ordinal = next_ordinal(conn, conversation_id)?;
    conn.execute(
        "INSERT INTO context_items (conversation_id, ordinal, item_type, message_id, summary_id, created_at)
         VALUES (?1, ?2, 'message', ?3, NULL, ?4)",
        params![conversation_id, ordinal, message_id, ms_from_dt(now)],
    )?;
    Ok(())
}

pub(crate) fn append_context_messages_tx(
    conn: &Connection,
    conversation_id: i64,
    message_ids: &[i64],
    now: DateTime<Utc>,
) -> Result<()> {
    for message_id in message_ids {
        append_context_message_tx(conn, conversation_id, *message_id, now)?;
    }
    Ok(())
}

pub(crate) fn append_context_summary_tx(
    conn: &Connection,
    conversation_id: i64,
    summary_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let ordinal = next_ordinal(conn, conversation_id)?;
    conn.execute(
        "INSERT INTO context_items (conversation_id, ordinal, item_type, message_id, summary_id, created_at)
         VALUES (?1, ?2, 'summary', NULL, ?3, ?4)",
        params![conversation_id, ordinal, summary_id, ms_from_dt(now)],
    )?;
    Ok(())
}

/// Atomic delete-insert-renumber: replaces the contiguous range
/// `[start_ordinal, end_ordinal)` with a single summary item, via a
/// two-phase renumber through negative temporary ordinals so the unique
/// `(conversation_id, ordinal)` index never rejects an intermediate write.
/// No non-dense state is visible between the two phases because both run
/// inside the caller's single transaction.
pub(crate) fn replace_context_range_with_summary_tx(
    conn: &Connection,
    conversation_id: i64,
    start_ordinal: i64,
    end_ordinal: i64,
    summary_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let items = get_context_items_tx(conn, conversation_id)?;
    anyhow::ensure!(
        start_ordinal >= 0
            && end_ordinal <= items.len() as i64
            && start_ordinal < end_ordinal,
        anyhow::Error::from(LcmError::InvariantViolation {
            detail: format!(
                "invalid replace range [{start_ordinal}, {end_ordinal}) over {} items",
                items.len()
            ),
        })
    );

    conn.execute(
        "UPDATE context_items SET ordinal = -(ordinal + 1) WHERE conversation_id = ?1",
        params![conversation_id],
    )?;

    for item in &items[start_ordinal as usize..end_ordinal as usize] {
        conn.execute(
            "DELETE FROM context_items WHERE conversation_id = ?1 AND ordinal = ?2",
            params![conversation_id, -(item.ordinal + 1)],
        )?;
    }

    let mut new_ordinal = 0i64;
    for item in &items[..start_ordinal as usize] {
        conn.execute(
            "UPDATE context_items SET ordinal = ?3 WHERE conversation_id = ?1 AND ordinal = ?2",
            params![conversation_id, -(item.ordinal + 1), new_ordinal],
        )?;
        new_ordinal += 1;
    }

    conn.execute(
        "INSERT INTO context_items (conversation_id, ordinal, item_type, message_id, summary_id, created_at)
         VALUES (?1, ?2, 'summary', NULL, ?3, ?4)",
        params![conversation_id, new_ordinal, summary_id, ms_from_dt(now)],
    )?;
    new_ordinal += 1;

    for item in &items[end_ordinal as usize..] {
        conn.execute(
            "UPDATE context_items SET ordinal = ?3 WHERE conversation_id = ?1 AND ordinal = ?2",
            params![conversation_id, -(item.ordinal + 1), new_ordinal],
        )?;
        new_ordinal += 1;
    }

    Ok(())
}

pub(crate) fn get_context_token_count_tx(conn: &Connection, conversation_id: i64) -> Result<i64> {
    let total: i64 = conn.query_row(
        "SELECT
            COALESCE((SELECT SUM(m.token_count) FROM context_items ci
                      JOIN messages m ON m.message_id = ci.message_id
                      WHERE ci.conversation_id = ?1 AND ci.item_type = 'message'), 0)
            +
            COALESCE((SELECT SUM(s.token_count) FROM context_items ci
                      JOIN summaries s ON s.summary_id = ci.summary_id
                      WHERE ci.conversation_id = ?1 AND ci.item_type = 'summary'), 0)",
        params![conversation_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

pub(crate) fn get_distinct_depths_in_context_tx(
    conn: &Connection,
    conversation_id: i64,
    max_ordinal_exclusive: Option<i64>,
) -> Result<Vec<u32>> {
    let max_ordinal = max_ordinal_exclusive.unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(
        "SELECT DISTINCT s.depth FROM context_items ci
         JOIN summaries s ON s.summary_id = ci.summary_id
         WHERE ci.conversation_id = ?1 AND ci.item_type = 'summary' AND ci.ordinal < ?2
         ORDER BY s.depth ASC",
    )?;
    let depths = stmt
        .query_map(params![conversation_id, max_ordinal], |row| {
            Ok(row.get::<_, i64>(0)? as u32)
        })?
        .collect::<rusqlite::Result<_>>()?;
    Ok(depths)
}

pub(crate) fn search_summaries_tx(
    conn: &Connection,
    query: &SearchQuery,
) -> Result<Vec<SummarySearchHit>> {
    match query.mode_or_default() {
        SearchMode::FullText => search_summaries_full_text(conn, query),
        SearchMode::Regex => search_summaries_regex(conn, query),
    }
}

fn search_summaries_full_text(conn: &Connection, query: &SearchQuery) -> Result<Vec<SummarySearchHit>> {
    let match_expr = fts_query(&query.query);
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT s.summary_id, s.conversation_id, s.kind, s.content, s.created_at, bm25(summaries_fts) AS rank
         FROM summaries_fts
         JOIN summaries s ON s.rowid = summaries_fts.rowid
         WHERE summaries_fts MATCH ?1",
    );
    if query.conversation_id.is_some() {
        sql.push_str(" AND s.conversation_id = ?2");
    }
    if let Some(since) = query.since {
        sql.push_str(&format!(" AND s.created_at >= {}", ms_from_dt(since)));
    }
    if let Some(before) = query.before {
        sql.push_str(&format!(" AND s.created_at < {}", ms_from_dt(before)));
    }
    sql.push_str(" ORDER BY rank ASC, s.created_at DESC LIMIT ?3");

    let limit = if query.limit == 0 { i64::MAX } else { query.limit as i64 };
    let mut stmt = conn.prepare(&sql)?;

    let rows: Vec<(String, i64, String, String, i64, f64)> = if let Some(conv_id) = query.conversation_id
    {
        stmt.query_map(params![match_expr, conv_id, limit], summary_row_tuple)?
            .collect::<rusqlite::Result<_>>()?
    } else {
        stmt.query_map(params![match_expr, limit], summary_row_tuple)?
            .collect::<rusqlite::Result<_>>()?
    };

    Ok(rows
        .into_iter()
        .map(|(summary_id, conversation_id, kind, content, created_ms, rank)| SummarySearchHit {
            summary_id,
            conversation_id,
            kind: SummaryKind::from_str(&kind).unwrap_or(SummaryKind::Leaf),
            snippet: snippet_around(&content, &query.query),
            created_at: dt_from_ms(created_ms),
            rank: -rank,
        })
        .collect())
}

fn summary_row_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, String, String, i64, f64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn search_summaries_regex(conn: &Connection, query: &SearchQuery) -> Result<Vec<SummarySearchHit>> {
    let re = regex::Regex::new(&query.query).context("invalid regex")?;

    let mut sql = String::from(
        "SELECT summary_id, conversation_id, kind, content, created_at FROM summaries WHERE 1=1",
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
    sql.push_str(" ORDER BY created_at ASC");

    let mut stmt = conn.prepare(&sql)?;
    let limit = if query.limit == 0 { usize::MAX } else { query.limit };

    let rows: Vec<(String, i64, String, String, i64)> = if let Some(conv_id) = query.conversation_id {
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
    for (summary_id, conversation_id, kind, content, created_ms) in rows {
        if hits.len() >= limit {
            break;
        }
        if let Some(m) = re.find(&content) {
            hits.push(SummarySearchHit {
                summary_id,
                conversation_id,
                kind: SummaryKind::from_str(&kind).unwrap_or(SummaryKind::Leaf),
                snippet: snippet_for_regex_match(&content, m.start(), m.end()),
                created_at: dt_from_ms(created_ms),
                rank: 0.0,
            });
        }
    }
    Ok(hits)
}

fn large_file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LargeFile> {
    let created_ms: i64 = row.get(7)?;
    Ok(LargeFile {
        file_id: row.get(0)?,
        conversation_id: row.get(1)?,
        file_name: row.get(2)?,
        mime_type: row.get(3)?,
        byte_size: row.get(4)?,
        storage_uri: row.get(5)?,
        exploration_summary: row.get(6)?,
        created_at: dt_from_ms(created_ms),
    })
}

const LARGE_FILE_COLUMNS: &str = "file_id, conversation_id, file_name, mime_type, byte_size, storage_uri, exploration_summary, created_at";

pub(crate) fn insert_large_file_tx(
    conn: &Connection,
    new: &NewLargeFile,
    now: DateTime<Utc>,
) -> Result<LargeFile> {
    let now_ms = ms_from_dt(now);
    conn.execute(
        "INSERT INTO large_files (file_id, conversation_id, file_name, mime_type, byte_size, storage_uri, exploration_summary, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            new.file_id,
            new.conversation_id,
            new.file_name,
            new.mime_type,
            new.byte_size,
            new.storage_uri,
            new.exploration_summary,
            now_ms
        ],
    )
    .context("failed to insert large file")?;

    Ok(LargeFile {
        file_id: new.file_id.clone(),
        conversation_id: new.conversation_id,
        file_name: new.file_name.clone(),
        mime_type: new.mime_type.clone(),
        byte_size: new.byte_size,
        storage_uri: new.storage_uri.clone(),
        exploration_summary: new.exploration_summary.clone(),
        created_at: now,
    })
}

pub(crate) fn get_large_file_tx(conn: &Connection, file_id: &str) -> Result<Option<LargeFile>> {
    conn.query_row(
        &format!("SELECT {LARGE_FILE_COLUMNS} FROM large_files WHERE file_id = ?1"),
        params![file_id],
        large_file_from_row,
    )
    .optional()
    .context("failed to read large file")
}

pub(crate) fn get_large_files_by_conversation_tx(
    conn: &Connection,
    conversation_id: i64,
) -> Result<Vec<LargeFile>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LARGE_FILE_COLUMNS} FROM large_files WHERE conversation_id = ?1 ORDER BY created_at ASC"
    ))?;
    Ok(stmt
        .query_map(params![conversation_id], large_file_from_row)?
        .collect::<rusqlite::Result<_>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Db;
    use crate::conversation_ops::{create_message_tx, get_or_create_conversation_tx};
    use lcm_core::{NewMessage, Role};

    fn new_summary(conv: i64, id: &str, kind: SummaryKind, depth: u32) -> NewSummary {
        NewSummary {
            summary_id: id.to_owned(),
            conversation_id: conv,
            kind,
            depth,
            content: "a summary".to_owned(),
            token_count: 10,
            file_ids: vec![],
        }
    }

    #[test]
    fn leaf_summary_must_have_depth_zero() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();
        let err = db
            .with_transaction(|conn| {
                let conv = get_or_create_conversation_tx(conn, "s1", now)?;
                insert_summary_tx(conn, &new_summary(conv, "sum_a", SummaryKind::Leaf, 1), now)
            })
            .unwrap_err();
        assert!(err.downcast_ref::<LcmError>().is_some());
    }

    #[test]
    fn parent_depth_invariant_is_enforced() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_transaction(|conn| {
            let conv = get_or_create_conversation_tx(conn, "s1", now)?;
            insert_summary_tx(conn, &new_summary(conv, "sum_parent", SummaryKind::Leaf, 0), now)?;
            insert_summary_tx(
                conn,
                &new_summary(conv, "sum_child", SummaryKind::Condensed, 0),
                now,
            )?;
            Ok(())
        })
        .unwrap();

        let err = db
            .with_transaction(|conn| {
                link_summary_to_parents_tx(conn, "sum_child", &["sum_parent".to_owned()])
            })
            .unwrap_err();
        assert!(err.downcast_ref::<LcmError>().is_some());
    }

    #[test]
    fn replace_context_range_keeps_ordinals_dense() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_transaction(|conn| {
            let conv = get_or_create_conversation_tx(conn, "s1", now)?;
            for seq in 1..=5 {
                let msg = create_message_tx(
                    conn,
                    &NewMessage {
                        conversation_id: conv,
                        seq,
                        role: Role::User,
                        content: format!("turn {seq}"),
                        token_count: 3,
                    },
                    now,
                )?;
                append_context_message_tx(conn, conv, msg.message_id, now)?;
            }
            insert_summary_tx(conn, &new_summary(conv, "sum_1", SummaryKind::Leaf, 0), now)?;
            replace_context_range_with_summary_tx(conn, conv, 1, 4, "sum_1", now)?;
            Ok(conv)
        })
        .unwrap();

        let items = db
            .with_read(|conn| get_context_items_tx(conn, 1))
            .unwrap();
        assert_eq!(items.len(), 3);
        let ordinals: Vec<i64> = items.iter().map(|i| i.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
        assert!(items[1].is_summary());
        assert_eq!(items[1].summary_id.as_deref(), Some("sum_1"));
    }
}
