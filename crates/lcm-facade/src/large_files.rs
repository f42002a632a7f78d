//! Large-file interception on the ingest path: body content above
//! a token threshold is pulled out to disk and replaced by a reference
//! marker so stored message content never carries multi-thousand-token
//! file bodies.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use lcm_core::{estimate_tokens, ids, NewLargeFile};
use lcm_store::SummaryStore;
use regex::Regex;

fn file_block_pattern() -> Regex {
    Regex::new(r#"(?s)<file name="([^"]*)" mime="([^"]*)">(.*?)</file>"#)
        .expect("static file block pattern is valid")
}

fn sanitized_extension(name: &str, mime: &str) -> String {
    if let Some(ext) = name.rsplit('.').next() {
        let lower = ext.to_ascii_lowercase();
        if !lower.is_empty() && lower.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return lower;
        }
    }
    match mime {
        "application/json" => "json".to_owned(),
        "text/markdown" => "md".to_owned(),
        "text/csv" => "csv".to_owned(),
        "text/html" => "html".to_owned(),
        _ => "txt".to_owned(),
    }
}

/// Scans `content` for `<file name="..." mime="...">...</file>` blocks,
/// writes any block whose body is at least `large_file_token_threshold`
/// tokens to `storage_root/<conversation_id>/<file_id>.<ext>`, inserts a
/// [`lcm_core::LargeFile`] row, and returns the content with that block
/// replaced by a reference marker. Blocks below the threshold are left
/// inline, verbatim.
pub async fn intercept_large_files(
    summaries: &SummaryStore,
    storage_root: &Path,
    conversation_id: i64,
    large_file_token_threshold: u32,
    content: &str,
) -> Result<String> {
    let pattern = file_block_pattern();
    let matches: Vec<_> = pattern.captures_iter(content).collect();
    if matches.is_empty() {
        return Ok(content.to_owned());
    }

    let mut out = String::with_capacity(content.len());
    let mut last_end = 0usize;

    for captures in matches {
        let whole = captures.get(0).expect("capture group 0 always matches");
        let name = captures.get(1).map_or("", |m| m.as_str());
        let mime = captures.get(2).map_or("", |m| m.as_str());
        let body = captures.get(3).map_or("", |m| m.as_str());

        out.push_str(&content[last_end..whole.start()]);

        if estimate_tokens(body) < large_file_token_threshold {
            out.push_str(whole.as_str());
        } else {
            let now = Utc::now();
            let file_id = ids::new_file_id(name, mime, now);
            let ext = sanitized_extension(name, mime);
            let dir = storage_root.join(conversation_id.to_string());
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating large-file storage dir {}", dir.display()))?;
            let path = dir.join(format!("{file_id}.{ext}"));
            tokio::fs::write(&path, body)
                .await
                .with_context(|| format!("writing large file to {}", path.display()))?;

            let byte_size = body.len() as i64;
            summaries.insert_large_file(NewLargeFile {
                file_id: file_id.clone(),
                conversation_id,
                file_name: non_empty(name),
                mime_type: non_empty(mime),
                byte_size: Some(byte_size),
                storage_uri: path.display().to_string(),
                exploration_summary: None,
            })?;

            out.push_str(&format!("[LCM File: {file_id} | {name} | {mime} | {byte_size} bytes]\n"));
        }

        last_end = whole.end();
    }
    out.push_str(&content[last_end..]);
    Ok(out)
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_owned())
}

pub fn default_storage_root() -> PathBuf {
    dirs_home().join(".openclaw").join("lcm-files")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcm_store::{ConversationStore, Db};
    use std::sync::Arc;

    #[tokio::test]
    async fn intercepts_large_block_and_leaves_small_block_inline() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open_in_memory().unwrap());
        let conversations = ConversationStore::new(db.clone());
        let summaries = SummaryStore::new(db);
        let conv = conversations.get_or_create_conversation("s1").unwrap();

        let big_body = "x".repeat(4000);
        let content = format!(
            r#"before <file name="small.txt" mime="text/plain">tiny</file> middle <file name="big.txt" mime="text/plain">{big_body}</file> after"#
        );

        let rewritten = intercept_large_files(&summaries, dir.path(), conv.conversation_id, 100, &content)
            .await
            .unwrap();

        assert!(rewritten.contains("tiny"), "small block stays inline");
        assert!(rewritten.contains("[LCM File:"), "large block becomes a marker");
        assert!(!rewritten.contains(&big_body), "large body is pulled out of stored content");

        let files = summaries.get_large_files_by_conversation(conv.conversation_id).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name.as_deref(), Some("big.txt"));
    }
}
