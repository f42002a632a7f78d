use chrono::{DateTime, TimeZone, Utc};

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn ms_from_dt(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn dt_from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

pub(crate) fn to_json(ids: &[String]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_owned())
}

pub(crate) fn from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Build an FTS5 `MATCH` query from space-separated terms, OR-joined so
/// partial overlap still returns results; BM25 ranking favors documents
/// matching more terms without requiring a strict AND.
pub(crate) fn fts_query(text: &str) -> String {
    let tokens: Vec<String> = text
        .split_whitespace()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect();

    tokens.join(" OR ")
}

/// A ~32-char window around the first match, matching spec Design Notes.
const SNIPPET_RADIUS: usize = 16;

pub(crate) fn snippet_around(content: &str, query: &str) -> String {
    let lower_content = content.to_lowercase();
    let lower_query = query.to_lowercase();
    let first_term = lower_query.split_whitespace().next().unwrap_or("");

    let Some(byte_pos) = (!first_term.is_empty())
        .then(|| lower_content.find(first_term))
        .flatten()
    else {
        return truncate_chars(content, SNIPPET_RADIUS * 2);
    };

    let char_pos = content[..byte_pos].chars().count();
    let chars: Vec<char> = content.chars().collect();
    let start = char_pos.saturating_sub(SNIPPET_RADIUS);
    let end = (char_pos + first_term.chars().count() + SNIPPET_RADIUS).min(chars.len());

    let mut snippet: String = chars[start..end].iter().collect();
    if start > 0 {
        snippet = format!("…{snippet}");
    }
    if end < chars.len() {
        snippet.push('…');
    }
    snippet
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_chars {
        return s.to_owned();
    }
    let mut out: String = chars[..max_chars].iter().collect();
    out.push('…');
    out
}

/// First-match snippet for regex-mode search: the matched range widened by
/// the same radius as `snippet_around`, not score-aware.
pub(crate) fn snippet_for_regex_match(content: &str, match_start: usize, match_end: usize) -> String {
    let char_start = content[..match_start].chars().count();
    let char_end = content[..match_end].chars().count();
    let chars: Vec<char> = content.chars().collect();
    let start = char_start.saturating_sub(SNIPPET_RADIUS);
    let end = (char_end + SNIPPET_RADIUS).min(chars.len());

    let mut snippet: String = chars[start..end].iter().collect();
    if start > 0 {
        snippet = format!("…{snippet}");
    }
    if end < chars.len() {
        snippet.push('…');
    }
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_query_or_joins_quoted_terms() {
        assert_eq!(fts_query("hello world"), "\"hello\" OR \"world\"");
    }

    #[test]
    fn snippet_around_centers_on_first_match() {
        let content = "the quick brown fox jumps over the lazy dog and keeps running";
        let snippet = snippet_around(content, "fox");
        assert!(snippet.contains("fox"));
        assert!(snippet.len() < content.len());
    }

    #[test]
    fn ms_roundtrips_through_dt() {
        let dt = Utc::now();
        let ms = ms_from_dt(dt);
        let back = dt_from_ms(ms);
        assert_eq!(ms_from_dt(back), ms);
    }
}
