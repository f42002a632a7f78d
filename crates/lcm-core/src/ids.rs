//! Opaque ID generation for summaries and large files.
//!
//! IDs are deterministic functions of content so that re-running a
//! compaction pass against the same input (e.g. after a crash before the
//! DAG write committed) reproduces the same summary id rather than minting
//! a duplicate.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

const SUMMARY_PREFIX: &str = "sum_";
const FILE_PREFIX: &str = "file_";
const ID_HEX_LEN: usize = 16;

fn short_hex(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    hex::encode(digest)[..ID_HEX_LEN].to_owned()
}

/// `sum_<16 hex of sha256(content||now)>`.
pub fn new_summary_id(content: &str, now: DateTime<Utc>) -> String {
    let seed = format!("{content}{}", now.timestamp_nanos_opt().unwrap_or_default());
    format!("{SUMMARY_PREFIX}{}", short_hex(&seed))
}

/// `file_<16 hex of sha256(name||mime||now)>`.
pub fn new_file_id(name: &str, mime: &str, now: DateTime<Utc>) -> String {
    let seed = format!(
        "{name}{mime}{}",
        now.timestamp_nanos_opt().unwrap_or_default()
    );
    format!("{FILE_PREFIX}{}", short_hex(&seed))
}

pub fn is_summary_id(id: &str) -> bool {
    id.starts_with(SUMMARY_PREFIX)
}

pub fn is_file_id(id: &str) -> bool {
    id.starts_with(FILE_PREFIX)
}

/// Content hash used to detect an already-imported suffix during bootstrap
/// reconciliation. Not a cryptographic identity, just a stable fingerprint.
pub fn content_hash(role: &str, content: &str) -> String {
    short_hex(&format!("{role}\u{0}{content}"))
}
