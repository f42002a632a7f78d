//! Semantic error kinds for the LCM engine.
//!
//! Crates in this workspace return `anyhow::Result<T>` everywhere; this enum
//! gives callers that need to branch on *why* an operation failed something
//! to `downcast_ref` for, without forcing every leaf function to hand-roll
//! its own error type.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LcmError {
    /// Asked to operate on a `session_id` with no known conversation.
    SessionNotFound { session_id: String },
    /// Asked to operate on a `conversation_id` that does not exist.
    ConversationNotFound { conversation_id: String },
    /// `compact` was called without a usable token budget.
    MissingTokenBudget,
    /// The injected summarizer callback failed.
    SummarizerFailure { reason: String },
    /// `(conversation_id, seq)` already exists; only legal to hit inside a
    /// transaction, recovered by rollback + retry with a fresh `getMaxSeq`.
    DuplicateSeq { conversation_id: String, seq: i64 },
    /// A DAG depth or context-density invariant was violated. Fatal for the
    /// current operation; never masked.
    InvariantViolation { detail: String },
    /// Underlying store I/O failed.
    TransportFailure { detail: String },
}

impl fmt::Display for LcmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound { session_id } => {
                write!(f, "no conversation for session {session_id}")
            }
            Self::ConversationNotFound { conversation_id } => {
                write!(f, "no conversation {conversation_id}")
            }
            Self::MissingTokenBudget => write!(f, "missing token budget"),
            Self::SummarizerFailure { reason } => write!(f, "summarizer failed: {reason}"),
            Self::DuplicateSeq {
                conversation_id,
                seq,
            } => write!(f, "duplicate seq {seq} in conversation {conversation_id}"),
            Self::InvariantViolation { detail } => write!(f, "invariant violation: {detail}"),
            Self::TransportFailure { detail } => write!(f, "store transport failure: {detail}"),
        }
    }
}

impl std::error::Error for LcmError {}

impl LcmError {
    /// True if this is the kind of failure a caller should retry after
    /// refreshing its view of the store (e.g. a fresh `getMaxSeq`).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DuplicateSeq { .. })
    }
}
