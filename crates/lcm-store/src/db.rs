//! Shared sqlite connection and transaction discipline.
//!
//! `ConversationStore` and `SummaryStore` both wrap the same [`Db`] so that
//! a compaction pass can splice a new summary into `context_items` and
//! write its source-message edges in one atomic transaction, even though
//! the two stores expose logically separate APIs.
//!
//! `with_transaction` is the *outermost* entry point for a unit of work: it
//! takes the connection lock once, opens one real transaction, and commits
//! or rolls back when `f` returns. Composition ("nested calls reuse the
//! outermost transaction") happens by writing the actual SQL in free
//! functions that take `&Connection` (see `conversation_ops`/`summary_ops`)
//! and calling several of them from inside a single `with_transaction`
//! closure, rather than by calling `with_transaction` itself recursively —
//! `std::sync::Mutex` isn't reentrant, so a second `with_transaction` call
//! from within the first would deadlock the calling thread. The thread-local
//! guard below catches that specific programming error (a nested call on the
//! *same* call stack) before the second call ever touches the mutex, turning
//! it into a clear failure instead of a hang. It deliberately keys off the
//! calling thread rather than a flag on `Db` itself: two different sessions'
//! Facades legitimately call `with_transaction` on the same shared `Db`
//! concurrently from different threads, and that case must block on the
//! mutex and proceed, not be mistaken for reentrancy.

use std::cell::Cell;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::schema;

thread_local! {
    static IN_TRANSACTION: Cell<bool> = const { Cell::new(false) };
}

pub struct Db {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db dir: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open lcm db: {}", path.display()))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` as a single atomic transaction. Must not be called again
    /// (directly or transitively) while `f` is running on the same thread —
    /// compose multiple writes by calling the `*_tx(conn, ...)` free
    /// functions from inside one `with_transaction` closure instead.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let already_open = IN_TRANSACTION.with(|flag| flag.replace(true));
        if already_open {
            anyhow::bail!(
                "with_transaction called reentrantly on this thread; compose via conversation_ops/summary_ops instead"
            );
        }

        let result = (|| {
            let conn = self.conn.lock().expect("lcm db mutex poisoned");
            conn.execute_batch("BEGIN IMMEDIATE")
                .context("failed to begin transaction")?;

            let result = f(&conn);

            match &result {
                Ok(_) => {
                    conn.execute_batch("COMMIT")
                        .context("failed to commit transaction")?;
                }
                Err(_) => {
                    // Best-effort: surfacing the original error matters more
                    // than the outcome of the rollback itself.
                    let _ = conn.execute_batch("ROLLBACK");
                }
            }

            result
        })();

        IN_TRANSACTION.with(|flag| flag.set(false));
        result
    }

    /// Run `f` against a read-only snapshot of the connection. Reads never
    /// go through the facade's per-session writer queue, but they do
    /// briefly take the same mutex as writers to see a consistent view.
    pub fn with_read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("lcm db mutex poisoned");
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_failure_rolls_back_all_writes() {
        let db = Db::open_in_memory().unwrap();
        db.with_transaction(|conn| -> anyhow::Result<()> {
            conn.execute(
                "INSERT INTO conversations (session_id, created_at, updated_at) VALUES ('s1', 0, 0)",
                [],
            )?;
            conn.execute(
                "INSERT INTO conversations (session_id, created_at, updated_at) VALUES ('s2', 0, 0)",
                [],
            )?;
            anyhow::bail!("forced failure");
        })
        .unwrap_err();

        let count: i64 = db
            .with_read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0, "failed transaction must roll back every write");
    }

    #[test]
    fn committed_transaction_persists() {
        let db = Db::open_in_memory().unwrap();
        db.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO conversations (session_id, created_at, updated_at) VALUES ('s1', 0, 0)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let count: i64 = db
            .with_read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn reentrant_call_fails_fast_instead_of_deadlocking() {
        let db = Db::open_in_memory().unwrap();
        let result: Result<()> = db.with_transaction(|_conn| db.with_transaction(|_| Ok(())));
        assert!(result.is_err());
    }
}
