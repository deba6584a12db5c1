//! Local persistence: comment cursors and run history.
//!
//! The store is deliberately small. The authoritative workflow state lives on
//! the remote board; locally we persist only what cannot be recovered from a
//! poll: the per-item comment cursor (which comments have already been
//! considered) and the history of dispatched workflow runs.

pub mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{RepoId, TicketId};

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Terminal outcome of a workflow run, as recorded in run history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

/// One completed workflow run.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub repo: RepoId,
    pub ticket: TicketId,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    /// Opaque executor session reference, when one was produced.
    pub session_ref: Option<String>,
}

/// The persistence contract the core consumes.
///
/// Implementations are called from async context but are expected to be
/// fast local operations; connections are never shared across threads
/// without internal synchronization.
pub trait Store: Send + Sync {
    /// The timestamp of the last comment already considered for this item.
    fn last_comment_at(
        &self,
        repo: &RepoId,
        ticket: TicketId,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Advances the comment cursor. The cursor is monotonic: an earlier
    /// timestamp than the stored one is a no-op.
    fn advance_comment_cursor(
        &self,
        repo: &RepoId,
        ticket: TicketId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Appends a run-history row.
    fn record_run(&self, run: &RunRow) -> Result<(), StoreError>;

    /// Most recent runs for an item, newest first.
    fn recent_runs(
        &self,
        repo: &RepoId,
        ticket: TicketId,
        limit: usize,
    ) -> Result<Vec<RunRow>, StoreError>;
}
