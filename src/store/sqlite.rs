//! SQLite implementation of the [`Store`] contract.
//!
//! # Schema versioning
//!
//! A `schema_version` table tracks the current version. To change the schema,
//! increment `CURRENT_SCHEMA_VERSION` and extend `run_migrations`; migrations
//! run sequentially from the stored version to the target.
//!
//! # Durability
//!
//! The database is opened with `journal_mode = WAL` and a 5s busy timeout.
//! Cursor updates and run-history appends are single statements, so no
//! explicit transactions are needed.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::{RunOutcome, RunRow, Store, StoreError};
use crate::types::{RepoId, TicketId};

/// Current schema version. See the module docs before changing.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed store.
///
/// The connection is guarded by a mutex; all call sites are short local
/// statements, so contention is negligible next to adapter round-trips.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (and migrates) the database at the given path, creating parent
    /// directories as needed. Pass `:memory:` for an ephemeral store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy();

        if path_str != ":memory:"
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Storage(format!("create {}: {e}", parent.display())))?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("connection poisoned");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
            [],
        )?;

        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .optional()?;

        let mut version = match version {
            Some(v) => v,
            None => {
                conn.execute("INSERT INTO schema_version (version) VALUES (0)", [])?;
                0
            }
        };

        if version < 1 {
            conn.execute_batch(
                "
                CREATE TABLE issue_state (
                    repo            TEXT    NOT NULL,
                    ticket_id       INTEGER NOT NULL,
                    updated_at      TEXT    NOT NULL,
                    last_comment_at TEXT,
                    PRIMARY KEY (repo, ticket_id)
                );
                CREATE TABLE run_history (
                    id          INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo        TEXT    NOT NULL,
                    ticket_id   INTEGER NOT NULL,
                    workflow    TEXT    NOT NULL,
                    started_at  TEXT    NOT NULL,
                    finished_at TEXT    NOT NULL,
                    outcome     TEXT    NOT NULL,
                    session_ref TEXT
                );
                CREATE INDEX run_history_item
                    ON run_history (repo, ticket_id, finished_at);
                ",
            )?;
            version = 1;
        }

        debug_assert_eq!(version, CURRENT_SCHEMA_VERSION);
        conn.execute("UPDATE schema_version SET version = ?1", params![version])?;
        Ok(())
    }
}

fn parse_outcome(s: &str) -> RunOutcome {
    match s {
        "success" => RunOutcome::Success,
        "cancelled" => RunOutcome::Cancelled,
        _ => RunOutcome::Failure,
    }
}

impl Store for SqliteStore {
    fn last_comment_at(
        &self,
        repo: &RepoId,
        ticket: TicketId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn.lock().expect("connection poisoned");
        let value: Option<Option<String>> = conn
            .query_row(
                "SELECT last_comment_at FROM issue_state WHERE repo = ?1 AND ticket_id = ?2",
                params![repo.to_string(), ticket.0 as i64],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value.flatten().and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }))
    }

    fn advance_comment_cursor(
        &self,
        repo: &RepoId,
        ticket: TicketId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("connection poisoned");
        // MAX keeps the cursor monotonic even if cycles race each other.
        conn.execute(
            "INSERT INTO issue_state (repo, ticket_id, updated_at, last_comment_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (repo, ticket_id) DO UPDATE SET
                updated_at = excluded.updated_at,
                last_comment_at = MAX(COALESCE(issue_state.last_comment_at, ''),
                                      excluded.last_comment_at)",
            params![
                repo.to_string(),
                ticket.0 as i64,
                Utc::now().to_rfc3339(),
                at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn record_run(&self, run: &RunRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("connection poisoned");
        conn.execute(
            "INSERT INTO run_history
                (repo, ticket_id, workflow, started_at, finished_at, outcome, session_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.repo.to_string(),
                run.ticket.0 as i64,
                run.workflow,
                run.started_at.to_rfc3339(),
                run.finished_at.to_rfc3339(),
                run.outcome.as_str(),
                run.session_ref,
            ],
        )?;
        Ok(())
    }

    fn recent_runs(
        &self,
        repo: &RepoId,
        ticket: TicketId,
        limit: usize,
    ) -> Result<Vec<RunRow>, StoreError> {
        let conn = self.conn.lock().expect("connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT repo, ticket_id, workflow, started_at, finished_at, outcome, session_ref
             FROM run_history
             WHERE repo = ?1 AND ticket_id = ?2
             ORDER BY finished_at DESC, id DESC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(
            params![repo.to_string(), ticket.0 as i64, limit as i64],
            |row| {
                let repo_str: String = row.get(0)?;
                let ticket_id: i64 = row.get(1)?;
                let workflow: String = row.get(2)?;
                let started_at: String = row.get(3)?;
                let finished_at: String = row.get(4)?;
                let outcome: String = row.get(5)?;
                let session_ref: Option<String> = row.get(6)?;
                Ok((
                    repo_str,
                    ticket_id,
                    workflow,
                    started_at,
                    finished_at,
                    outcome,
                    session_ref,
                ))
            },
        )?;

        let mut out = Vec::new();
        for row in rows {
            let (repo_str, ticket_id, workflow, started_at, finished_at, outcome, session_ref) =
                row?;
            let repo = RepoId::parse(&repo_str)
                .map_err(|e| StoreError::Storage(format!("bad repo in run_history: {e}")))?;
            let parse_ts = |s: &str| {
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| StoreError::Storage(format!("bad timestamp in run_history: {e}")))
            };
            out.push(RunRow {
                repo,
                ticket: TicketId(ticket_id as u64),
                workflow,
                started_at: parse_ts(&started_at)?,
                finished_at: parse_ts(&finished_at)?,
                outcome: parse_outcome(&outcome),
                session_ref,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn repo() -> RepoId {
        RepoId::parse("github.com/acme/widgets").unwrap()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn open_store() -> SqliteStore {
        SqliteStore::open(":memory:").unwrap()
    }

    #[test]
    fn cursor_starts_empty() {
        let store = open_store();
        assert_eq!(store.last_comment_at(&repo(), TicketId(1)).unwrap(), None);
    }

    #[test]
    fn cursor_advances_and_reads_back() {
        let store = open_store();
        store
            .advance_comment_cursor(&repo(), TicketId(1), ts(10))
            .unwrap();
        assert_eq!(
            store.last_comment_at(&repo(), TicketId(1)).unwrap(),
            Some(ts(10))
        );
    }

    #[test]
    fn cursor_is_monotonic() {
        let store = open_store();
        store
            .advance_comment_cursor(&repo(), TicketId(1), ts(100))
            .unwrap();
        store
            .advance_comment_cursor(&repo(), TicketId(1), ts(50))
            .unwrap();
        assert_eq!(
            store.last_comment_at(&repo(), TicketId(1)).unwrap(),
            Some(ts(100))
        );
    }

    #[test]
    fn cursor_is_per_item() {
        let store = open_store();
        store
            .advance_comment_cursor(&repo(), TicketId(1), ts(10))
            .unwrap();
        assert_eq!(store.last_comment_at(&repo(), TicketId(2)).unwrap(), None);
    }

    #[test]
    fn run_history_roundtrip() {
        let store = open_store();
        let run = RunRow {
            repo: repo(),
            ticket: TicketId(7),
            workflow: "research".to_string(),
            started_at: ts(0),
            finished_at: ts(60),
            outcome: RunOutcome::Success,
            session_ref: Some("sess-123".to_string()),
        };
        store.record_run(&run).unwrap();

        let runs = store.recent_runs(&repo(), TicketId(7), 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].workflow, "research");
        assert_eq!(runs[0].outcome, RunOutcome::Success);
        assert_eq!(runs[0].session_ref.as_deref(), Some("sess-123"));
    }

    #[test]
    fn recent_runs_newest_first_and_limited() {
        let store = open_store();
        for i in 0..5 {
            store
                .record_run(&RunRow {
                    repo: repo(),
                    ticket: TicketId(7),
                    workflow: format!("run-{i}"),
                    started_at: ts(i * 10),
                    finished_at: ts(i * 10 + 5),
                    outcome: RunOutcome::Failure,
                    session_ref: None,
                })
                .unwrap();
        }

        let runs = store.recent_runs(&repo(), TicketId(7), 2).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].workflow, "run-4");
        assert_eq!(runs[1].workflow, "run-3");
    }

    #[test]
    fn reopening_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .advance_comment_cursor(&repo(), TicketId(3), ts(42))
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.last_comment_at(&repo(), TicketId(3)).unwrap(),
            Some(ts(42))
        );
    }
}
