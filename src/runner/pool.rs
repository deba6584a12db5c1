//! Bounded concurrent workflow execution.
//!
//! The pool tracks one [`RunRecord`] per in-flight workflow, keyed by
//! `(repo, ticket)`. It enforces two invariants: no two records share a key,
//! and the record count never exceeds the configured ceiling. The record map
//! is an efficiency index only; the authoritative "workflow is running"
//! state is the running label on the remote ticket.
//!
//! Every workflow runs as its own tokio task with a per-run cancellation
//! token. On termination a callback runs unconditionally: it releases the
//! running label according to the outcome, performs comment follow-up for
//! edit workflows, writes run history, and drops the record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::race::RaceGuard;
use crate::executor::{ExecutionStatus, WorkflowExecutor, WorkflowRequest};
use crate::labels::Stage;
use crate::store::{RunOutcome, RunRow, Store};
use crate::ticket::TicketAdapter;
use crate::types::{Reaction, RunKey, Status};

/// In-memory state of one dispatched workflow.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub stage: Stage,
    /// The actor observed to have caused the triggering transition.
    pub claimer: Option<String>,
    /// Item status at dispatch time.
    pub status_at_dispatch: Status,
    pub started: Instant,
    pub cancel: CancellationToken,
}

/// Bounded pool of concurrently running workflows.
pub struct RunnerPool {
    max_concurrent: usize,
    records: Arc<Mutex<HashMap<RunKey, RunRecord>>>,
    tracker: TaskTracker,
    adapter: Arc<dyn TicketAdapter>,
    store: Arc<dyn Store>,
    executor: Arc<dyn WorkflowExecutor>,
    race: Arc<RaceGuard>,
}

impl RunnerPool {
    pub fn new(
        max_concurrent: usize,
        adapter: Arc<dyn TicketAdapter>,
        store: Arc<dyn Store>,
        executor: Arc<dyn WorkflowExecutor>,
        race: Arc<RaceGuard>,
    ) -> Self {
        RunnerPool {
            max_concurrent,
            records: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            adapter,
            store,
            executor,
            race,
        }
    }

    /// Whether this instance has an active run for the item.
    pub fn has_active_run(&self, key: &RunKey) -> bool {
        self.records.lock().expect("record map poisoned").contains_key(key)
    }

    /// A snapshot of the run record for an item, if one is active.
    pub fn active_record(&self, key: &RunKey) -> Option<RunRecord> {
        self.records
            .lock()
            .expect("record map poisoned")
            .get(key)
            .cloned()
    }

    pub fn active_count(&self) -> usize {
        self.records.lock().expect("record map poisoned").len()
    }

    /// Whether a dispatch would currently be rejected for capacity.
    pub fn at_capacity(&self) -> bool {
        self.active_count() >= self.max_concurrent
    }

    /// Dispatches a workflow, returning false if the item already has an
    /// active run or the concurrency ceiling is reached.
    ///
    /// The caller must hold the claim on the stage's running label; the
    /// termination callback releases it.
    pub fn try_dispatch(
        &self,
        key: RunKey,
        claimer: Option<String>,
        status_at_dispatch: Status,
        request: WorkflowRequest,
    ) -> bool {
        let cancel = CancellationToken::new();

        {
            let mut records = self.records.lock().expect("record map poisoned");
            if records.contains_key(&key) {
                debug!(key = %key, "Dispatch rejected: item already running");
                return false;
            }
            if records.len() >= self.max_concurrent {
                debug!(
                    key = %key,
                    active = records.len(),
                    max = self.max_concurrent,
                    "Dispatch rejected: pool at capacity"
                );
                return false;
            }
            records.insert(
                key.clone(),
                RunRecord {
                    stage: request.stage,
                    claimer,
                    status_at_dispatch,
                    started: Instant::now(),
                    cancel: cancel.clone(),
                },
            );
        }

        info!(key = %key, stage = %request.stage, "Dispatching workflow");

        let records = Arc::clone(&self.records);
        let adapter = Arc::clone(&self.adapter);
        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let race = Arc::clone(&self.race);

        self.tracker.spawn(async move {
            let started_at = Utc::now();
            let stage = request.stage;
            let repo = request.repo.clone();
            let ticket = request.ticket;
            let comment = request.comment.clone();

            let execution = executor.execute(request, cancel.clone()).await;

            let (outcome, session_ref) = match execution {
                Ok(execution) => {
                    let outcome = match execution.status {
                        ExecutionStatus::Success => RunOutcome::Success,
                        ExecutionStatus::Failure => RunOutcome::Failure,
                        ExecutionStatus::Cancelled => RunOutcome::Cancelled,
                    };
                    (outcome, execution.session_ref)
                }
                Err(e) => {
                    error!(key = %key, error = %e, "Workflow executor error");
                    (RunOutcome::Failure, None)
                }
            };

            info!(
                key = %key,
                stage = %stage,
                outcome = outcome.as_str(),
                "Workflow finished"
            );

            // Unconditional termination callback. Each step is best-effort:
            // a failed adapter call here leaves a stale running label that
            // the next poll cycle sweeps.
            if let Err(e) = race.release(&repo, ticket, stage, outcome).await {
                warn!(key = %key, error = %e, "Failed to release running label");
            }

            if let Some(comment) = comment {
                match outcome {
                    RunOutcome::Success => {
                        // Mark processed and move the cursor past this
                        // comment; a failure below means the comment is
                        // retried next cycle, which is safe.
                        if let Err(e) = adapter
                            .set_reaction(&repo, comment.id, Reaction::PlusOne)
                            .await
                        {
                            warn!(key = %key, error = %e, "Failed to mark comment processed");
                        }
                        if let Err(e) =
                            store.advance_comment_cursor(&repo, ticket, comment.created_at)
                        {
                            warn!(key = %key, error = %e, "Failed to advance comment cursor");
                        }
                    }
                    RunOutcome::Failure | RunOutcome::Cancelled => {
                        // Leave the cursor in place for an idempotent retry,
                        // but clear the being-processed marker.
                        if let Err(e) = adapter
                            .remove_reaction(&repo, comment.id, Reaction::Eyes)
                            .await
                        {
                            warn!(key = %key, error = %e, "Failed to clear processing marker");
                        }
                    }
                }
            }

            let row = RunRow {
                repo: repo.clone(),
                ticket,
                workflow: stage.workflow_name().to_string(),
                started_at,
                finished_at: Utc::now(),
                outcome,
                session_ref,
            };
            if let Err(e) = store.record_run(&row) {
                warn!(key = %key, error = %e, "Failed to record run history");
            }

            records.lock().expect("record map poisoned").remove(&key);
        });

        true
    }

    /// Cancels every run older than the threshold. The cancelled workflows
    /// exit through the normal termination callback; any running label they
    /// leave behind is swept by the next poll cycle.
    pub fn cancel_stale(&self, threshold: Duration) -> usize {
        let records = self.records.lock().expect("record map poisoned");
        let mut cancelled = 0;
        for (key, record) in records.iter() {
            if record.started.elapsed() >= threshold && !record.cancel.is_cancelled() {
                warn!(
                    key = %key,
                    stage = %record.stage,
                    age_secs = record.started.elapsed().as_secs(),
                    "Cancelling stalled workflow"
                );
                record.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Signals every active workflow to cancel.
    pub fn cancel_all(&self) {
        let records = self.records.lock().expect("record map poisoned");
        for record in records.values() {
            record.cancel.cancel();
        }
    }

    /// Waits for every dispatched workflow to exit. No new dispatches are
    /// accepted afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Execution, ExecutorError};
    use crate::test_utils::{MockAdapter, MockExecutor, MockStore};
    use crate::types::{RepoId, TicketId};
    use async_trait::async_trait;

    fn repo() -> RepoId {
        RepoId::parse("github.com/acme/widgets").unwrap()
    }

    fn key(ticket: u64) -> RunKey {
        RunKey::new(repo(), TicketId(ticket))
    }

    fn request(ticket: u64, stage: Stage) -> WorkflowRequest {
        WorkflowRequest {
            repo: repo(),
            ticket: TicketId(ticket),
            stage,
            model: None,
            comment: None,
            edit_target: None,
            reviewer: None,
        }
    }

    fn pool_with(
        max: usize,
        adapter: Arc<MockAdapter>,
        store: Arc<MockStore>,
        executor: Arc<dyn WorkflowExecutor>,
    ) -> RunnerPool {
        let race = Arc::new(RaceGuard::new(adapter.clone(), "kiln-bot"));
        RunnerPool::new(max, adapter, store, executor, race)
    }

    #[tokio::test]
    async fn successful_run_releases_label_and_records_history() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["researching"]);
        let store = Arc::new(MockStore::new());
        let executor = Arc::new(MockExecutor::succeeding());
        let pool = pool_with(3, adapter.clone(), store.clone(), executor);

        assert!(pool.try_dispatch(
            key(1),
            Some("alice".to_string()),
            Status::Research,
            request(1, Stage::Research),
        ));
        pool.drain().await;

        let labels = adapter.ticket_labels(&repo(), TicketId(1));
        assert!(labels.contains("research_ready"));
        assert!(!labels.contains("researching"));

        let runs = store.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].workflow, "research");
        assert_eq!(runs[0].outcome, RunOutcome::Success);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn record_tracks_claimer_and_dispatch_status() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        let store = Arc::new(MockStore::new());
        let executor = Arc::new(MockExecutor::blocking());
        let pool = pool_with(3, adapter, store, executor.clone());

        pool.try_dispatch(
            key(1),
            Some("alice".to_string()),
            Status::Research,
            request(1, Stage::Research),
        );

        let record = pool.active_record(&key(1)).unwrap();
        assert_eq!(record.stage, Stage::Research);
        assert_eq!(record.claimer.as_deref(), Some("alice"));
        assert_eq!(record.status_at_dispatch, Status::Research);
        assert!(!record.cancel.is_cancelled());

        executor.release_all();
        pool.drain().await;
        assert!(pool.active_record(&key(1)).is_none());
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        let store = Arc::new(MockStore::new());
        let executor = Arc::new(MockExecutor::blocking());
        let pool = pool_with(3, adapter, store, executor.clone());

        assert!(pool.try_dispatch(key(1), None, Status::Research, request(1, Stage::Research)));
        assert!(!pool.try_dispatch(key(1), None, Status::Research, request(1, Stage::Research)));

        executor.release_all();
        pool.drain().await;
    }

    #[tokio::test]
    async fn capacity_ceiling_rejects_third_dispatch() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        let store = Arc::new(MockStore::new());
        let executor = Arc::new(MockExecutor::blocking());
        let pool = pool_with(2, adapter, store, executor.clone());

        assert!(pool.try_dispatch(key(1), None, Status::Research, request(1, Stage::Research)));
        assert!(pool.try_dispatch(key(2), None, Status::Plan, request(2, Stage::Plan)));
        assert!(pool.at_capacity());
        assert!(!pool.try_dispatch(key(3), None, Status::Research, request(3, Stage::Research)));

        executor.release_all();
        pool.drain().await;
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn failure_applies_stage_failure_label() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["implementing"]);
        let store = Arc::new(MockStore::new());
        let executor = Arc::new(MockExecutor::failing());
        let pool = pool_with(3, adapter.clone(), store.clone(), executor);

        pool.try_dispatch(key(1), None, Status::Implement, request(1, Stage::Implement));
        pool.drain().await;

        let labels = adapter.ticket_labels(&repo(), TicketId(1));
        assert!(labels.contains("implementation_failed"));
        assert!(!labels.contains("implementing"));
        assert_eq!(store.runs()[0].outcome, RunOutcome::Failure);
    }

    #[tokio::test]
    async fn cancellation_removes_running_label_only() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["researching"]);
        let store = Arc::new(MockStore::new());
        let executor = Arc::new(MockExecutor::blocking());
        let pool = pool_with(3, adapter.clone(), store.clone(), executor);

        pool.try_dispatch(key(1), None, Status::Research, request(1, Stage::Research));
        pool.cancel_all();
        pool.drain().await;

        let labels = adapter.ticket_labels(&repo(), TicketId(1));
        assert!(!labels.contains("researching"));
        assert!(!labels.contains("research_ready"));
        assert!(adapter.label_adds().is_empty());
        assert_eq!(store.runs()[0].outcome, RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn stale_runs_are_cancelled_by_sweep() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        let store = Arc::new(MockStore::new());
        let executor = Arc::new(MockExecutor::blocking());
        let pool = pool_with(3, adapter, store, executor);

        pool.try_dispatch(key(1), None, Status::Research, request(1, Stage::Research));

        // Zero threshold: everything is immediately stale.
        assert_eq!(pool.cancel_stale(Duration::ZERO), 1);
        // Second sweep finds the token already cancelled.
        assert_eq!(pool.cancel_stale(Duration::ZERO), 0);

        pool.drain().await;
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn executor_error_counts_as_failure() {
        struct BrokenExecutor;

        #[async_trait]
        impl WorkflowExecutor for BrokenExecutor {
            async fn execute(
                &self,
                _request: WorkflowRequest,
                _cancel: CancellationToken,
            ) -> Result<Execution, ExecutorError> {
                Err(ExecutorError::Spawn(std::io::Error::other("no binary")))
            }
        }

        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["researching"]);
        let store = Arc::new(MockStore::new());
        let pool = pool_with(3, adapter.clone(), store.clone(), Arc::new(BrokenExecutor));

        pool.try_dispatch(key(1), None, Status::Research, request(1, Stage::Research));
        pool.drain().await;

        assert_eq!(store.runs()[0].outcome, RunOutcome::Failure);
        let labels = adapter.ticket_labels(&repo(), TicketId(1));
        assert!(labels.contains("research_failed"));
        assert!(!labels.contains("researching"));
    }

    #[tokio::test]
    async fn edit_success_marks_comment_and_advances_cursor() {
        use chrono::TimeZone;
        use std::collections::BTreeSet;

        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["editing"]);
        let store = Arc::new(MockStore::new());
        let executor = Arc::new(MockExecutor::succeeding());
        let pool = pool_with(3, adapter.clone(), store.clone(), executor);

        let at = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        let mut req = request(1, Stage::Edit);
        req.comment = Some(crate::types::Comment {
            id: crate::types::CommentId(77),
            author: "alice".to_string(),
            body: "feedback".to_string(),
            created_at: at,
            reactions: BTreeSet::new(),
        });

        pool.try_dispatch(key(1), None, Status::Research, req);
        pool.drain().await;

        assert_eq!(
            store.cursor(&repo(), TicketId(1)),
            Some(at),
            "cursor advances past the processed comment"
        );
        assert!(
            adapter
                .reactions_set(crate::types::CommentId(77))
                .contains(&Reaction::PlusOne)
        );
        assert!(!adapter.ticket_labels(&repo(), TicketId(1)).contains("editing"));
    }

    #[tokio::test]
    async fn edit_failure_clears_eyes_and_keeps_cursor() {
        use std::collections::BTreeSet;

        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["editing"]);
        let store = Arc::new(MockStore::new());
        let executor = Arc::new(MockExecutor::failing());
        let pool = pool_with(3, adapter.clone(), store.clone(), executor);

        let mut req = request(1, Stage::Edit);
        req.comment = Some(crate::types::Comment {
            id: crate::types::CommentId(77),
            author: "alice".to_string(),
            body: "feedback".to_string(),
            created_at: Utc::now(),
            reactions: BTreeSet::new(),
        });

        pool.try_dispatch(key(1), None, Status::Research, req);
        pool.drain().await;

        assert_eq!(store.cursor(&repo(), TicketId(1)), None);
        assert!(
            adapter
                .reactions_removed(crate::types::CommentId(77))
                .contains(&Reaction::Eyes)
        );
    }
}
