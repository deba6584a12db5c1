//! The top-level poll loop.
//!
//! Each cycle fetches every configured board, evaluates the trigger policy
//! per item, dispatches the resulting actions, sweeps stalled runs, and then
//! sleeps. The sleep always races the shutdown token, so cancellation takes
//! effect mid-sleep.
//!
//! Error classification drives the loop's moods:
//! - authorization failures are fatal and bubble out;
//! - platform-unreachable failures switch the loop into hibernation, where
//!   it probes at a fixed interval instead of backing off exponentially;
//! - anything else marks the cycle failed and grows the backoff.
//!
//! Per-board and per-item failures are isolated: a schema error on one board
//! skips that board, a bad item skips that item, and the rest of the cycle
//! proceeds.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffController;
use super::comments::CommentReactor;
use super::hibernation::HibernationControl;
use super::reset::ResetController;
use super::yolo::YoloController;
use crate::auth::ActorPolicy;
use crate::body::Section;
use crate::executor::WorkflowRequest;
use crate::labels::{Label, REQUIRED_LABELS, Stage};
use crate::policy::{Decision, EvalContext, TriggerPolicy};
use crate::runner::{Claim, RaceGuard, RunnerPool};
use crate::store::RunOutcome;
use crate::ticket::{AdapterError, Board, TicketAdapter};
use crate::types::{Comment, Item, RepoId, Status};

/// The terminal classification of one poll cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Every board was fetched and handled.
    Success,
    /// At least one board failed non-fatally.
    Failed,
    /// The platform is unreachable; enter hibernation.
    Unreachable(String),
    /// Authorization failure; the daemon cannot continue.
    Fatal(AdapterError),
}

/// Everything the poller drives. Constructed once by the daemon wiring.
pub struct Poller {
    pub(crate) boards: Vec<Board>,
    pub(crate) adapter: Arc<dyn TicketAdapter>,
    pub(crate) pool: Arc<RunnerPool>,
    pub(crate) race: Arc<RaceGuard>,
    pub(crate) policy: TriggerPolicy,
    pub(crate) reactor: CommentReactor,
    pub(crate) yolo: YoloController,
    pub(crate) reset: ResetController,
    pub(crate) backoff: BackoffController,
    pub(crate) hibernation: HibernationControl,
    pub(crate) actors: ActorPolicy,
    pub(crate) stage_models: HashMap<Stage, String>,
    pub(crate) stale_threshold: Duration,
    /// Repos whose kiln labels were already provisioned this process.
    ensured_repos: HashSet<RepoId>,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        boards: Vec<Board>,
        adapter: Arc<dyn TicketAdapter>,
        pool: Arc<RunnerPool>,
        race: Arc<RaceGuard>,
        policy: TriggerPolicy,
        reactor: CommentReactor,
        yolo: YoloController,
        reset: ResetController,
        backoff: BackoffController,
        hibernation: HibernationControl,
        actors: ActorPolicy,
        stage_models: HashMap<Stage, String>,
        stale_threshold: Duration,
    ) -> Self {
        Poller {
            boards,
            adapter,
            pool,
            race,
            policy,
            reactor,
            yolo,
            reset,
            backoff,
            hibernation,
            actors,
            stage_models,
            stale_threshold,
            ensured_repos: HashSet::new(),
        }
    }

    /// Runs the loop until the shutdown token fires or a fatal error occurs.
    ///
    /// On exit every active workflow is signalled to cancel and awaited; no
    /// child is forcibly terminated beyond its cancellation token.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), AdapterError> {
        info!(boards = self.boards.len(), "Poller started");

        let result = self.run_inner(&shutdown).await;

        info!("Draining active workflows before exit");
        self.pool.cancel_all();
        self.pool.drain().await;
        info!("Poller stopped");

        result
    }

    async fn run_inner(&mut self, shutdown: &CancellationToken) -> Result<(), AdapterError> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            if self.hibernation.is_hibernating() {
                if self.probe_platform().await {
                    self.hibernation.exit();
                    self.backoff.reset();
                    // Fall through to an immediate normal cycle.
                } else {
                    let interval = self.hibernation.probe_interval();
                    debug!(
                        probe_in_secs = interval.as_secs(),
                        "Platform still unreachable"
                    );
                    if sleep_interruptible(interval, shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            }

            let outcome = self.poll_cycle().await;

            // Stalled runs are swept every cycle regardless of outcome.
            self.pool.cancel_stale(self.stale_threshold);

            let sleep = match outcome {
                CycleOutcome::Fatal(e) => {
                    error!(error = %e, "Fatal error, shutting down");
                    return Err(e);
                }
                CycleOutcome::Unreachable(reason) => {
                    self.hibernation.enter(&reason);
                    self.hibernation.probe_interval()
                }
                CycleOutcome::Success => self.backoff.on_cycle_outcome(true),
                CycleOutcome::Failed => self.backoff.on_cycle_outcome(false),
            };

            if sleep_interruptible(sleep, shutdown).await {
                return Ok(());
            }
        }
    }

    /// One lightweight reachability check against the first board.
    ///
    /// Any response that is not a network-level failure proves the platform
    /// answers; the next normal cycle deals with whatever it said.
    async fn probe_platform(&self) -> bool {
        let Some(board) = self.boards.first() else {
            return true;
        };
        match self.adapter.list_items(board).await {
            Ok(_) => true,
            Err(e) if e.is_unreachable() => false,
            Err(_) => true,
        }
    }

    /// Fetches and handles every configured board once.
    pub async fn poll_cycle(&mut self) -> CycleOutcome {
        let mut all_ok = true;

        for board in self.boards.clone() {
            match self.poll_board(&board).await {
                Ok(()) => {}
                Err(e) if e.is_authorization() => return CycleOutcome::Fatal(e),
                Err(e) if e.is_unreachable() => {
                    return CycleOutcome::Unreachable(e.to_string());
                }
                Err(e) => {
                    warn!(board = %board, error = %e, "Board poll failed, skipping");
                    all_ok = false;
                }
            }
        }

        if all_ok {
            CycleOutcome::Success
        } else {
            CycleOutcome::Failed
        }
    }

    async fn poll_board(&mut self, board: &Board) -> Result<(), AdapterError> {
        let items = self.adapter.list_items(board).await?;
        debug!(board = %board, items = items.len(), "Fetched board");

        for item in items {
            if let Err(e) = self.handle_item(board, &item).await {
                // Fatal classes propagate; anything else skips the item.
                if e.is_authorization() || e.is_unreachable() {
                    return Err(e);
                }
                warn!(
                    context = item.context_key(),
                    error = %e,
                    "Failed to handle item, skipping"
                );
            }
        }
        Ok(())
    }

    async fn handle_item(&mut self, board: &Board, item: &Item) -> Result<(), AdapterError> {
        // An open item without a Status field lands in Backlog; it will be
        // evaluated normally next cycle.
        if item.status == Status::Unknown {
            if !item.state.is_closed() {
                info!(
                    context = item.context_key(),
                    "Item has no status, moving to Backlog"
                );
                self.adapter
                    .set_status(board, &item.node_id, Status::Backlog.as_str())
                    .await?;
            }
            return Ok(());
        }

        self.ensure_labels(&item.repo).await?;

        let ctx = EvalContext {
            has_active_run: self.pool.has_active_run(&item.run_key()),
            actionable_comment: if self.comment_rule_reachable(item) {
                self.reactor.next_actionable(item).await?
            } else {
                None
            },
        };

        match self.policy.evaluate(item, &ctx) {
            Decision::None => Ok(()),
            Decision::RunWorkflow(stage) => {
                if self.trigger_allowed(item).await? {
                    self.dispatch(board, item, stage, None).await?;
                }
                Ok(())
            }
            Decision::IterateComment(comment) => self.iterate_comment(board, item, comment).await,
            Decision::Advance(next) => {
                self.yolo.advance(board, item, &next).await?;
                Ok(())
            }
            Decision::Reset => {
                self.reset.reset(board, item).await?;
                Ok(())
            }
            Decision::Cleanup => self.cleanup(item).await,
            Decision::ClearStaleLabel(label) => {
                self.race
                    .sweep_stale(&item.repo, item.ticket, label)
                    .await?;
                Ok(())
            }
            Decision::RepairRunningLabels(labels) => {
                error!(
                    context = item.context_key(),
                    labels = ?labels.iter().map(|l| l.as_str()).collect::<Vec<_>>(),
                    "Multiple running labels on one item, stripping all"
                );
                for label in labels {
                    self.adapter
                        .remove_label(&item.repo, item.ticket, label.as_str())
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Whether policy rule 6 (comment iteration) can be reached for this
    /// item, gating the comment fetch behind the cheaper label checks.
    fn comment_rule_reachable(&self, item: &Item) -> bool {
        if !matches!(item.status, Status::Research | Status::Plan) || item.comment_count == 0 {
            return false;
        }
        if item.has_label(Label::Reset) || item.state.is_closed() {
            return false;
        }
        if !item.running_labels().is_empty() {
            return false;
        }
        // Rule 4 (run the stage) fires while the ready label is absent, and
        // rule 5 (yolo advance) fires when it is present alongside yolo.
        let ready_present = Stage::for_status(&item.status)
            .and_then(Stage::ready_label)
            .is_some_and(|ready| item.has_label(ready));
        ready_present && !item.has_label(Label::Yolo)
    }

    /// Consults the last status actor before dispatching a stage workflow.
    async fn trigger_allowed(&self, item: &Item) -> Result<bool, AdapterError> {
        if self.actors.allow_others {
            return Ok(true);
        }
        let actor = self
            .adapter
            .last_status_actor(&item.repo, item.ticket)
            .await?;
        Ok(self
            .actors
            .check_allowed(actor.as_deref(), &item.context_key(), "workflow"))
    }

    /// Claims the stage's running label and hands the workflow to the pool.
    ///
    /// Returns true when a workflow was actually dispatched.
    async fn dispatch(
        &mut self,
        _board: &Board,
        item: &Item,
        stage: Stage,
        comment: Option<Comment>,
    ) -> Result<bool, AdapterError> {
        if self.pool.has_active_run(&item.run_key()) {
            return Ok(false);
        }
        if self.pool.at_capacity() {
            debug!(
                context = item.context_key(),
                "Pool at capacity, deferring dispatch"
            );
            return Ok(false);
        }

        match self.race.claim(&item.repo, item.ticket, stage).await? {
            Claim::Won => {}
            Claim::Lost { .. } | Claim::AlreadyHeld => return Ok(false),
        }

        let claimer = match &comment {
            Some(c) => Some(c.author.clone()),
            None => self
                .adapter
                .last_status_actor(&item.repo, item.ticket)
                .await
                .ok()
                .flatten(),
        };

        let edit_target = match (stage, &item.status) {
            (Stage::Edit, Status::Plan) => Some(Section::Plan),
            (Stage::Edit, _) => Some(Section::Research),
            _ => None,
        };

        let request = WorkflowRequest {
            repo: item.repo.clone(),
            ticket: item.ticket,
            stage,
            model: self.stage_models.get(&stage).cloned(),
            comment,
            edit_target,
            reviewer: Some(self.actors.allowed_username.clone()),
        };

        let dispatched =
            self.pool
                .try_dispatch(item.run_key(), claimer, item.status.clone(), request);

        if !dispatched {
            // The claim is ours but nothing will run under it; release as a
            // cancellation so the label does not dangle until the stale sweep.
            self.race
                .release(&item.repo, item.ticket, stage, RunOutcome::Cancelled)
                .await?;
        }
        Ok(dispatched)
    }

    /// Marks the comment as being processed and dispatches the edit
    /// workflow; the marker is cleared when nothing ends up running.
    async fn iterate_comment(
        &mut self,
        board: &Board,
        item: &Item,
        comment: Comment,
    ) -> Result<(), AdapterError> {
        self.reactor.mark_processing(item, &comment).await?;

        let dispatched = self
            .dispatch(board, item, Stage::Edit, Some(comment.clone()))
            .await?;

        if !dispatched {
            self.reactor.clear_processing(item, &comment).await?;
        }
        Ok(())
    }

    /// Done or closed items: release resources and mark `cleaned_up`.
    async fn cleanup(&self, item: &Item) -> Result<(), AdapterError> {
        // Any leftover running label on a finished item is noise.
        for label in item.running_labels() {
            self.adapter
                .remove_label(&item.repo, item.ticket, label.as_str())
                .await?;
        }
        self.adapter
            .add_label(&item.repo, item.ticket, Label::CleanedUp.as_str())
            .await?;
        info!(context = item.context_key(), "Item cleaned up");
        Ok(())
    }

    /// Provisions the kiln labels on a repository, once per process.
    async fn ensure_labels(&mut self, repo: &RepoId) -> Result<(), AdapterError> {
        if self.ensured_repos.contains(repo) {
            return Ok(());
        }
        // Marked ensured up front: a partial failure here should not retrigger
        // full provisioning every cycle, and create_label is idempotent the
        // next time the daemon restarts.
        self.ensured_repos.insert(repo.clone());

        let existing: HashSet<String> = self.adapter.list_labels(repo).await?.into_iter().collect();
        for spec in REQUIRED_LABELS {
            if existing.contains(spec.label.as_str()) {
                continue;
            }
            if let Err(e) = self
                .adapter
                .create_label(repo, spec.label.as_str(), spec.description, spec.color)
                .await
            {
                warn!(repo = %repo, label = %spec.label, error = %e, "Failed to create label");
            }
        }
        debug!(repo = %repo, "Required labels ensured");
        Ok(())
    }
}

/// Sleeps for `duration` unless the token fires first. Returns true when
/// interrupted by shutdown.
async fn sleep_interruptible(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
