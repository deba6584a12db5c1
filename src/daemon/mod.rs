//! Daemon assembly and lifecycle.
//!
//! The daemon owns no global state: every component receives its
//! collaborators through its constructor, and the external capabilities
//! (ticket adapter, store, workflow executor) are injected as trait objects
//! so tests can substitute scripted fakes.

pub mod backoff;
pub mod comments;
pub mod hibernation;
pub mod poller;
pub mod reset;
pub mod yolo;


pub use backoff::BackoffController;
pub use comments::CommentReactor;
pub use hibernation::HibernationControl;
pub use poller::{CycleOutcome, Poller};
pub use reset::ResetController;
pub use yolo::YoloController;

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::ActorPolicy;
use crate::config::Config;
use crate::executor::WorkflowExecutor;
use crate::policy::TriggerPolicy;
use crate::runner::{RaceGuard, RunnerPool};
use crate::store::Store;
use crate::ticket::{AdapterError, TicketAdapter};

/// Errors that terminate the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Authorization or startup failure against the ticket platform.
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// The assembled daemon.
pub struct Daemon {
    poller: Poller,
}

impl Daemon {
    /// Wires the components together.
    ///
    /// Resolving the authenticated identity doubles as the startup
    /// credential check: an authorization failure here is fatal before any
    /// board is touched.
    pub async fn new(
        config: &Config,
        adapter: Arc<dyn TicketAdapter>,
        store: Arc<dyn Store>,
        executor: Arc<dyn WorkflowExecutor>,
    ) -> Result<Self, DaemonError> {
        let self_actor = adapter.authenticated_actor().await?;
        info!(actor = %self_actor, "Authenticated against ticket platform");

        let actors = ActorPolicy {
            allowed_username: config.allowed_username.clone(),
            self_username: self_actor.clone(),
            team_usernames: config.team_usernames.clone(),
            allow_others: config.allow_others_tickets,
        };

        let race = Arc::new(RaceGuard::new(Arc::clone(&adapter), self_actor.clone()));
        let pool = Arc::new(RunnerPool::new(
            config.max_concurrent_workflows,
            Arc::clone(&adapter),
            Arc::clone(&store),
            executor,
            Arc::clone(&race),
        ));

        let poller = Poller::new(
            config.boards.clone(),
            Arc::clone(&adapter),
            pool,
            race,
            TriggerPolicy::new(config.watched_statuses.clone()),
            CommentReactor::new(
                Arc::clone(&adapter),
                Arc::clone(&store),
                config.allowed_username.clone(),
                self_actor,
            ),
            YoloController::new(Arc::clone(&adapter), actors.clone()),
            ResetController::new(Arc::clone(&adapter), actors.clone()),
            BackoffController::new(config.poll_interval),
            HibernationControl::new(config.hibernation_probe_interval),
            actors,
            config.stage_models.clone(),
            config.stale_threshold,
        );

        Ok(Daemon { poller })
    }

    /// Runs until the shutdown token fires or a fatal error occurs.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        self.poller.run(shutdown).await?;
        Ok(())
    }
}
