//! The label-claim protocol guarding against competing daemon instances.
//!
//! Adding a label is not atomic at the platform, so two instances can both
//! "successfully" add the same running label. The platform does, however,
//! linearise the writes and attribute each to an actor. The claim protocol
//! exploits that:
//!
//! 1. Read the ticket's current labels; if the running label is already
//!    present, another instance owns it: abort.
//! 2. Add the running label (idempotent).
//! 3. Re-read the label's author. If it is not this daemon's identity, the
//!    competing add was first; abort **without removing the label**, since
//!    the winner owns it.
//!
//! Step 3 makes the race symmetrical: of any two racing claimers, at most one
//! observes its own identity as the author.
//!
//! Release is the commit point of a workflow outcome: the ready or failure
//! label is added first (idempotent), then the running label is removed.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::labels::Stage;
use crate::store::RunOutcome;
use crate::ticket::{AdapterError, TicketAdapter};
use crate::types::{RepoId, TicketId};

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// This daemon owns the running label; proceed to dispatch.
    Won,
    /// Another actor authored the label first. Not an error; abort quietly.
    Lost { winner: Option<String> },
    /// The running label was already present before we tried.
    AlreadyHeld,
}

/// Claims and releases running labels with authorship verification.
pub struct RaceGuard {
    adapter: Arc<dyn TicketAdapter>,
    /// This daemon's authenticated login; claims are verified against it.
    self_actor: String,
}

impl RaceGuard {
    pub fn new(adapter: Arc<dyn TicketAdapter>, self_actor: impl Into<String>) -> Self {
        RaceGuard {
            adapter,
            self_actor: self_actor.into(),
        }
    }

    pub fn self_actor(&self) -> &str {
        &self.self_actor
    }

    /// Attempts to claim the stage's running label on an item.
    pub async fn claim(
        &self,
        repo: &RepoId,
        ticket: TicketId,
        stage: Stage,
    ) -> Result<Claim, AdapterError> {
        let label = stage.running_label();

        let labels = self.adapter.get_ticket_labels(repo, ticket).await?;
        if labels.contains(label.as_str()) {
            debug!(
                repo = %repo,
                ticket = %ticket,
                label = %label,
                "Running label already present, not claiming"
            );
            return Ok(Claim::AlreadyHeld);
        }

        self.adapter.add_label(repo, ticket, label.as_str()).await?;

        // The decisive re-read: whoever the platform credits with the label
        // owns the stage.
        let author = self
            .adapter
            .last_label_actor(repo, ticket, label.as_str())
            .await?;

        match author {
            Some(actor) if actor == self.self_actor => {
                debug!(repo = %repo, ticket = %ticket, label = %label, "Claim won");
                Ok(Claim::Won)
            }
            other => {
                // Do NOT remove the label: the winner owns it now.
                info!(
                    repo = %repo,
                    ticket = %ticket,
                    label = %label,
                    winner = other.as_deref().unwrap_or("<unknown>"),
                    "Lost label race, aborting claim"
                );
                Ok(Claim::Lost { winner: other })
            }
        }
    }

    /// Releases the running label after a terminal workflow outcome.
    ///
    /// Success adds the stage's ready label (if any) before removing the
    /// running label; failure adds the failure label (if any); cancellation
    /// only removes. The removal is last so observers never see a completed
    /// stage without its outcome label.
    pub async fn release(
        &self,
        repo: &RepoId,
        ticket: TicketId,
        stage: Stage,
        outcome: RunOutcome,
    ) -> Result<(), AdapterError> {
        let outcome_label = match outcome {
            RunOutcome::Success => stage.ready_label(),
            RunOutcome::Failure => stage.failure_label(),
            RunOutcome::Cancelled => None,
        };

        if let Some(label) = outcome_label {
            self.adapter.add_label(repo, ticket, label.as_str()).await?;
        }

        self.adapter
            .remove_label(repo, ticket, stage.running_label().as_str())
            .await?;

        debug!(
            repo = %repo,
            ticket = %ticket,
            stage = %stage,
            outcome = outcome.as_str(),
            "Released running label"
        );
        Ok(())
    }

    /// Strips a stale running label, but only when this daemon authored it.
    ///
    /// A label owned by another actor (or whose author cannot be determined)
    /// is left untouched: someone else may legitimately hold the stage.
    /// Returns true when the label was removed.
    pub async fn sweep_stale(
        &self,
        repo: &RepoId,
        ticket: TicketId,
        label: crate::labels::Label,
    ) -> Result<bool, AdapterError> {
        let author = self
            .adapter
            .last_label_actor(repo, ticket, label.as_str())
            .await?;

        match author.as_deref() {
            Some(actor) if actor == self.self_actor => {
                info!(
                    repo = %repo,
                    ticket = %ticket,
                    label = %label,
                    "Removing stale running label left by this daemon"
                );
                self.adapter
                    .remove_label(repo, ticket, label.as_str())
                    .await?;
                Ok(true)
            }
            Some(actor) => {
                debug!(
                    repo = %repo,
                    ticket = %ticket,
                    label = %label,
                    owner = actor,
                    "Running label owned by another actor, leaving it"
                );
                Ok(false)
            }
            None => {
                warn!(
                    repo = %repo,
                    ticket = %ticket,
                    label = %label,
                    "Cannot determine running label author, leaving it"
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Label;
    use crate::test_utils::MockAdapter;

    fn repo() -> RepoId {
        RepoId::parse("github.com/acme/widgets").unwrap()
    }

    fn guard(adapter: Arc<MockAdapter>) -> RaceGuard {
        RaceGuard::new(adapter, "kiln-bot")
    }

    #[tokio::test]
    async fn claim_wins_when_author_is_self() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        let claim = guard(adapter.clone())
            .claim(&repo(), TicketId(1), Stage::Research)
            .await
            .unwrap();

        assert_eq!(claim, Claim::Won);
        assert!(
            adapter
                .ticket_labels(&repo(), TicketId(1))
                .contains("researching")
        );
    }

    #[tokio::test]
    async fn claim_aborts_when_label_already_present() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["researching"]);

        let claim = guard(adapter.clone())
            .claim(&repo(), TicketId(1), Stage::Research)
            .await
            .unwrap();

        assert_eq!(claim, Claim::AlreadyHeld);
        assert!(adapter.label_adds().is_empty());
    }

    #[tokio::test]
    async fn lost_race_does_not_remove_label() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        // The platform attributes the add to the other instance.
        adapter.set_label_actor(&repo(), TicketId(1), "researching", "instance-b");

        let claim = guard(adapter.clone())
            .claim(&repo(), TicketId(1), Stage::Research)
            .await
            .unwrap();

        assert_eq!(
            claim,
            Claim::Lost {
                winner: Some("instance-b".to_string())
            }
        );
        // The label stays: the winner owns it.
        assert!(
            adapter
                .ticket_labels(&repo(), TicketId(1))
                .contains("researching")
        );
        assert!(adapter.label_removes().is_empty());
    }

    #[tokio::test]
    async fn release_success_adds_ready_then_removes_running() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["researching"]);

        guard(adapter.clone())
            .release(&repo(), TicketId(1), Stage::Research, RunOutcome::Success)
            .await
            .unwrap();

        let labels = adapter.ticket_labels(&repo(), TicketId(1));
        assert!(labels.contains("research_ready"));
        assert!(!labels.contains("researching"));
        // Outcome label lands before the removal commit-point.
        assert_eq!(adapter.label_adds(), vec!["research_ready".to_string()]);
    }

    #[tokio::test]
    async fn release_failure_applies_failure_label() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["implementing"]);

        guard(adapter.clone())
            .release(&repo(), TicketId(1), Stage::Implement, RunOutcome::Failure)
            .await
            .unwrap();

        let labels = adapter.ticket_labels(&repo(), TicketId(1));
        assert!(labels.contains("implementation_failed"));
        assert!(!labels.contains("implementing"));
    }

    #[tokio::test]
    async fn release_cancelled_only_removes_running() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["planning"]);

        guard(adapter.clone())
            .release(&repo(), TicketId(1), Stage::Plan, RunOutcome::Cancelled)
            .await
            .unwrap();

        let labels = adapter.ticket_labels(&repo(), TicketId(1));
        assert!(!labels.contains("planning"));
        assert!(adapter.label_adds().is_empty());
    }

    #[tokio::test]
    async fn plan_failure_has_no_failure_label() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["planning"]);

        guard(adapter.clone())
            .release(&repo(), TicketId(1), Stage::Plan, RunOutcome::Failure)
            .await
            .unwrap();

        assert!(adapter.label_adds().is_empty());
        assert!(!adapter.ticket_labels(&repo(), TicketId(1)).contains("planning"));
    }

    #[tokio::test]
    async fn sweep_removes_own_stale_label() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["researching"]);
        adapter.set_label_actor(&repo(), TicketId(1), "researching", "kiln-bot");

        let removed = guard(adapter.clone())
            .sweep_stale(&repo(), TicketId(1), Label::Researching)
            .await
            .unwrap();

        assert!(removed);
        assert!(
            !adapter
                .ticket_labels(&repo(), TicketId(1))
                .contains("researching")
        );
    }

    #[tokio::test]
    async fn sweep_leaves_foreign_label() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["researching"]);
        adapter.set_label_actor(&repo(), TicketId(1), "researching", "someone-else");

        let removed = guard(adapter.clone())
            .sweep_stale(&repo(), TicketId(1), Label::Researching)
            .await
            .unwrap();

        assert!(!removed);
        assert!(
            adapter
                .ticket_labels(&repo(), TicketId(1))
                .contains("researching")
        );
    }

    #[tokio::test]
    async fn sweep_leaves_label_with_unknown_author() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        adapter.seed_labels(&repo(), TicketId(1), &["researching"]);
        adapter.clear_label_actor(&repo(), TicketId(1), "researching");

        let removed = guard(adapter.clone())
            .sweep_stale(&repo(), TicketId(1), Label::Researching)
            .await
            .unwrap();

        assert!(!removed);
    }
}
