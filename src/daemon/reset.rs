//! The reset controller: wipe generated content and return to Backlog.
//!
//! Observing the `reset` control label triggers a full unwind of everything
//! kiln produced for an item: open linked PRs are closed and their branches
//! deleted, the generated body sections are removed, every kiln label is
//! stripped, and the item moves back to Backlog.
//!
//! The wipe is destructive, so the actor who applied `reset` must be
//! authorized before anything else happens. A known but disallowed actor has
//! only the `reset` label removed (so the warning does not repeat every
//! cycle); an undeterminable actor leaves the label in place and mutates
//! nothing, keeping the security warning visible.
//!
//! Each step is best-effort, but `reset` itself is removed **last** and only
//! after the critical steps succeeded. A partial failure therefore leaves
//! `reset` in place and the next poll cycle re-enters the handler.

use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::ActorPolicy;
use crate::body;
use crate::labels::Label;
use crate::ticket::{AdapterError, Board, TicketAdapter};
use crate::types::{Item, Status};

/// Unwinds kiln state for items carrying the `reset` label.
pub struct ResetController {
    adapter: Arc<dyn TicketAdapter>,
    actors: ActorPolicy,
}

impl ResetController {
    pub fn new(adapter: Arc<dyn TicketAdapter>, actors: ActorPolicy) -> Self {
        ResetController { adapter, actors }
    }

    /// Runs the reset sequence. Returns true when the reset completed and
    /// the `reset` label was removed.
    pub async fn reset(&self, board: &Board, item: &Item) -> Result<bool, AdapterError> {
        // Only an authorized actor's reset is honoured.
        let actor = self
            .adapter
            .last_label_actor(&item.repo, item.ticket, Label::Reset.as_str())
            .await?;
        if !self
            .actors
            .check_allowed(actor.as_deref(), &item.context_key(), "reset")
        {
            // A known actor's label comes off so the warning does not repeat;
            // an unknown actor's label stays for the audit trail.
            if actor.is_some() {
                self.adapter
                    .remove_label(&item.repo, item.ticket, Label::Reset.as_str())
                    .await?;
            }
            return Ok(false);
        }

        info!(context = item.context_key(), "Resetting item");
        let mut complete = true;

        // Close open linked PRs and delete their branches. Purely
        // best-effort: a PR that cannot be closed does not block the rest.
        match self.adapter.list_linked_prs(&item.repo, item.ticket).await {
            Ok(prs) => {
                for pr in prs.iter().filter(|pr| pr.is_open()) {
                    if let Err(e) = self
                        .adapter
                        .close_pull_request(&item.repo, pr.number, true)
                        .await
                    {
                        warn!(
                            context = item.context_key(),
                            pr = pr.number,
                            error = %e,
                            "Failed to close linked PR during reset"
                        );
                    }
                }
            }
            Err(e) => {
                warn!(
                    context = item.context_key(),
                    error = %e,
                    "Failed to list linked PRs during reset"
                );
            }
        }

        // Remove the generated body sections, preserving everything else.
        match self.adapter.get_body(&item.repo, item.ticket).await {
            Ok(old_body) => {
                let new_body = body::strip_sections(&old_body);
                if new_body != old_body
                    && let Err(e) = self
                        .adapter
                        .update_body(&item.repo, item.ticket, &new_body)
                        .await
                {
                    warn!(
                        context = item.context_key(),
                        error = %e,
                        "Failed to strip generated sections during reset"
                    );
                    complete = false;
                }
            }
            Err(e) => {
                warn!(
                    context = item.context_key(),
                    error = %e,
                    "Failed to read body during reset"
                );
                complete = false;
            }
        }

        // Strip every kiln label except `reset` itself.
        for label in Label::ALL {
            if label == Label::Reset {
                continue;
            }
            if let Err(e) = self
                .adapter
                .remove_label(&item.repo, item.ticket, label.as_str())
                .await
            {
                warn!(
                    context = item.context_key(),
                    label = %label,
                    error = %e,
                    "Failed to remove label during reset"
                );
                complete = false;
            }
        }

        // Back to the start of the pipeline.
        if let Err(e) = self
            .adapter
            .set_status(board, &item.node_id, Status::Backlog.as_str())
            .await
        {
            warn!(
                context = item.context_key(),
                error = %e,
                "Failed to move item to Backlog during reset"
            );
            complete = false;
        }

        // `reset` comes off last so partial failures re-enter the handler.
        if complete {
            self.adapter
                .remove_label(&item.repo, item.ticket, Label::Reset.as_str())
                .await?;
            info!(context = item.context_key(), "Reset complete");
        } else {
            warn!(
                context = item.context_key(),
                "Reset incomplete, leaving reset label for retry"
            );
        }

        Ok(complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockAdapter, item_in, with_labels};
    use crate::ticket::AdapterErrorKind;
    use crate::types::{LinkedPullRequest, RepoId, TicketId};

    fn board() -> Board {
        Board::parse("https://github.com/orgs/acme/projects/1").unwrap()
    }

    fn repo() -> RepoId {
        RepoId::parse("github.com/acme/widgets").unwrap()
    }

    fn actors() -> ActorPolicy {
        ActorPolicy {
            allowed_username: "alice".to_string(),
            self_username: "kiln-bot".to_string(),
            team_usernames: vec![],
            allow_others: false,
        }
    }

    /// Attributes the `reset` label to the allowed user.
    fn authorize_reset(adapter: &MockAdapter) {
        adapter.set_label_actor(&repo(), TicketId(42), "reset", "alice");
    }

    const EVERY_KILN_LABEL: [&str; 6] = [
        "researching",
        "research_ready",
        "plan_ready",
        "yolo",
        "yolo_failed",
        "reset",
    ];

    #[tokio::test]
    async fn reset_wipes_body_labels_and_status() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        let item = with_labels(item_in(Status::Plan), &EVERY_KILN_LABEL);
        adapter.seed_labels(&repo(), TicketId(42), &EVERY_KILN_LABEL);
        authorize_reset(&adapter);
        adapter.seed_body(
            &repo(),
            TicketId(42),
            "preamble\n<!-- kiln:research -->XYZ<!-- /kiln:research -->\npostamble",
        );

        let controller = ResetController::new(adapter.clone(), actors());
        let complete = controller.reset(&board(), &item).await.unwrap();

        assert!(complete);
        assert_eq!(
            adapter.body_of(&repo(), TicketId(42)).unwrap(),
            "preamble\n\npostamble"
        );
        assert!(adapter.ticket_labels(&repo(), TicketId(42)).is_empty());
        let updates = adapter.status_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1, "Backlog");
    }

    #[tokio::test]
    async fn reset_removes_reset_label_last() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        let item = with_labels(item_in(Status::Plan), &["researching", "reset"]);
        adapter.seed_labels(&repo(), TicketId(42), &["researching", "reset"]);
        authorize_reset(&adapter);

        let controller = ResetController::new(adapter.clone(), actors());
        controller.reset(&board(), &item).await.unwrap();

        let removes = adapter.label_removes();
        assert_eq!(removes.last().map(String::as_str), Some("reset"));
    }

    #[tokio::test]
    async fn reset_closes_open_prs_and_deletes_branches() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        let item = with_labels(item_in(Status::Implement), &["reset"]);
        adapter.seed_labels(&repo(), TicketId(42), &["reset"]);
        authorize_reset(&adapter);
        adapter.seed_linked_prs(
            &repo(),
            TicketId(42),
            vec![
                LinkedPullRequest {
                    number: 10,
                    url: "https://github.com/acme/widgets/pull/10".to_string(),
                    state: "OPEN".to_string(),
                    merged: false,
                    head_ref: Some("kiln/issue-42".to_string()),
                },
                LinkedPullRequest {
                    number: 8,
                    url: "https://github.com/acme/widgets/pull/8".to_string(),
                    state: "MERGED".to_string(),
                    merged: true,
                    head_ref: None,
                },
            ],
        );

        let controller = ResetController::new(adapter.clone(), actors());
        controller.reset(&board(), &item).await.unwrap();

        // Only the open PR is closed, with branch deletion.
        assert_eq!(adapter.closed_prs(), vec![(repo(), 10, true)]);
    }

    #[tokio::test]
    async fn failed_step_keeps_reset_label() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        let item = with_labels(item_in(Status::Plan), &["reset"]);
        adapter.seed_labels(&repo(), TicketId(42), &["reset"]);
        authorize_reset(&adapter);
        adapter.fail_set_status(AdapterErrorKind::Transient);

        let controller = ResetController::new(adapter.clone(), actors());
        let complete = controller.reset(&board(), &item).await.unwrap();

        assert!(!complete);
        // The reset label survives so the next cycle retries.
        assert!(adapter.ticket_labels(&repo(), TicketId(42)).contains("reset"));
    }

    #[tokio::test]
    async fn reset_without_kiln_body_leaves_body_untouched() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        let item = with_labels(item_in(Status::Plan), &["reset"]);
        adapter.seed_labels(&repo(), TicketId(42), &["reset"]);
        authorize_reset(&adapter);
        adapter.seed_body(&repo(), TicketId(42), "human-written description");

        let controller = ResetController::new(adapter.clone(), actors());
        controller.reset(&board(), &item).await.unwrap();

        assert_eq!(
            adapter.body_of(&repo(), TicketId(42)).unwrap(),
            "human-written description"
        );
    }

    #[tokio::test]
    async fn blocked_actor_removes_only_reset_label() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        let item = with_labels(item_in(Status::Research), &["reset", "research_ready"]);
        adapter.seed_labels(&repo(), TicketId(42), &["reset", "research_ready"]);
        adapter.set_label_actor(&repo(), TicketId(42), "reset", "mallory");
        adapter.seed_body(
            &repo(),
            TicketId(42),
            "text\n<!-- kiln:research -->XYZ<!-- /kiln:research -->",
        );

        let controller = ResetController::new(adapter.clone(), actors());
        let complete = controller.reset(&board(), &item).await.unwrap();

        assert!(!complete);
        // The label comes off so the warning does not repeat; nothing else
        // is touched.
        assert_eq!(adapter.label_removes(), vec!["reset".to_string()]);
        let labels = adapter.ticket_labels(&repo(), TicketId(42));
        assert!(labels.contains("research_ready"));
        assert!(adapter.status_updates().is_empty());
        assert!(
            adapter
                .body_of(&repo(), TicketId(42))
                .unwrap()
                .contains("kiln:research")
        );
    }

    #[tokio::test]
    async fn unknown_actor_leaves_reset_in_place() {
        let adapter = Arc::new(MockAdapter::new("kiln-bot"));
        let item = with_labels(item_in(Status::Research), &["reset", "research_ready"]);
        adapter.seed_labels(&repo(), TicketId(42), &["reset", "research_ready"]);
        adapter.clear_label_actor(&repo(), TicketId(42), "reset");

        let controller = ResetController::new(adapter.clone(), actors());
        let complete = controller.reset(&board(), &item).await.unwrap();

        assert!(!complete);
        // No mutation at all: the label stays visible for the audit trail.
        assert!(adapter.label_removes().is_empty());
        let labels = adapter.ticket_labels(&repo(), TicketId(42));
        assert!(labels.contains("reset"));
        assert!(labels.contains("research_ready"));
        assert!(adapter.status_updates().is_empty());
    }
}
