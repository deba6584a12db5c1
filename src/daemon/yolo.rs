//! Autonomous progression: the yolo controller.
//!
//! When an item carries both its stage's ready label and the `yolo` control
//! label, the item is advanced to the next status column without waiting for
//! a human. The advance holds no running label; the next poll cycle simply
//! re-evaluates the item in its new column and triggers the next stage
//! normally.
//!
//! Two guards run before the status mutation: the item's labels are
//! re-fetched (the poll snapshot may be stale and the user may have pulled
//! `yolo` off in the meantime), and the actor who applied `yolo` must be
//! authorized.

use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::ActorPolicy;
use crate::labels::Label;
use crate::ticket::{AdapterError, Board, TicketAdapter};
use crate::types::{Item, Status};

/// Advances ready items that carry the `yolo` label.
pub struct YoloController {
    adapter: Arc<dyn TicketAdapter>,
    actors: ActorPolicy,
}

impl YoloController {
    pub fn new(adapter: Arc<dyn TicketAdapter>, actors: ActorPolicy) -> Self {
        YoloController { adapter, actors }
    }

    /// Attempts the advance. Returns true when the status was changed.
    ///
    /// Adapter failures during the mutation surface as `yolo_failed` on the
    /// ticket; failures applying that label are only logged.
    pub async fn advance(
        &self,
        board: &Board,
        item: &Item,
        next: &Status,
    ) -> Result<bool, AdapterError> {
        // Freshness check: the snapshot may predate a user removing yolo.
        let labels = self
            .adapter
            .get_ticket_labels(&item.repo, item.ticket)
            .await?;
        if !labels.contains(Label::Yolo.as_str()) {
            info!(
                context = item.context_key(),
                "Yolo label removed since poll, skipping advance"
            );
            return Ok(false);
        }

        // Only an authorized actor's yolo is honoured.
        let actor = self
            .adapter
            .last_label_actor(&item.repo, item.ticket, Label::Yolo.as_str())
            .await?;
        if !self
            .actors
            .check_allowed(actor.as_deref(), &item.context_key(), "yolo")
        {
            return Ok(false);
        }

        match self
            .adapter
            .set_status(board, &item.node_id, next.as_str())
            .await
        {
            Ok(()) => {
                info!(
                    context = item.context_key(),
                    from = %item.status,
                    to = %next,
                    "Yolo advanced item"
                );
                Ok(true)
            }
            Err(e) => {
                warn!(
                    context = item.context_key(),
                    error = %e,
                    "Yolo advance failed, applying yolo_failed"
                );
                if let Err(label_err) = self
                    .adapter
                    .add_label(&item.repo, item.ticket, Label::YoloFailed.as_str())
                    .await
                {
                    warn!(
                        context = item.context_key(),
                        error = %label_err,
                        "Failed to apply yolo_failed label"
                    );
                }
                Ok(false)
            }
        }
    }
}
