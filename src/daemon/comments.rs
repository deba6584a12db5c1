//! Comment iteration: reacting to user feedback on generated content.
//!
//! While an item sits in Research or Plan, new comments from the allowed
//! user are treated as edit requests against the generated section. The
//! reactor finds the oldest actionable comment past the stored cursor;
//! the poller then claims the `editing` label and dispatches an edit
//! workflow carrying the comment.
//!
//! Reaction markers coordinate processing across instances and cycles:
//! `eyes` means a comment is being processed (set before dispatch, cleared
//! on failure), `+1` means it has been processed. Both are filtered out
//! when selecting the next candidate, as are the daemon's own comments and
//! comments from anyone but the allowed user. The cursor only advances
//! after a successful edit, so failures retry idempotently.

use std::sync::Arc;

use tracing::debug;

use crate::store::Store;
use crate::ticket::{AdapterError, TicketAdapter};
use crate::types::{Comment, Item, Reaction, Status};

/// Selects actionable comments and manages their processing markers.
pub struct CommentReactor {
    adapter: Arc<dyn TicketAdapter>,
    store: Arc<dyn Store>,
    /// Comments from this login are edit requests.
    allowed_username: String,
    /// The daemon's own login; its comments are never actionable.
    self_username: String,
}

impl CommentReactor {
    pub fn new(
        adapter: Arc<dyn TicketAdapter>,
        store: Arc<dyn Store>,
        allowed_username: impl Into<String>,
        self_username: impl Into<String>,
    ) -> Self {
        CommentReactor {
            adapter,
            store,
            allowed_username: allowed_username.into(),
            self_username: self_username.into(),
        }
    }

    /// The oldest actionable comment newer than the cursor, if any.
    ///
    /// Cheap gate first: only Research/Plan items with a nonzero comment
    /// count warrant a fetch. Comment iteration is deliberately disabled
    /// for Implement and beyond.
    pub async fn next_actionable(&self, item: &Item) -> Result<Option<Comment>, AdapterError> {
        if !matches!(item.status, Status::Research | Status::Plan) || item.comment_count == 0 {
            return Ok(None);
        }

        let since = self
            .store
            .last_comment_at(&item.repo, item.ticket)
            .unwrap_or_default();

        let comments = self
            .adapter
            .list_comments_since(&item.repo, item.ticket, since)
            .await?;

        let actionable = comments.into_iter().find(|c| self.is_actionable(c));
        if let Some(comment) = &actionable {
            debug!(
                context = item.context_key(),
                comment = %comment.id,
                author = %comment.author,
                "Found actionable comment"
            );
        }
        Ok(actionable)
    }

    fn is_actionable(&self, comment: &Comment) -> bool {
        if comment.author == self.self_username {
            return false;
        }
        if comment.author != self.allowed_username {
            return false;
        }
        // Already being processed (possibly by another instance) or done.
        if comment.has_reaction(Reaction::Eyes) || comment.has_reaction(Reaction::PlusOne) {
            return false;
        }
        true
    }

    /// Marks a comment as being processed before its edit workflow starts.
    pub async fn mark_processing(
        &self,
        item: &Item,
        comment: &Comment,
    ) -> Result<(), AdapterError> {
        self.adapter
            .set_reaction(&item.repo, comment.id, Reaction::Eyes)
            .await
    }

    /// Clears the being-processed marker after a dispatch that never ran
    /// (claim lost, pool full). Outcome-side clearing is the runner pool's
    /// job.
    pub async fn clear_processing(
        &self,
        item: &Item,
        comment: &Comment,
    ) -> Result<(), AdapterError> {
        self.adapter
            .remove_reaction(&item.repo, comment.id, Reaction::Eyes)
            .await
    }
}
