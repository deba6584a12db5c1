//! Board item snapshots and related value types.
//!
//! An [`Item`] is one row of a project board as observed during a single poll
//! cycle. Items are transient: they are rebuilt from the adapter on every
//! cycle and never stored between cycles (the store keeps only comment
//! cursors and run history). The authoritative state lives on the remote
//! board.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::ids::{CommentId, ItemNodeId, RepoId, RunKey, TicketId};
use crate::labels::Label;

/// Open/closed state of the underlying issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    Open,
    Closed,
}

impl ItemState {
    /// Parses the GraphQL issue state string (`OPEN` / `CLOSED`).
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("closed") {
            ItemState::Closed
        } else {
            ItemState::Open
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, ItemState::Closed)
    }
}

/// A board status column.
///
/// The pipeline statuses are modelled explicitly; anything else is carried
/// through as [`Status::Other`] and never modified by the daemon. An item
/// whose Status field is unset surfaces as [`Status::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Backlog,
    Prepare,
    Research,
    Plan,
    Implement,
    Validate,
    Done,
    /// The board item has no Status field value.
    Unknown,
    /// A custom column this daemon does not manage (passed through untouched).
    Other(String),
}

impl Status {
    /// Parses a status column name. Never fails; unrecognized names become
    /// [`Status::Other`].
    pub fn parse(s: &str) -> Self {
        match s {
            "Backlog" => Status::Backlog,
            "Prepare" => Status::Prepare,
            "Research" => Status::Research,
            "Plan" => Status::Plan,
            "Implement" => Status::Implement,
            "Validate" => Status::Validate,
            "Done" => Status::Done,
            "Unknown" => Status::Unknown,
            other => Status::Other(other.to_string()),
        }
    }

    /// The column name as it appears on the board.
    pub fn as_str(&self) -> &str {
        match self {
            Status::Backlog => "Backlog",
            Status::Prepare => "Prepare",
            Status::Research => "Research",
            Status::Plan => "Plan",
            Status::Implement => "Implement",
            Status::Validate => "Validate",
            Status::Done => "Done",
            Status::Unknown => "Unknown",
            Status::Other(s) => s,
        }
    }

    /// Returns true for the statuses this daemon understands (including
    /// Backlog and Done, which gate cleanup and reset but run no workflows).
    pub fn is_known(&self) -> bool {
        !matches!(self, Status::Unknown | Status::Other(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One board row, snapshotted at poll time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Board item node ID, used for status mutations and archival.
    pub node_id: ItemNodeId,
    /// URL of the board this item was fetched from.
    pub board_url: String,
    pub repo: RepoId,
    pub ticket: TicketId,
    pub title: String,
    pub status: Status,
    /// All label names currently on the issue (kiln and otherwise).
    pub labels: BTreeSet<String>,
    pub state: ItemState,
    /// True when any linked pull request has been merged.
    pub has_merged_changes: bool,
    /// Total comment count as reported by the board query.
    pub comment_count: u64,
}

impl Item {
    /// The run key identifying this item for the runner pool.
    pub fn run_key(&self) -> RunKey {
        RunKey::new(self.repo.clone(), self.ticket)
    }

    /// A short identifier for log messages, e.g. `github.com/owner/repo#42`.
    pub fn context_key(&self) -> String {
        format!("{}{}", self.repo, self.ticket)
    }

    pub fn has_label(&self, label: Label) -> bool {
        self.labels.contains(label.as_str())
    }

    /// All kiln running labels currently on the item, in canonical order.
    pub fn running_labels(&self) -> Vec<Label> {
        Label::ALL
            .iter()
            .copied()
            .filter(|l| l.is_running() && self.has_label(*l))
            .collect()
    }
}

/// The reaction kinds the daemon uses as comment processing markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reaction {
    /// "Being processed" marker.
    Eyes,
    /// "Processed" marker.
    PlusOne,
}

impl Reaction {
    pub fn as_str(self) -> &'static str {
        match self {
            Reaction::Eyes => "eyes",
            Reaction::PlusOne => "+1",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eyes" | "EYES" => Some(Reaction::Eyes),
            "+1" | "THUMBS_UP" => Some(Reaction::PlusOne),
            _ => None,
        }
    }
}

/// An issue comment as returned by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: CommentId,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// Reactions present on the comment from any actor. Only the marker
    /// kinds are retained; everything else is dropped at parse time.
    pub reactions: BTreeSet<Reaction>,
}

impl Comment {
    pub fn has_reaction(&self, kind: Reaction) -> bool {
        self.reactions.contains(&kind)
    }
}

/// A pull request linked to close an issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedPullRequest {
    pub number: u64,
    pub url: String,
    /// `OPEN`, `CLOSED` or `MERGED`.
    pub state: String,
    pub merged: bool,
    /// Head branch name, when the query exposes it.
    pub head_ref: Option<String>,
}

impl LinkedPullRequest {
    pub fn is_open(&self) -> bool {
        self.state.eq_ignore_ascii_case("open")
    }
}
