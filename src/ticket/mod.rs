//! The ticket platform capability.
//!
//! The core depends only on the [`TicketAdapter`] trait, never on a concrete
//! provider. The adapter is responsible for pagination, for mapping transport
//! and authentication failures into the typed error taxonomy, and for
//! returning comments strictly newer than a supplied timestamp. Label
//! addition and removal are idempotent at the platform.

pub mod error;
pub mod github;
pub mod retry;

pub use error::{AdapterError, AdapterErrorKind};
pub use github::GitHubAdapter;
pub use retry::RetryConfig;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{
    Comment, CommentId, Item, ItemNodeId, LinkedPullRequest, Reaction, RepoId, TicketId,
};

/// Error returned when parsing an invalid board URL.
#[derive(Debug, Clone, Error)]
#[error("invalid project board URL: {input:?}")]
pub struct InvalidBoardUrl {
    input: String,
}

/// Whether a board belongs to an organization or a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardOwner {
    Organization,
    User,
}

impl BoardOwner {
    /// The GraphQL root field for this owner type.
    pub fn graphql_field(self) -> &'static str {
        match self {
            BoardOwner::Organization => "organization",
            BoardOwner::User => "user",
        }
    }
}

/// A project board, parsed from its URL.
///
/// Accepted forms:
/// `https://<host>/orgs/<login>/projects/<number>` and
/// `https://<host>/users/<login>/projects/<number>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    pub host: String,
    pub owner: BoardOwner,
    pub login: String,
    pub number: u64,
    pub url: String,
}

impl Board {
    pub fn parse(url: &str) -> Result<Self, InvalidBoardUrl> {
        let invalid = || InvalidBoardUrl {
            input: url.to_string(),
        };

        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(invalid)?;

        let mut parts = rest.trim_end_matches('/').split('/');
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let owner = match parts.next() {
            Some("orgs") => BoardOwner::Organization,
            Some("users") => BoardOwner::User,
            _ => return Err(invalid()),
        };
        let login = parts.next().filter(|l| !l.is_empty()).ok_or_else(invalid)?;
        if parts.next() != Some("projects") {
            return Err(invalid());
        }
        let number = parts
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Board {
            host: host.to_string(),
            owner,
            login: login.to_string(),
            number,
            url: url.to_string(),
        })
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Operations the core requires from a ticket platform.
///
/// Implementations must be thread-safe at the request level; the core may
/// issue calls concurrently from the poller and from running workflows.
#[async_trait]
pub trait TicketAdapter: Send + Sync {
    /// The login this adapter authenticates as. Used for race-claim
    /// authorship verification and self-comment filtering.
    async fn authenticated_actor(&self) -> Result<String, AdapterError>;

    /// All items on the board, fully paginated.
    async fn list_items(&self, board: &Board) -> Result<Vec<Item>, AdapterError>;

    async fn get_body(&self, repo: &RepoId, id: TicketId) -> Result<String, AdapterError>;

    async fn update_body(
        &self,
        repo: &RepoId,
        id: TicketId,
        body: &str,
    ) -> Result<(), AdapterError>;

    /// The current label names on a ticket.
    async fn get_ticket_labels(
        &self,
        repo: &RepoId,
        id: TicketId,
    ) -> Result<BTreeSet<String>, AdapterError>;

    /// Adds a label. Idempotent: adding a present label succeeds.
    async fn add_label(&self, repo: &RepoId, id: TicketId, label: &str)
    -> Result<(), AdapterError>;

    /// Removes a label. Idempotent: removing an absent label succeeds.
    async fn remove_label(
        &self,
        repo: &RepoId,
        id: TicketId,
        label: &str,
    ) -> Result<(), AdapterError>;

    /// Names of the labels defined on the repository.
    async fn list_labels(&self, repo: &RepoId) -> Result<Vec<String>, AdapterError>;

    /// Creates a repository label. Returns false if it already existed.
    async fn create_label(
        &self,
        repo: &RepoId,
        name: &str,
        description: &str,
        color: &str,
    ) -> Result<bool, AdapterError>;

    /// Moves a board item to a status column.
    async fn set_status(
        &self,
        board: &Board,
        item: &ItemNodeId,
        status: &str,
    ) -> Result<(), AdapterError>;

    /// Archives a board item. Returns false if it was already archived.
    async fn archive(&self, board: &Board, item: &ItemNodeId) -> Result<bool, AdapterError>;

    /// Comments strictly newer than `since`, oldest first. A `None` cursor
    /// returns every comment.
    async fn list_comments_since(
        &self,
        repo: &RepoId,
        id: TicketId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Comment>, AdapterError>;

    async fn add_comment(
        &self,
        repo: &RepoId,
        id: TicketId,
        body: &str,
    ) -> Result<Comment, AdapterError>;

    /// Adds a reaction marker to a comment. Idempotent.
    async fn set_reaction(
        &self,
        repo: &RepoId,
        comment: CommentId,
        kind: Reaction,
    ) -> Result<(), AdapterError>;

    /// Removes this actor's reaction marker from a comment. Idempotent.
    async fn remove_reaction(
        &self,
        repo: &RepoId,
        comment: CommentId,
        kind: Reaction,
    ) -> Result<(), AdapterError>;

    /// The actor who last changed the item's status column, if determinable.
    async fn last_status_actor(
        &self,
        repo: &RepoId,
        id: TicketId,
    ) -> Result<Option<String>, AdapterError>;

    /// The actor who last added the given label, if determinable.
    async fn last_label_actor(
        &self,
        repo: &RepoId,
        id: TicketId,
        label: &str,
    ) -> Result<Option<String>, AdapterError>;

    /// Pull requests linked to close this ticket.
    async fn list_linked_prs(
        &self,
        repo: &RepoId,
        id: TicketId,
    ) -> Result<Vec<LinkedPullRequest>, AdapterError>;

    /// Closes a pull request, optionally deleting its head branch.
    async fn close_pull_request(
        &self,
        repo: &RepoId,
        number: u64,
        delete_branch: bool,
    ) -> Result<(), AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_parse_org_url() {
        let board = Board::parse("https://github.com/orgs/acme/projects/7").unwrap();
        assert_eq!(board.host, "github.com");
        assert_eq!(board.owner, BoardOwner::Organization);
        assert_eq!(board.login, "acme");
        assert_eq!(board.number, 7);
    }

    #[test]
    fn board_parse_user_url() {
        let board = Board::parse("https://ghes.corp.example/users/alice/projects/12").unwrap();
        assert_eq!(board.host, "ghes.corp.example");
        assert_eq!(board.owner, BoardOwner::User);
        assert_eq!(board.login, "alice");
        assert_eq!(board.number, 12);
    }

    #[test]
    fn board_parse_tolerates_trailing_slash() {
        let board = Board::parse("https://github.com/orgs/acme/projects/7/").unwrap();
        assert_eq!(board.number, 7);
    }

    #[test]
    fn board_parse_rejects_garbage() {
        assert!(Board::parse("github.com/orgs/acme/projects/7").is_err());
        assert!(Board::parse("https://github.com/acme/projects/7").is_err());
        assert!(Board::parse("https://github.com/orgs/acme/projects/x").is_err());
        assert!(Board::parse("https://github.com/orgs/acme/issues/7").is_err());
    }
}
