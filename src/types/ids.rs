//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a
//! CommentId where a TicketId is expected) and make the code more
//! self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when parsing an invalid repository identifier.
#[derive(Debug, Clone, Error)]
#[error("invalid repository: expected host/owner/repo, got {input:?}")]
pub struct InvalidRepoId {
    input: String,
}

/// A repository identifier in `host/owner/repo` form.
///
/// The hostname is part of the identity so that items from github.com and a
/// GitHub Enterprise instance on the same board are never conflated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub host: String,
    pub owner: String,
    pub repo: String,
}

impl RepoId {
    pub fn new(
        host: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Self {
        RepoId {
            host: host.into(),
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Parses a `host/owner/repo` string.
    pub fn parse(s: &str) -> Result<Self, InvalidRepoId> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(owner), Some(repo))
                if !host.is_empty() && !owner.is_empty() && !repo.is_empty() =>
            {
                Ok(RepoId::new(host, owner, repo))
            }
            _ => Err(InvalidRepoId {
                input: s.to_string(),
            }),
        }
    }

    /// Returns the `owner/repo` part without the hostname.
    pub fn name_with_owner(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.host, self.owner, self.repo)
    }
}

/// An issue (ticket) number within a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub u64);

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for TicketId {
    fn from(n: u64) -> Self {
        TicketId(n)
    }
}

/// The opaque node ID of a project board item (e.g. `PVTI_...`).
///
/// Status mutations and archival address the board item, not the issue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemNodeId(pub String);

impl ItemNodeId {
    pub fn new(s: impl Into<String>) -> Self {
        ItemNodeId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An issue comment ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(pub u64);

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CommentId {
    fn from(n: u64) -> Self {
        CommentId(n)
    }
}

/// Identity of one in-flight workflow: the `(repo, ticket)` pair.
///
/// At most one workflow may be active per key in this instance; the stage
/// (and therefore the running label) lives on the run record, not the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub repo: RepoId,
    pub ticket: TicketId,
}

impl RunKey {
    pub fn new(repo: RepoId, ticket: TicketId) -> Self {
        RunKey { repo, ticket }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.repo, self.ticket)
    }
}
