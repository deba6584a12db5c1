//! The workflow execution capability.
//!
//! A workflow executor runs one stage for one item and reports the outcome.
//! Executions are long-running (minutes to tens of minutes) and must honour
//! cancellation: the runner pool cancels the token on stall or shutdown and
//! then waits for the executor to return.

pub mod agent;

pub use agent::AgentCliExecutor;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::body::Section;
use crate::labels::Stage;
use crate::types::{Comment, RepoId, TicketId};

/// Errors from the execution layer itself (spawn failures, I/O).
///
/// A workflow that ran and failed is not an error; that is
/// [`ExecutionStatus::Failure`].
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn executor: {0}")]
    Spawn(std::io::Error),

    #[error("executor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a workflow execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Failure,
    Cancelled,
}

/// The result of one workflow execution.
#[derive(Debug, Clone)]
pub struct Execution {
    pub status: ExecutionStatus,
    /// Opaque session reference for run history, when the executor
    /// produced one.
    pub session_ref: Option<String>,
}

/// Everything an executor needs to run one stage.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub repo: RepoId,
    pub ticket: TicketId,
    pub stage: Stage,
    /// Opaque per-stage model parameter, passed through from configuration.
    pub model: Option<String>,
    /// For the comment-iteration stage: the comment being processed.
    pub comment: Option<Comment>,
    /// For the comment-iteration stage: which generated section the edit
    /// targets (decided by the item's status at dispatch).
    pub edit_target: Option<Section>,
    /// The user to request review from on created pull requests.
    pub reviewer: Option<String>,
}

impl WorkflowRequest {
    /// The issue URL used in prompts, e.g.
    /// `https://github.com/owner/repo/issues/42`.
    pub fn issue_url(&self) -> String {
        format!(
            "https://{}/{}/{}/issues/{}",
            self.repo.host, self.repo.owner, self.repo.repo, self.ticket.0
        )
    }
}

/// The execution capability consumed by the runner pool.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    /// Runs one stage to completion or cancellation.
    ///
    /// Implementations must return promptly once `cancel` fires; the daemon's
    /// shutdown is bounded by this.
    async fn execute(
        &self,
        request: WorkflowRequest,
        cancel: CancellationToken,
    ) -> Result<Execution, ExecutorError>;
}
