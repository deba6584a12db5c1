//! Agent CLI executor.
//!
//! Runs the external coding-agent CLI in headless mode, one subprocess per
//! workflow. The prompt for each stage is a slash command scoped to the issue
//! URL; the comment-iteration stage gets a fuller prompt describing the edit
//! target. On cancellation the child is killed and the execution reports
//! `Cancelled`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Execution, ExecutionStatus, ExecutorError, WorkflowExecutor, WorkflowRequest};
use crate::labels::Stage;

/// Executor that shells out to an agent CLI (e.g. `claude`).
pub struct AgentCliExecutor {
    /// Path to the agent binary.
    binary: String,
    /// Skip interactive permission prompts (required headless).
    skip_permissions: bool,
}

impl AgentCliExecutor {
    pub fn new(binary: impl Into<String>) -> Self {
        AgentCliExecutor {
            binary: binary.into(),
            skip_permissions: true,
        }
    }

    /// Builds the prompt for a stage.
    fn build_prompt(request: &WorkflowRequest) -> String {
        let issue_url = request.issue_url();
        match request.stage {
            Stage::Prepare => {
                format!("/prepare_implementation_github for issue {issue_url}.")
            }
            Stage::Research => format!("/research_github for issue {issue_url}."),
            Stage::Plan => format!("/plan_github for issue {issue_url}."),
            Stage::Implement => {
                let reviewer = request
                    .reviewer
                    .as_deref()
                    .map(|r| format!(" --reviewer {r}"))
                    .unwrap_or_default();
                format!("/implement_github for issue {issue_url}.{reviewer}")
            }
            Stage::Review => format!("/review_pr_github for issue {issue_url}."),
            Stage::Edit => Self::build_edit_prompt(request, &issue_url),
        }
    }

    /// The comment-iteration prompt: apply the user's feedback to the
    /// targeted generated section, in place.
    fn build_edit_prompt(request: &WorkflowRequest, issue_url: &str) -> String {
        let comment_body = request
            .comment
            .as_ref()
            .map(|c| c.body.as_str())
            .unwrap_or_default();

        let target = match request.edit_target {
            Some(section) => format!(
                "the {} section in the issue description (between `{}` and `{}`)",
                section.target_name(),
                section.start_marker(),
                section.end_marker()
            ),
            None => "the issue description".to_string(),
        };

        format!(
            "Process this user comment and apply the requested changes to {target}.\n\
             \n\
             Issue: {issue_url}\n\
             \n\
             User comment to process:\n\
             ---\n\
             {comment_body}\n\
             ---\n\
             \n\
             Instructions:\n\
             1. Read the current content with: gh issue view {issue_url} --json body\n\
             2. Apply the user's feedback to edit it IN-PLACE\n\
             3. Update with: gh issue edit {issue_url} --body \"...\"\n\
             4. Preserve the overall structure and formatting\n\
             5. Only modify sections relevant to the user's feedback\n\
             \n\
             Do NOT create new comments. Edit the existing content directly."
        )
    }

    fn build_args(&self, request: &WorkflowRequest, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(model) = &request.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args
    }

    /// Extracts the session reference from the CLI's JSON result output.
    fn parse_session_ref(line: &str) -> Option<String> {
        let json: serde_json::Value = serde_json::from_str(line).ok()?;
        json.get("session_id")
            .and_then(|s| s.as_str())
            .map(str::to_string)
    }
}

#[async_trait]
impl WorkflowExecutor for AgentCliExecutor {
    async fn execute(
        &self,
        request: WorkflowRequest,
        cancel: CancellationToken,
    ) -> Result<Execution, ExecutorError> {
        let prompt = Self::build_prompt(&request);
        let args = self.build_args(&request, &prompt);

        info!(
            repo = %request.repo,
            ticket = %request.ticket,
            stage = %request.stage,
            "Starting workflow executor"
        );
        debug!(binary = %self.binary, "Executor command prepared");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecutorError::Spawn)?;

        let stdout = child.stdout.take().expect("stdout piped");
        let mut lines = BufReader::new(stdout).lines();
        let mut session_ref = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(
                        repo = %request.repo,
                        ticket = %request.ticket,
                        stage = %request.stage,
                        "Workflow cancelled, killing executor"
                    );
                    child.start_kill().ok();
                    child.wait().await?;
                    return Ok(Execution {
                        status: ExecutionStatus::Cancelled,
                        session_ref,
                    });
                }

                line = lines.next_line() => {
                    match line? {
                        Some(line) => {
                            if session_ref.is_none()
                                && let Some(found) = Self::parse_session_ref(&line)
                            {
                                session_ref = Some(found);
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        let status = child.wait().await?;
        let execution_status = if status.success() {
            ExecutionStatus::Success
        } else {
            warn!(
                repo = %request.repo,
                ticket = %request.ticket,
                stage = %request.stage,
                code = status.code().unwrap_or(-1),
                "Workflow executor exited with failure"
            );
            ExecutionStatus::Failure
        };

        Ok(Execution {
            status: execution_status,
            session_ref,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Section;
    use crate::types::{RepoId, TicketId};

    fn request(stage: Stage) -> WorkflowRequest {
        WorkflowRequest {
            repo: RepoId::parse("github.com/acme/widgets").unwrap(),
            ticket: TicketId(42),
            stage,
            model: None,
            comment: None,
            edit_target: None,
            reviewer: None,
        }
    }

    #[test]
    fn research_prompt_is_a_slash_command() {
        let prompt = AgentCliExecutor::build_prompt(&request(Stage::Research));
        assert_eq!(
            prompt,
            "/research_github for issue https://github.com/acme/widgets/issues/42."
        );
    }

    #[test]
    fn implement_prompt_includes_reviewer() {
        let mut req = request(Stage::Implement);
        req.reviewer = Some("alice".to_string());
        let prompt = AgentCliExecutor::build_prompt(&req);
        assert!(prompt.starts_with("/implement_github for issue"));
        assert!(prompt.ends_with("--reviewer alice"));
    }

    #[test]
    fn edit_prompt_embeds_comment_body() {
        use chrono::Utc;
        use std::collections::BTreeSet;

        let mut req = request(Stage::Edit);
        req.edit_target = Some(Section::Research);
        req.comment = Some(crate::types::Comment {
            id: crate::types::CommentId(1),
            author: "alice".to_string(),
            body: "please expand the alternatives section".to_string(),
            created_at: Utc::now(),
            reactions: BTreeSet::new(),
        });
        let prompt = AgentCliExecutor::build_prompt(&req);
        assert!(prompt.contains("please expand the alternatives section"));
        assert!(prompt.contains("IN-PLACE"));
        assert!(prompt.contains("kiln:research"));
    }

    #[test]
    fn args_include_model_when_configured() {
        let executor = AgentCliExecutor::new("claude");
        let mut req = request(Stage::Plan);
        req.model = Some("opus".to_string());
        let args = executor.build_args(&req, "prompt");
        let joined = args.join(" ");
        assert!(joined.contains("--model opus"));
        assert!(joined.contains("--dangerously-skip-permissions"));
    }

    #[test]
    fn session_ref_parsed_from_result_json() {
        let line = r#"{"type":"result","session_id":"abc-123","cost":0.1}"#;
        assert_eq!(
            AgentCliExecutor::parse_session_ref(line),
            Some("abc-123".to_string())
        );
        assert_eq!(AgentCliExecutor::parse_session_ref("not json"), None);
    }
}
