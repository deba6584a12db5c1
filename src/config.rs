//! Daemon configuration, loaded from environment variables.
//!
//! Missing or malformed required options are fatal at startup; everything
//! else falls back to documented defaults. Validation happens here so the
//! rest of the daemon can assume a coherent configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::labels::Stage;
use crate::ticket::Board;
use crate::types::Status;

/// Fatal configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// All options the daemon recognizes.
#[derive(Debug, Clone)]
pub struct Config {
    /// Token used to authenticate against the ticket platform.
    pub github_token: String,

    /// The project boards to poll.
    pub boards: Vec<Board>,

    /// Path of the SQLite database.
    pub database_path: PathBuf,

    /// Base poll cycle time and backoff base.
    pub poll_interval: Duration,

    /// RunnerPool capacity.
    pub max_concurrent_workflows: usize,

    /// Status columns that trigger workflows.
    pub watched_statuses: Vec<Status>,

    /// The unique user authorized to trigger workflows.
    pub allowed_username: String,

    /// Team members whose transitions are observed silently.
    pub team_usernames: Vec<String>,

    /// Bypass the status-actor check entirely.
    pub allow_others_tickets: bool,

    /// Opaque per-stage model parameters passed to the executor.
    pub stage_models: HashMap<Stage, String>,

    /// Age after which an in-flight workflow is cancelled.
    pub stale_threshold: Duration,

    /// Fixed probe cadence while the platform is unreachable.
    pub hibernation_probe_interval: Duration,

    /// Path of the agent CLI binary.
    pub agent_binary: String,
}

impl Config {
    /// Loads configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let github_token = required_env("KILN_GITHUB_TOKEN")
            .or_else(|_| required_env("GITHUB_TOKEN"))
            .map_err(|_| ConfigError::Missing("KILN_GITHUB_TOKEN"))?;

        let board_urls = required_env("KILN_PROJECT_URLS")?;
        let boards = board_urls
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|url| {
                Board::parse(url).map_err(|e| ConfigError::Invalid {
                    name: "KILN_PROJECT_URLS",
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if boards.is_empty() {
            return Err(ConfigError::Invalid {
                name: "KILN_PROJECT_URLS",
                reason: "no boards configured".to_string(),
            });
        }

        let allowed_username = required_env("ALLOWED_USERNAME")?;

        Ok(Config {
            github_token,
            boards,
            database_path: std::env::var("KILN_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/kiln.db")),
            poll_interval: duration_env("POLL_INTERVAL", 30)?,
            max_concurrent_workflows: usize_env("MAX_CONCURRENT_WORKFLOWS", 3)?,
            watched_statuses: parse_watched(
                &std::env::var("WATCHED_STATUSES")
                    .unwrap_or_else(|_| "Research,Plan,Implement".to_string()),
            )?,
            allowed_username,
            team_usernames: list_env("TEAM_USERNAMES"),
            allow_others_tickets: bool_env("ALLOW_OTHERS_TICKETS"),
            stage_models: parse_stage_models(
                &std::env::var("STAGE_MODELS").unwrap_or_default(),
            )?,
            stale_threshold: duration_env("STALE_THRESHOLD", 3600)?,
            hibernation_probe_interval: duration_env("HIBERNATION_PROBE_INTERVAL", 300)?,
            agent_binary: std::env::var("KILN_AGENT_BIN").unwrap_or_else(|_| "claude".to_string()),
        })
    }
}

fn required_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn duration_env(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(Duration::from_secs(default_secs)),
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            }),
    }
}

fn usize_env(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => {
            let value = raw.trim().parse::<usize>().map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            })?;
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    reason: "must be at least 1".to_string(),
                });
            }
            Ok(value)
        }
    }
}

fn bool_env(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn list_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Parses `WATCHED_STATUSES`, rejecting columns the daemon has no stage for.
fn parse_watched(raw: &str) -> Result<Vec<Status>, ConfigError> {
    let statuses: Vec<Status> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Status::parse)
        .collect();

    for status in &statuses {
        if Stage::for_status(status).is_none() {
            return Err(ConfigError::Invalid {
                name: "WATCHED_STATUSES",
                reason: format!("{status} is not a workflow column"),
            });
        }
    }
    if statuses.is_empty() {
        return Err(ConfigError::Invalid {
            name: "WATCHED_STATUSES",
            reason: "no statuses configured".to_string(),
        });
    }
    Ok(statuses)
}

/// Parses `STAGE_MODELS`, e.g. `research=opus,plan=sonnet`.
fn parse_stage_models(raw: &str) -> Result<HashMap<Stage, String>, ConfigError> {
    let mut models = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (stage, model) = entry.split_once('=').ok_or_else(|| ConfigError::Invalid {
            name: "STAGE_MODELS",
            reason: format!("expected stage=model, got {entry:?}"),
        })?;
        let stage = Stage::parse(stage.trim()).ok_or_else(|| ConfigError::Invalid {
            name: "STAGE_MODELS",
            reason: format!("unknown stage {stage:?}"),
        })?;
        models.insert(stage, model.trim().to_string());
    }
    Ok(models)
}
