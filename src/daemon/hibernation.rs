//! Hibernation: the paused operating mode used while the platform is down.
//!
//! When a board fetch fails with a platform-unreachable error the daemon
//! stops normal polling and probes at a fixed long interval instead of
//! hammering a dead endpoint with exponential backoff. In-flight workflows
//! keep running (they have their own I/O paths); only new dispatches stop.
//! A successful probe resumes normal polling with the failure count reset.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Hibernation state and probe cadence.
#[derive(Debug)]
pub struct HibernationControl {
    probe_interval: Duration,
    /// When hibernation began; `None` while operating normally.
    since: Option<DateTime<Utc>>,
}

impl HibernationControl {
    pub fn new(probe_interval: Duration) -> Self {
        HibernationControl {
            probe_interval,
            since: None,
        }
    }

    pub fn is_hibernating(&self) -> bool {
        self.since.is_some()
    }

    /// The fixed interval between platform probes.
    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }

    /// Enters hibernation. Idempotent: re-entering while already hibernating
    /// keeps the original start time and logs nothing new.
    pub fn enter(&mut self, reason: &str) {
        if self.since.is_some() {
            return;
        }
        self.since = Some(Utc::now());
        warn!(
            reason,
            probe_interval_secs = self.probe_interval.as_secs(),
            "Platform unreachable, entering hibernation"
        );
    }

    /// Exits hibernation, logging the outage duration. No-op when not
    /// hibernating.
    pub fn exit(&mut self) {
        let Some(since) = self.since.take() else {
            return;
        };
        let duration = Utc::now().signed_duration_since(since);
        info!(
            hibernated_secs = duration.num_seconds().max(0),
            "Platform reachable again, resuming normal polling"
        );
    }

    /// When hibernation began, if it is active.
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }
}
