//! Actor authorization for workflow triggering.
//!
//! Status changes and control labels are only honoured when the actor who
//! made them is the configured allowed user. The check fails safe: an
//! unresolvable actor is denied. Team members are observed silently (their
//! transitions are ignored without alarming anyone), while unknown or
//! blocked actors are logged at WARNING for the audit trail.

use tracing::{debug, warn};

/// How an observed actor relates to this daemon's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorCategory {
    /// The allowed user; full authorization.
    Allowed,
    /// This daemon's own authenticated identity (self-trigger prevention).
    Daemon,
    /// A known team member; silent observation, no action.
    Team,
    /// Actor could not be determined; denied for safety.
    Unknown,
    /// A known identity that is not authorized.
    Blocked,
}

/// The identities authorization decisions are made against.
#[derive(Debug, Clone)]
pub struct ActorPolicy {
    /// The user allowed to trigger workflows.
    pub allowed_username: String,
    /// This daemon's own authenticated login.
    pub self_username: String,
    /// Team members whose transitions are ignored without warning.
    pub team_usernames: Vec<String>,
    /// When set, the status-actor check is bypassed entirely.
    pub allow_others: bool,
}

impl ActorPolicy {
    /// Categorizes an actor login.
    ///
    /// The allowed user wins over the daemon identity: in single-account
    /// deployments they are the same login and triggering must still work.
    pub fn categorize(&self, actor: Option<&str>) -> ActorCategory {
        match actor {
            None => ActorCategory::Unknown,
            Some(a) if a == self.allowed_username => ActorCategory::Allowed,
            Some(a) if a == self.self_username => ActorCategory::Daemon,
            Some(a) if self.team_usernames.iter().any(|t| t == a) => ActorCategory::Team,
            Some(_) => ActorCategory::Blocked,
        }
    }

    /// Checks whether an actor may trigger an action on the given item.
    ///
    /// `context_key` identifies the issue for audit logging (e.g.
    /// `github.com/owner/repo#123`); `action` is a short prefix such as
    /// `"yolo"` or `"workflow"`.
    pub fn check_allowed(&self, actor: Option<&str>, context_key: &str, action: &str) -> bool {
        if self.allow_others {
            return true;
        }

        match self.categorize(actor) {
            ActorCategory::Allowed => true,
            ActorCategory::Daemon => {
                debug!(
                    context = context_key,
                    action, "Ignoring transition made by this daemon"
                );
                false
            }
            ActorCategory::Team => {
                debug!(
                    context = context_key,
                    action,
                    actor = actor.unwrap_or_default(),
                    "Ignoring transition by team member"
                );
                false
            }
            ActorCategory::Unknown => {
                warn!(
                    context = context_key,
                    action, "Could not determine actor; skipping for security"
                );
                false
            }
            ActorCategory::Blocked => {
                warn!(
                    context = context_key,
                    action,
                    actor = actor.unwrap_or_default(),
                    allowed = %self.allowed_username,
                    "Action by unauthorized actor ignored"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ActorPolicy {
        ActorPolicy {
            allowed_username: "alice".to_string(),
            self_username: "kiln-bot".to_string(),
            team_usernames: vec!["bob".to_string()],
            allow_others: false,
        }
    }

    #[test]
    fn allowed_user_is_allowed() {
        assert_eq!(policy().categorize(Some("alice")), ActorCategory::Allowed);
        assert!(policy().check_allowed(Some("alice"), "r#1", "workflow"));
    }

    #[test]
    fn daemon_identity_is_denied() {
        assert_eq!(policy().categorize(Some("kiln-bot")), ActorCategory::Daemon);
        assert!(!policy().check_allowed(Some("kiln-bot"), "r#1", "workflow"));
    }

    #[test]
    fn allowed_wins_over_daemon_when_identical() {
        let p = ActorPolicy {
            allowed_username: "alice".to_string(),
            self_username: "alice".to_string(),
            team_usernames: vec![],
            allow_others: false,
        };
        assert_eq!(p.categorize(Some("alice")), ActorCategory::Allowed);
        assert!(p.check_allowed(Some("alice"), "r#1", "workflow"));
    }

    #[test]
    fn team_member_is_denied_silently() {
        assert_eq!(policy().categorize(Some("bob")), ActorCategory::Team);
        assert!(!policy().check_allowed(Some("bob"), "r#1", "workflow"));
    }

    #[test]
    fn unknown_actor_fails_safe() {
        assert_eq!(policy().categorize(None), ActorCategory::Unknown);
        assert!(!policy().check_allowed(None, "r#1", "yolo"));
    }

    #[test]
    fn stranger_is_blocked() {
        assert_eq!(policy().categorize(Some("mallory")), ActorCategory::Blocked);
        assert!(!policy().check_allowed(Some("mallory"), "r#1", "yolo"));
    }

    #[test]
    fn allow_others_bypasses_every_check() {
        let mut p = policy();
        p.allow_others = true;
        assert!(p.check_allowed(Some("mallory"), "r#1", "workflow"));
        assert!(p.check_allowed(None, "r#1", "workflow"));
    }
}
