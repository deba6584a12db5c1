//! Typed adapter error taxonomy.
//!
//! Every adapter method maps transport and authentication failures into one
//! of these kinds so the core can apply the right policy without inspecting
//! provider-specific errors:
//!
//! - **Authorization** is fatal: the daemon cannot operate without access.
//! - **Unreachable** trips hibernation: the platform itself is down.
//! - **Transient** is retried inside the adapter; if retries are exhausted it
//!   surfaces as a failed cycle and feeds the backoff controller.
//! - **Schema** is non-fatal and scoped: skip the item or board, keep going.
//! - **NotFound** lets callers treat missing tickets as skippable.

use std::fmt;
use thiserror::Error;

/// The kind of adapter error, categorized for policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    /// 401/403 (non-rate-limit), missing scopes. Fatal.
    Authorization,

    /// DNS, TLS, connection-level failures. The platform is down.
    Unreachable,

    /// 429, 5xx, rate limits. Safe to retry with backoff.
    Transient,

    /// Unexpected response shape. Skip the affected item or board.
    Schema,

    /// The addressed ticket, comment, or board does not exist.
    NotFound,
}

impl AdapterErrorKind {
    pub fn is_retriable(self) -> bool {
        matches!(self, AdapterErrorKind::Transient)
    }
}

/// An adapter error with categorization for policy decisions.
#[derive(Debug, Error)]
pub struct AdapterError {
    pub kind: AdapterErrorKind,

    /// The HTTP status code, if one was observed.
    pub status_code: Option<u16>,

    pub message: String,

    /// The underlying octocrab error, if available.
    #[source]
    pub source: Option<octocrab::Error>,
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "adapter error (HTTP {}): {}", code, self.message),
            None => write!(f, "adapter error: {}", self.message),
        }
    }
}

impl AdapterError {
    fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Authorization, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Unreachable, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Transient, message)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Schema, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::NotFound, message)
    }

    pub fn is_unreachable(&self) -> bool {
        self.kind == AdapterErrorKind::Unreachable
    }

    pub fn is_authorization(&self) -> bool {
        self.kind == AdapterErrorKind::Authorization
    }

    /// Categorizes an octocrab error.
    ///
    /// The categorization is based on HTTP status codes where available and
    /// on message patterns for network-level failures, which octocrab
    /// surfaces without a status code.
    pub fn from_octocrab(err: octocrab::Error) -> Self {
        let status_code = extract_status_code(&err);
        let message = err.to_string();

        let kind = match status_code {
            Some(401) => AdapterErrorKind::Authorization,
            Some(403) if is_rate_limit_message(&message) => AdapterErrorKind::Transient,
            Some(403) => AdapterErrorKind::Authorization,
            Some(404) => AdapterErrorKind::NotFound,
            Some(429) => AdapterErrorKind::Transient,
            Some(code) if (500..600).contains(&code) => AdapterErrorKind::Transient,
            Some(_) => AdapterErrorKind::Schema,
            None => {
                if is_network_message(&message) {
                    AdapterErrorKind::Unreachable
                } else {
                    AdapterErrorKind::Schema
                }
            }
        };

        Self {
            kind,
            status_code,
            message,
            source: Some(err),
        }
    }

    /// Re-kinds an exhausted transient error as platform-unreachable when it
    /// came from a server-side failure.
    ///
    /// A single 502 is retried; a 502 that survives every retry means the
    /// platform is effectively down and hibernation is the right response.
    pub fn escalate_exhausted(mut self) -> Self {
        let server_side = self.status_code.is_none_or(|code| code >= 500);
        if self.kind == AdapterErrorKind::Transient && server_side {
            self.kind = AdapterErrorKind::Unreachable;
        }
        self
    }
}

/// Extracts the HTTP status code from an octocrab error, if present.
fn extract_status_code(err: &octocrab::Error) -> Option<u16> {
    if let octocrab::Error::GitHub { source, .. } = err {
        return Some(source.status_code.as_u16());
    }

    // Fall back to message sniffing for wrapped transport errors.
    let err_str = err.to_string();
    for code in [401u16, 403, 404, 409, 422, 429, 500, 502, 503, 504] {
        if err_str.contains(&code.to_string()) {
            return Some(code);
        }
    }
    None
}

/// Checks if an error message indicates a network-level failure.
///
/// The patterns cover DNS, TLS, and socket-level failures as surfaced by the
/// HTTP stack.
pub fn is_network_message(message: &str) -> bool {
    let message = message.to_lowercase();
    const PATTERNS: [&str; 12] = [
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "network unreachable",
        "host unreachable",
        "dns",
        "name resolution",
        "tls",
        "ssl",
        "broken pipe",
        "eof occurred",
    ];
    PATTERNS.iter().any(|p| message.contains(p))
}

/// Checks if an error message indicates a rate limit.
fn is_rate_limit_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("rate limit")
        || message.contains("api rate")
        || message.contains("secondary rate")
        || message.contains("abuse detection")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_message_detection() {
        assert!(is_network_message("TLS handshake timeout"));
        assert!(is_network_message("SSL: CERTIFICATE_VERIFY_FAILED"));
        assert!(is_network_message("Connection refused"));
        assert!(is_network_message("Network unreachable"));
        assert!(is_network_message("DNS lookup failed"));
        assert!(is_network_message("Connection reset by peer"));
        assert!(is_network_message("Broken pipe"));
        assert!(is_network_message("EOF occurred"));
        assert!(is_network_message("name resolution failed"));
    }

    #[test]
    fn network_detection_is_case_insensitive() {
        assert!(is_network_message("TLS HANDSHAKE TIMEOUT"));
        assert!(is_network_message("connection REFUSED"));
    }

    #[test]
    fn non_network_messages_not_detected() {
        assert!(!is_network_message("Bad credentials"));
        assert!(!is_network_message("Not found"));
        assert!(!is_network_message("Invalid JSON response"));
        assert!(!is_network_message("Permission denied"));
    }

    #[test]
    fn rate_limit_detection() {
        assert!(is_rate_limit_message("API rate limit exceeded"));
        assert!(is_rate_limit_message("secondary rate limit"));
        assert!(!is_rate_limit_message("Permission denied"));
    }

    #[test]
    fn retriable_kinds() {
        assert!(AdapterErrorKind::Transient.is_retriable());
        assert!(!AdapterErrorKind::Authorization.is_retriable());
        assert!(!AdapterErrorKind::Unreachable.is_retriable());
        assert!(!AdapterErrorKind::Schema.is_retriable());
    }

    #[test]
    fn escalation_promotes_server_side_transient() {
        let mut err = AdapterError::transient("502 bad gateway");
        err.status_code = Some(502);
        assert_eq!(err.escalate_exhausted().kind, AdapterErrorKind::Unreachable);
    }

    #[test]
    fn escalation_leaves_rate_limits_transient() {
        let mut err = AdapterError::transient("rate limited");
        err.status_code = Some(429);
        assert_eq!(err.escalate_exhausted().kind, AdapterErrorKind::Transient);
    }

    #[test]
    fn escalation_ignores_non_transient() {
        let err = AdapterError::schema("odd shape");
        assert_eq!(err.escalate_exhausted().kind, AdapterErrorKind::Schema);
    }
}
