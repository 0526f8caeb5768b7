// src/error.rs
//! Error taxonomy for one ingestion cycle.
//!
//! Every stage (`resolve`, `fetch`, `write`) returns one of these; the cycle
//! matches them into a terminal outcome instead of letting them escape.

use thiserror::Error;

/// Longest upstream body excerpt kept for diagnostics.
pub const BODY_EXCERPT_CHARS: usize = 512;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("secret unavailable: {0}")]
    SecretUnavailable(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl IngestError {
    pub fn upstream(status: u16, body: &str) -> Self {
        Self::Upstream {
            status,
            body: excerpt(body),
        }
    }

    /// Upstream rejected the API key (stale or rotated credential).
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::Upstream { status, .. } if *status == 401 || *status == 403)
    }

    /// Short, stable label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SecretUnavailable(_) => "secret_unavailable",
            Self::Network(_) => "network",
            Self::Upstream { .. } => "upstream",
            Self::Storage(_) => "storage",
        }
    }
}

/// Trim a response body to something safe to put in a log line.
pub fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= BODY_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(BODY_EXCERPT_CHARS).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_caps_long_bodies() {
        let long = "x".repeat(BODY_EXCERPT_CHARS + 10);
        let out = excerpt(&long);
        assert_eq!(out.chars().count(), BODY_EXCERPT_CHARS + 1);
        assert!(out.ends_with('…'));
        assert_eq!(excerpt("  short  "), "short");
    }

    #[test]
    fn auth_rejection_only_for_401_and_403() {
        assert!(IngestError::upstream(401, "").is_auth_rejection());
        assert!(IngestError::upstream(403, "").is_auth_rejection());
        assert!(!IngestError::upstream(500, "").is_auth_rejection());
        assert!(!IngestError::Network("boom".into()).is_auth_rejection());
    }
}
