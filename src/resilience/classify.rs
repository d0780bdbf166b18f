//! Best-effort classification of provider failures.
//!
//! Providers do not share an error taxonomy, so the kind is inferred from
//! an explicit hint, the status code, or finally the message text.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::adapters::ProviderError;

/// Failure categories that drive the retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    RateLimit,
    Timeout,
    Network,
    ServerError,
    Authentication,
    Validation,
    BadRequest,
    /// Nothing recognisable; treated as transient
    Unknown,
}

impl ErrorKind {
    /// Whether another attempt may succeed
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorKind::Authentication | ErrorKind::Validation | ErrorKind::BadRequest
        )
    }

    /// Wire name of the kind
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Network => "NETWORK",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::Authentication => "AUTHENTICATION",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message fragments checked in order; the first match wins.
const MESSAGE_PATTERNS: &[(&[&str], ErrorKind)] = &[
    (
        &["rate limit", "rate_limit", "too many requests", "quota"],
        ErrorKind::RateLimit,
    ),
    (
        &["timeout", "timed out", "deadline exceeded"],
        ErrorKind::Timeout,
    ),
    (
        &[
            "unauthorized",
            "authentication",
            "api key",
            "api_key",
            "forbidden",
            "permission denied",
        ],
        ErrorKind::Authentication,
    ),
    (
        &["validation", "invalid", "schema"],
        ErrorKind::Validation,
    ),
    (
        &["bad request", "malformed", "unsupported"],
        ErrorKind::BadRequest,
    ),
    (
        &[
            "econnreset",
            "econnrefused",
            "connection",
            "network",
            "socket",
            "dns",
            "unreachable",
            "broken pipe",
        ],
        ErrorKind::Network,
    ),
    (
        &[
            "server error",
            "internal error",
            "overloaded",
            "unavailable",
            "bad gateway",
        ],
        ErrorKind::ServerError,
    ),
];

/// Classify a provider failure
pub fn classify(error: &ProviderError) -> ErrorKind {
    if let Some(kind) = error.kind {
        return kind;
    }

    if let Some(kind) = error.status.and_then(classify_status) {
        return kind;
    }

    let message = error.message.to_lowercase();
    MESSAGE_PATTERNS
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| message.contains(n)))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        429 => Some(ErrorKind::RateLimit),
        408 | 504 => Some(ErrorKind::Timeout),
        401 | 403 => Some(ErrorKind::Authentication),
        422 => Some(ErrorKind::Validation),
        400 | 404 | 405 | 409 | 413 => Some(ErrorKind::BadRequest),
        500..=599 => Some(ErrorKind::ServerError),
        _ => None,
    }
}
