//! Typed errors shared across the upload pipeline.
//!
//! Remote failures are classified once, at the HTTP boundary, into an
//! [`ErrorKind`]. Everything downstream (circuit breaker, orchestrator,
//! recovery) matches on the kind instead of inspecting messages.

use std::fmt;

use crate::models::LifecycleState;

/// Classification of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// HTTP 429 or quota exhaustion. Always retryable, never counts as an attempt.
    RateLimited,
    /// Timeouts, connection resets, 5xx. Retryable with backoff.
    Transient,
    /// Any other 4xx or malformed input. Not retried.
    Permanent,
    /// The remote claimed success but verification disagrees.
    Inconsistent,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Inconsistent => "inconsistent",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every remote operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient remote error: {0}")]
    Transient(String),
    #[error("permanent remote error: {0}")]
    Permanent(String),
    #[error("inconsistent remote state: {0}")]
    Inconsistent(String),
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::RateLimited(_) => ErrorKind::RateLimited,
            RemoteError::Transient(_) => ErrorKind::Transient,
            RemoteError::Permanent(_) => ErrorKind::Permanent,
            RemoteError::Inconsistent(_) => ErrorKind::Inconsistent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited | ErrorKind::Transient
        )
    }

    /// Classify an HTTP status with its response body.
    pub fn from_status(status: u16, body: &str) -> Self {
        let msg = format!("HTTP {}: {}", status, truncate(body, 300));
        match status {
            429 => RemoteError::RateLimited(msg),
            408 | 500..=599 => RemoteError::Transient(msg),
            _ => RemoteError::Permanent(msg),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return RemoteError::from_status(status.as_u16(), &err.to_string());
        }
        if err.is_decode() {
            return RemoteError::Inconsistent(format!("undecodable response: {}", err));
        }
        RemoteError::Transient(err.to_string())
    }
}

/// An attempted lifecycle transition that the state machine does not allow.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition for {file_id}: {from} -> {to}")]
    Illegal {
        file_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("{file_id} is in {actual}, expected {expected}")]
    StateMismatch {
        file_id: String,
        expected: LifecycleState,
        actual: LifecycleState,
    },
    #[error("unknown file: {0}")]
    UnknownFile(String),
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(RemoteError::from_status(429, "").kind(), ErrorKind::RateLimited);
        assert_eq!(RemoteError::from_status(503, "").kind(), ErrorKind::Transient);
        assert_eq!(RemoteError::from_status(408, "").kind(), ErrorKind::Transient);
        assert_eq!(RemoteError::from_status(400, "bad").kind(), ErrorKind::Permanent);
        assert_eq!(RemoteError::from_status(404, "").kind(), ErrorKind::Permanent);
    }

    #[test]
    fn retryable_kinds() {
        assert!(RemoteError::RateLimited(String::new()).is_retryable());
        assert!(RemoteError::Transient(String::new()).is_retryable());
        assert!(!RemoteError::Permanent(String::new()).is_retryable());
        assert!(!RemoteError::Inconsistent(String::new()).is_retryable());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let err = RemoteError::from_status(500, &body);
        assert!(err.to_string().len() < 400);
    }
}
