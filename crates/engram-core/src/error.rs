//! Engine Error Model
//!
//! A single error type carrying an `ErrorKind` value plus detail text.
//! Kinds are the contract with callers: `Conflict` is retryable,
//! `Degraded` means a partial result is available, `Cancelled` is never
//! retried automatically. Everything internal maps to `Internal`.

use std::fmt;

// ============================================================================
// ERROR KINDS
// ============================================================================

/// Classification of engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input or schema mismatch
    Validation,
    /// Referenced id absent
    NotFound,
    /// Optimistic concurrency failure or illegal state transition
    Conflict,
    /// Pool timeout, queue full, rate limited
    ResourceExhausted,
    /// External dependency unavailable; partial results may be acceptable
    Degraded,
    /// Deadline exceeded or explicit cancel
    Cancelled,
    /// Invariant violated
    Internal,
}

impl ErrorKind {
    /// Stable snake_case name, matching the wire envelope
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Degraded => "degraded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ERROR
// ============================================================================

/// Engine error: a kind plus human-readable detail
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct Error {
    /// Error classification
    pub kind: ErrorKind,
    /// Human-readable detail
    pub detail: String,
}

/// Engine result type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build an error of the given kind
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Malformed input
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, detail)
    }

    /// Referenced id absent
    pub fn not_found(what: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{what} {id} not found"))
    }

    /// Concurrency failure or illegal transition
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, detail)
    }

    /// Pool/queue/rate-limit exhaustion
    pub fn resource_exhausted(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, detail)
    }

    /// External dependency unavailable
    pub fn degraded(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Degraded, detail)
    }

    /// Deadline exceeded or explicit cancel
    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, detail)
    }

    /// Invariant violated
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    /// True when the caller may retry after backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Conflict | ErrorKind::ResourceExhausted
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => {
                Error::new(ErrorKind::NotFound, "row not found")
            }
            rusqlite::Error::SqliteFailure(code, ref msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::new(
                    ErrorKind::Conflict,
                    msg.clone().unwrap_or_else(|| "constraint violation".into()),
                )
            }
            other => Error::internal(format!("database error: {other}")),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::internal(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::validation(format!("json error: {e}"))
    }
}

/// Map a poisoned lock into an internal error
pub fn lock_poisoned<T>(_: T) -> Error {
    Error::internal("lock poisoned")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(ErrorKind::Validation.as_str(), "validation");
        assert_eq!(ErrorKind::ResourceExhausted.as_str(), "resource_exhausted");
        assert_eq!(ErrorKind::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn test_display_includes_kind_and_detail() {
        let e = Error::conflict("version mismatch");
        assert_eq!(e.to_string(), "conflict: version mismatch");
    }

    #[test]
    fn test_retryable() {
        assert!(Error::conflict("x").is_retryable());
        assert!(Error::resource_exhausted("x").is_retryable());
        assert!(!Error::cancelled("x").is_retryable());
        assert!(!Error::validation("x").is_retryable());
    }

    #[test]
    fn test_no_rows_maps_to_not_found() {
        let e: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(e.kind, ErrorKind::NotFound);
    }
}
