//! Typed errors at component seams.
//!
//! Unit-level failures (one analysis segment, one uploaded file) are
//! absorbed by their callers into partial results; these types exist so
//! callers can decide between retrying, skipping, and reporting. Application
//! glue and CLI commands use `anyhow`.

use thiserror::Error;

pub use capture_harness_core::ParseError;

/// Failure of one request to the external analysis service.
#[derive(Debug, Error)]
pub enum ApiError {
    /// 401/403. Never retried.
    #[error("analysis service rejected credentials (HTTP {status})")]
    Auth { status: u16 },

    /// 429.
    #[error("analysis service rate limited the request")]
    RateLimited,

    #[error("analysis request timed out")]
    Timeout,

    /// Network errors, 5xx, other 4xx, and malformed responses.
    #[error("analysis request failed: {0}")]
    Generic(String),
}

impl ApiError {
    /// Map an HTTP status and body to the taxonomy.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => ApiError::Auth { status },
            429 => ApiError::RateLimited,
            408 | 504 => ApiError::Timeout,
            _ => ApiError::Generic(format!("HTTP {}: {}", status, truncate(body, 200))),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth { .. })
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Generic(err.to_string())
        }
    }
}

/// Failure to persist a file or record.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Failure inside a filesystem watcher.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("cannot watch {path}: {source}")]
    Start {
        path: String,
        #[source]
        source: notify::Error,
    },

    #[error("watch event error: {0}")]
    Event(#[from] notify::Error),
}

/// Rejected session-manager command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("a session is already active: {0}")]
    AlreadyActive(String),

    #[error("no active session")]
    NotActive,

    #[error("invalid capture: {0}")]
    InvalidCapture(String),

    #[error("session manager is not running")]
    Unavailable,
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
    fn test_status_mapping() {
        assert!(ApiError::from_status(401, "").is_auth());
        assert!(ApiError::from_status(403, "").is_auth());
        assert!(matches!(ApiError::from_status(429, ""), ApiError::RateLimited));
        assert!(matches!(ApiError::from_status(504, ""), ApiError::Timeout));
        assert!(matches!(ApiError::from_status(500, "boom"), ApiError::Generic(m) if m.contains("boom")));
        assert!(matches!(ApiError::from_status(400, ""), ApiError::Generic(_)));
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("ééé", 2), "éé");
        assert_eq!(truncate("ab", 5), "ab");
    }
}
