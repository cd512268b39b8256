//! Error taxonomy for the backup pipeline.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GBackupError {
    #[error("Tool unavailable: {0} did not answer a version probe (is it installed and on PATH?)")]
    ToolUnavailable(String),

    #[error("Database unreachable at {host}:{port}: {detail}")]
    ConnectionUnreachable {
        host: String,
        port: u16,
        detail: String,
    },

    #[error("Authentication required by {host}:{port} but no credentials were supplied")]
    AuthenticationRequired { host: String, port: u16 },

    #[error("Authentication rejected by {host}:{port}: {detail}")]
    AuthenticationRejected {
        host: String,
        port: u16,
        detail: String,
    },

    #[error("Directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("Archive error: {0}")]
    ArchiveFailure(String),

    #[error("Decryption failed: wrong key or corrupted ciphertext")]
    DecryptionFailed,

    #[error("Integrity mismatch: expected {expected}, computed {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Invalid folder {folder}: {message}")]
    InvalidFolder { folder: String, message: String },

    #[error("Invalid target {target}: {message}")]
    InvalidTarget { target: String, message: String },

    #[error("Remote store error (status {status:?}): {message}")]
    StoreError {
        status: Option<u16>,
        message: String,
    },

    #[error("Eviction left {} stale file(s) behind: {}", .failed.len(), .failed.join(", "))]
    PartialEvictionFailure { failed: Vec<String> },

    #[error("{tool} failed with status {status:?}: {stderr}")]
    UnexpectedToolFailure {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Job aborted: {0}")]
    JobAborted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GBackupError {
    pub fn store(status: Option<u16>, message: impl Into<String>) -> Self {
        GBackupError::StoreError {
            status,
            message: message.into(),
        }
    }

    /// Transient failures a stage executor may retry on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            GBackupError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            GBackupError::StoreError { status: Some(s), .. } => *s == 429 || *s >= 500,
            GBackupError::StoreError { status: None, .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GBackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_failure_surfaces_stderr() {
        let err = GBackupError::UnexpectedToolFailure {
            tool: "mongodump".to_string(),
            status: Some(1),
            stderr: "Failed: error connecting to db server".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("mongodump"));
        assert!(msg.contains("Failed: error connecting to db server"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(GBackupError::store(Some(503), "unavailable").is_transient());
        assert!(GBackupError::store(Some(429), "rate limited").is_transient());
        assert!(!GBackupError::store(Some(400), "bad request").is_transient());
        assert!(!GBackupError::DecryptionFailed.is_transient());
    }

    #[test]
    fn test_partial_eviction_lists_survivors() {
        let err = GBackupError::PartialEvictionFailure {
            failed: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Eviction left 2 stale file(s) behind: a, b");
    }
}
