//! Remote object store abstraction and retention.
//!
//! A [`RemoteStore`] is a folder-scoped file store addressed by opaque ids
//! (Google Drive in production, [`memory::MemoryStore`] in tests). The
//! [`retention::RetentionManager`] layers upload ordering and eviction on top.

pub mod drive;
pub mod memory;
pub mod retention;

use crate::transfer::ProgressCallback;
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub use drive::DriveStore;
pub use memory::MemoryStore;
pub use retention::{DeleteReport, PublishOutcome, PublishRequest, RetentionManager};

/// A file as reported by the store. Creation time is assigned by the store and
/// is the only ordering the retention logic trusts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub parent_id: String,
    pub created_time: DateTime<Utc>,
    pub size: Option<u64>,
    /// Digest of the packed archive, when the uploader attached one
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum RetentionPolicy {
    /// At most one file with the artifact's name survives
    #[default]
    OverwriteByName,
    /// At most `keep` files survive in the folder, oldest evicted first
    KeepNewest { keep: usize },
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPolicy::OverwriteByName => write!(f, "overwrite-by-name"),
            RetentionPolicy::KeepNewest { keep } => write!(f, "keep-newest({keep})"),
        }
    }
}

/// Listing filter. Trashed entries are always excluded and results are
/// ordered by creation time, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub folder: String,
    pub name: Option<String>,
}

impl ListQuery {
    pub fn folder(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            name: None,
        }
    }

    pub fn named(folder: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            name: Some(name.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    /// New file in the folder
    Create,
    /// Replace the content of an existing file, keeping its id
    Replace(String),
}

#[derive(Debug, Clone)]
pub struct UploadRequest<'a> {
    pub local_path: &'a Path,
    pub name: &'a str,
    pub folder: &'a str,
    pub target: UploadTarget,
    pub sha256: Option<&'a str>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Whether [`UploadTarget::Replace`] is supported
    fn supports_update_in_place(&self) -> bool;

    async fn list(&self, query: &ListQuery) -> Result<Vec<RemoteFile>>;

    async fn get(&self, file_id: &str) -> Result<RemoteFile>;

    /// Chunked upload. Progress is reported per acknowledged chunk. When
    /// `cancel` fires the transfer is aborted and no new object is visible.
    async fn upload(
        &self,
        request: &UploadRequest<'_>,
        progress: ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile>;

    async fn delete(&self, file_id: &str) -> Result<()>;

    /// Download a file's content to `dest`, returning the byte count.
    async fn download(&self, file_id: &str, dest: &Path, cancel: &CancellationToken) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Holder {
        retention: RetentionPolicy,
    }

    #[test]
    fn test_policy_from_toml() {
        let keep: Holder = toml::from_str("retention = { policy = \"keep-newest\", keep = 4 }").unwrap();
        assert_eq!(keep.retention, RetentionPolicy::KeepNewest { keep: 4 });

        let overwrite: Holder = toml::from_str("retention = { policy = \"overwrite-by-name\" }").unwrap();
        assert_eq!(overwrite.retention, RetentionPolicy::OverwriteByName);
    }

    #[test]
    fn test_policy_display() {
        assert_eq!(RetentionPolicy::OverwriteByName.to_string(), "overwrite-by-name");
        assert_eq!(RetentionPolicy::KeepNewest { keep: 3 }.to_string(), "keep-newest(3)");
    }
}
