//! Retention over a [`RemoteStore`].
//!
//! The new artifact is always uploaded before anything is deleted, so a failed
//! upload leaves the previous generation untouched. Eviction problems after a
//! successful upload are reported on the outcome and never unwind the upload.

use super::{ListQuery, RemoteFile, RemoteStore, RetentionPolicy, UploadRequest, UploadTarget};
use crate::transfer::ProgressCallback;
use crate::utils::errors::{GBackupError, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Timestamp prefix for keep-newest uploads. Lexical order matches time order.
const GENERATION_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3fZ";

#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    pub local_path: &'a Path,
    /// Artifact name; keep-newest uploads prefix it with a timestamp
    pub name: &'a str,
    pub folder: &'a str,
    pub policy: RetentionPolicy,
    pub sha256: Option<&'a str>,
}

#[derive(Debug, Default)]
pub struct DeleteReport {
    pub deleted: Vec<RemoteFile>,
    pub failed: Vec<(RemoteFile, GBackupError)>,
}

impl DeleteReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
pub struct PublishOutcome {
    pub file: RemoteFile,
    pub replaced_in_place: bool,
    pub eviction: DeleteReport,
    /// Set when the folder could not be enumerated after the upload
    pub enumeration_error: Option<GBackupError>,
}

impl PublishOutcome {
    /// Whether the folder is known to satisfy the retention policy.
    pub fn within_policy(&self) -> bool {
        self.eviction.is_clean() && self.enumeration_error.is_none()
    }

    pub fn eviction_error(&self) -> Option<GBackupError> {
        if self.within_policy() {
            return None;
        }
        let mut failed: Vec<String> = self
            .eviction
            .failed
            .iter()
            .map(|(f, e)| format!("{} ({}): {}", f.name, f.id, e))
            .collect();
        if let Some(e) = &self.enumeration_error {
            failed.push(format!("folder listing: {e}"));
        }
        Some(GBackupError::PartialEvictionFailure { failed })
    }
}

pub struct RetentionManager {
    store: Arc<dyn RemoteStore>,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Non-trashed files named exactly `name` in `folder`, oldest first.
    pub async fn locate(&self, name: &str, folder: &str) -> Result<Vec<RemoteFile>> {
        self.store.list(&ListQuery::named(folder, name)).await
    }

    /// The file a restore should fetch for `name` under `policy`.
    pub async fn latest(&self, name: &str, folder: &str, policy: RetentionPolicy) -> Result<Option<RemoteFile>> {
        let candidates = match policy {
            RetentionPolicy::OverwriteByName => self.locate(name, folder).await?,
            RetentionPolicy::KeepNewest { .. } => {
                let suffix = format!("-{name}");
                self.store
                    .list(&ListQuery::folder(folder))
                    .await?
                    .into_iter()
                    .filter(|f| f.name == name || f.name.ends_with(&suffix))
                    .collect()
            }
        };
        Ok(candidates.into_iter().max_by_key(|f| f.created_time))
    }

    /// Upload the artifact and apply `policy` to the folder.
    pub async fn publish(
        &self,
        request: &PublishRequest<'_>,
        progress: ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<PublishOutcome> {
        match request.policy {
            RetentionPolicy::OverwriteByName => self.publish_overwrite(request, progress, cancel).await,
            RetentionPolicy::KeepNewest { keep } => {
                if keep == 0 {
                    return Err(GBackupError::Config("keep-newest requires keep >= 1".to_string()));
                }
                self.publish_keep_newest(request, keep, progress, cancel).await
            }
        }
    }

    async fn publish_overwrite(
        &self,
        request: &PublishRequest<'_>,
        progress: ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<PublishOutcome> {
        let existing = self.locate(request.name, request.folder).await?;

        if self.store.supports_update_in_place() {
            if let Some(target) = existing.last() {
                let upload = UploadRequest {
                    local_path: request.local_path,
                    name: request.name,
                    folder: request.folder,
                    target: UploadTarget::Replace(target.id.clone()),
                    sha256: request.sha256,
                };
                match self.store.upload(&upload, progress.clone(), cancel).await {
                    Ok(file) => {
                        info!("Updated {} ({}) in place", file.name, file.id);
                        let stale: Vec<RemoteFile> =
                            existing.iter().filter(|f| f.id != file.id).cloned().collect();
                        let eviction = self.delete(&stale).await;
                        return Ok(PublishOutcome {
                            file,
                            replaced_in_place: true,
                            eviction,
                            enumeration_error: None,
                        });
                    }
                    Err(GBackupError::Cancelled) => return Err(GBackupError::Cancelled),
                    Err(e) => {
                        warn!(
                            "In-place update of {} ({}) failed, creating a new file instead: {}",
                            target.name, target.id, e
                        );
                    }
                }
            }
        }

        let file = self.create(request, request.name, progress, cancel).await?;
        let stale: Vec<RemoteFile> = existing.into_iter().filter(|f| f.id != file.id).collect();
        let eviction = self.delete(&stale).await;
        Ok(PublishOutcome {
            file,
            replaced_in_place: false,
            eviction,
            enumeration_error: None,
        })
    }

    async fn publish_keep_newest(
        &self,
        request: &PublishRequest<'_>,
        keep: usize,
        progress: ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<PublishOutcome> {
        let remote_name = generation_name(request.name);
        let file = self.create(request, &remote_name, progress, cancel).await?;

        // Every file in the folder counts toward `keep`, which is why the
        // config gives each keep-newest database a folder of its own.
        // Concurrent publishers to the same folder may each evict based on a
        // listing that misses the other's upload.
        let listed = match self.store.list(&ListQuery::folder(request.folder)).await {
            Ok(files) => files,
            Err(e) => {
                warn!("Could not enumerate {} after upload: {}", request.folder, e);
                return Ok(PublishOutcome {
                    file,
                    replaced_in_place: false,
                    eviction: DeleteReport::default(),
                    enumeration_error: Some(e),
                });
            }
        };

        let victims = select_evictions(listed, &file.id, keep);
        if !victims.is_empty() {
            info!(
                "Evicting {} file(s) from {} to keep the newest {}",
                victims.len(),
                request.folder,
                keep
            );
        }
        let eviction = self.delete(&victims).await;
        Ok(PublishOutcome {
            file,
            replaced_in_place: false,
            eviction,
            enumeration_error: None,
        })
    }

    async fn create(
        &self,
        request: &PublishRequest<'_>,
        name: &str,
        progress: ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile> {
        let upload = UploadRequest {
            local_path: request.local_path,
            name,
            folder: request.folder,
            target: UploadTarget::Create,
            sha256: request.sha256,
        };
        let file = self.store.upload(&upload, progress, cancel).await?;
        info!("Uploaded {} as {} into {}", file.name, file.id, request.folder);
        Ok(file)
    }

    /// Delete each file, collecting failures instead of stopping at the first.
    pub async fn delete(&self, files: &[RemoteFile]) -> DeleteReport {
        let mut report = DeleteReport::default();
        for file in files {
            match self.store.delete(&file.id).await {
                Ok(()) => {
                    info!("Deleted {} ({})", file.name, file.id);
                    report.deleted.push(file.clone());
                }
                Err(e) => {
                    warn!("Failed to delete {} ({}): {}", file.name, file.id, e);
                    report.failed.push((file.clone(), e));
                }
            }
        }
        report
    }
}

pub fn generation_name(artifact_name: &str) -> String {
    format!("{}-{}", Utc::now().format(GENERATION_FORMAT), artifact_name)
}

/// Files to delete so that `keep` survive, the just-uploaded `new_id` always among them.
fn select_evictions(mut listed: Vec<RemoteFile>, new_id: &str, keep: usize) -> Vec<RemoteFile> {
    listed.retain(|f| f.id != new_id);
    listed.sort_by_key(|f| f.created_time);
    let excess = listed.len().saturating_sub(keep.saturating_sub(1));
    listed.truncate(excess);
    listed
}
