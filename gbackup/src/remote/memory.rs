//! In-process remote store with failure injection.
//!
//! Creation times advance one second per created file so ordering is strict.
//! Uploads are delivered in fixed-size chunks with a cancellation check between
//! chunks; a failed or cancelled upload leaves no trace.

use super::{ListQuery, RemoteFile, RemoteStore, UploadRequest, UploadTarget};
use crate::transfer::ProgressCallback;
use crate::utils::errors::{GBackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone)]
struct StoredFile {
    meta: RemoteFile,
    content: Vec<u8>,
    trashed: bool,
}

#[derive(Debug, Default)]
struct Faults {
    failing_uploads: usize,
    failing_updates: usize,
    failing_deletes: HashSet<String>,
    invalid_folders: HashSet<String>,
    cancel_after_chunks: Option<(usize, CancellationToken)>,
}

#[derive(Debug)]
struct Inner {
    files: Vec<StoredFile>,
    next_id: u64,
    clock: DateTime<Utc>,
    faults: Faults,
}

#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    update_in_place: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                files: Vec::new(),
                next_id: 1,
                clock: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now),
                faults: Faults::default(),
            }),
            update_in_place: true,
        }
    }

    /// A store without update-in-place; overwrites must create then delete.
    pub fn without_update_in_place() -> Self {
        Self {
            update_in_place: false,
            ..Self::new()
        }
    }

    /// The next `count` uploads (create or replace) fail halfway through.
    pub fn fail_next_uploads(&self, count: usize) {
        self.with(|i| i.faults.failing_uploads = count);
    }

    /// The next `count` replace uploads fail; creates are unaffected.
    pub fn fail_next_updates(&self, count: usize) {
        self.with(|i| i.faults.failing_updates = count);
    }

    pub fn fail_deletes_of(&self, file_id: &str) {
        self.with(|i| {
            i.faults.failing_deletes.insert(file_id.to_string());
        });
    }

    /// Queries against `folder` are rejected as if it did not exist.
    pub fn reject_folder(&self, folder: &str) {
        self.with(|i| {
            i.faults.invalid_folders.insert(folder.to_string());
        });
    }

    /// Fire `token` after `chunks` chunks of the next upload have been delivered.
    pub fn cancel_after_chunks(&self, chunks: usize, token: CancellationToken) {
        self.with(|i| i.faults.cancel_after_chunks = Some((chunks, token)));
    }

    /// Seed a file directly, bypassing upload.
    pub fn insert(&self, folder: &str, name: &str, content: &[u8]) -> RemoteFile {
        self.with(|i| i.create(folder, name, content.to_vec(), None))
    }

    /// Live files in `folder`, oldest first.
    pub fn files(&self, folder: &str) -> Vec<RemoteFile> {
        self.with(|i| {
            let mut files: Vec<RemoteFile> = i
                .files
                .iter()
                .filter(|f| !f.trashed && f.meta.parent_id == folder)
                .map(|f| f.meta.clone())
                .collect();
            files.sort_by_key(|f| f.created_time);
            files
        })
    }

    pub fn content(&self, file_id: &str) -> Option<Vec<u8>> {
        self.with(|i| {
            i.files
                .iter()
                .find(|f| f.meta.id == file_id && !f.trashed)
                .map(|f| f.content.clone())
        })
    }

    /// Move a file to the trash; listings no longer show it.
    pub fn trash(&self, file_id: &str) {
        self.with(|i| {
            if let Some(f) = i.files.iter_mut().find(|f| f.meta.id == file_id) {
                f.trashed = true;
            }
        });
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl Inner {
    fn create(&mut self, folder: &str, name: &str, content: Vec<u8>, sha256: Option<String>) -> RemoteFile {
        let meta = RemoteFile {
            id: format!("mem-{}", self.next_id),
            name: name.to_string(),
            parent_id: folder.to_string(),
            created_time: self.clock,
            size: Some(content.len() as u64),
            sha256,
        };
        self.next_id += 1;
        self.clock += Duration::seconds(1);
        self.files.push(StoredFile {
            meta: meta.clone(),
            content,
            trashed: false,
        });
        meta
    }

    fn live(&mut self, file_id: &str) -> Option<&mut StoredFile> {
        self.files.iter_mut().find(|f| f.meta.id == file_id && !f.trashed)
    }

    fn check_folder(&self, folder: &str) -> Result<()> {
        if self.faults.invalid_folders.contains(folder) {
            return Err(GBackupError::InvalidFolder {
                folder: folder.to_string(),
                message: "File not found (404)".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn supports_update_in_place(&self) -> bool {
        self.update_in_place
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<RemoteFile>> {
        self.with(|i| i.check_folder(&query.folder))?;
        Ok(self
            .files(&query.folder)
            .into_iter()
            .filter(|f| query.name.as_ref().map_or(true, |n| &f.name == n))
            .collect())
    }

    async fn get(&self, file_id: &str) -> Result<RemoteFile> {
        self.with(|i| i.live(file_id).map(|f| f.meta.clone()))
            .ok_or_else(|| GBackupError::InvalidTarget {
                target: file_id.to_string(),
                message: "File not found (404)".to_string(),
            })
    }

    async fn upload(
        &self,
        request: &UploadRequest<'_>,
        progress: ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile> {
        let content = tokio::fs::read(request.local_path).await?;
        let total = content.len();

        let (fail, cancel_plan) = self.with(|i| -> Result<(bool, Option<(usize, CancellationToken)>)> {
            i.check_folder(request.folder)?;
            if let UploadTarget::Replace(id) = &request.target {
                if !self.update_in_place {
                    return Err(GBackupError::store(None, "update in place is not supported"));
                }
                if i.live(id).is_none() {
                    return Err(GBackupError::InvalidTarget {
                        target: id.clone(),
                        message: "File not found (404)".to_string(),
                    });
                }
            }
            let mut fail = false;
            if i.faults.failing_uploads > 0 {
                i.faults.failing_uploads -= 1;
                fail = true;
            }
            if matches!(request.target, UploadTarget::Replace(_)) && i.faults.failing_updates > 0 {
                i.faults.failing_updates -= 1;
                fail = true;
            }
            Ok((fail, i.faults.cancel_after_chunks.take()))
        })?;

        let mut sent = 0usize;
        let mut chunks = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(GBackupError::Cancelled);
            }
            if fail && sent >= total / 2 {
                return Err(GBackupError::store(Some(503), "upload interrupted"));
            }
            if sent >= total {
                break;
            }
            sent = (sent + CHUNK_SIZE).min(total);
            chunks += 1;
            progress(sent as u64);
            if let Some((after, token)) = &cancel_plan {
                if chunks >= *after {
                    token.cancel();
                }
            }
            tokio::task::yield_now().await;
        }

        let sha256 = request.sha256.map(str::to_string);
        let meta = self.with(|i| -> Result<RemoteFile> {
            match &request.target {
                UploadTarget::Create => Ok(i.create(request.folder, request.name, content, sha256)),
                UploadTarget::Replace(id) => {
                    let file = i.live(id).ok_or_else(|| GBackupError::InvalidTarget {
                        target: id.clone(),
                        message: "File not found (404)".to_string(),
                    })?;
                    file.meta.name = request.name.to_string();
                    file.meta.size = Some(content.len() as u64);
                    file.meta.sha256 = sha256;
                    file.content = content;
                    Ok(file.meta.clone())
                }
            }
        })?;
        if total == 0 {
            progress(0);
        }
        Ok(meta)
    }

    async fn delete(&self, file_id: &str) -> Result<()> {
        self.with(|i| {
            if i.faults.failing_deletes.contains(file_id) {
                return Err(GBackupError::store(Some(500), "backend error"));
            }
            let before = i.files.len();
            i.files.retain(|f| f.meta.id != file_id || f.trashed);
            if i.files.len() == before {
                return Err(GBackupError::InvalidTarget {
                    target: file_id.to_string(),
                    message: "File not found (404)".to_string(),
                });
            }
            Ok(())
        })
    }

    async fn download(&self, file_id: &str, dest: &Path, cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(GBackupError::Cancelled);
        }
        let content = self.content(file_id).ok_or_else(|| GBackupError::InvalidTarget {
            target: file_id.to_string(),
            message: "File not found (404)".to_string(),
        })?;
        tokio::fs::write(dest, &content).await?;
        Ok(content.len() as u64)
    }
}
