//! Concrete stage executors for the backup and restore pipelines.

use super::job::RestoreSource;
use super::{ArtifactRecord, FailureClass, StageContext, StageExecutor, StageName};
use crate::integrity::{self, IntegrityVerifier};
use crate::preflight::Preflight;
use crate::remote::{PublishRequest, RemoteFile, RetentionManager};
use crate::tools::MongoTools;
use crate::transfer::progress::logging_callback;
use crate::utils::errors::{GBackupError, Result};
use crate::{archive, cipher};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run blocking file work (codecs, hashing) off the runtime threads.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GBackupError::JobAborted(format!("blocking task failed: {e}")))?
}

fn missing_artifact(what: &str) -> GBackupError {
    GBackupError::Config(format!("{what} was not produced by an earlier stage"))
}

pub struct PreflightStage {
    preflight: Arc<Preflight>,
}

impl PreflightStage {
    pub fn new(preflight: Arc<Preflight>) -> Self {
        Self { preflight }
    }
}

#[async_trait]
impl StageExecutor for PreflightStage {
    fn name(&self) -> StageName {
        StageName::Preflighting
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<()> {
        self.preflight.verify(&ctx.job.database).await.into_result()
    }
}

pub struct DumpStage {
    tools: MongoTools,
}

impl DumpStage {
    pub fn new(tools: MongoTools) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl StageExecutor for DumpStage {
    fn name(&self) -> StageName {
        StageName::Dumping
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<()> {
        let dump_dir = ctx.job.dump_dir();
        // mongodump only adds files, so output left by an earlier run would
        // end up in this archive. Backup outputs belong to the job.
        if tokio::fs::try_exists(&dump_dir).await? {
            tokio::fs::remove_dir_all(&dump_dir).await?;
        }
        tokio::fs::create_dir_all(&dump_dir).await?;
        self.tools.dump(&ctx.job.database, &dump_dir).await?;
        ctx.artifacts.dump_dir = Some(dump_dir);
        Ok(())
    }
}

pub struct PackStage;

#[async_trait]
impl StageExecutor for PackStage {
    fn name(&self) -> StageName {
        StageName::Packing
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<()> {
        let source = ctx
            .artifacts
            .dump_dir
            .clone()
            .ok_or_else(|| missing_artifact("dump directory"))?;
        let output = ctx.job.archive_path();
        blocking(move || archive::pack(&source, &output)).await?;
        Ok(())
    }
}

pub struct StampStage;

#[async_trait]
impl StageExecutor for StampStage {
    fn name(&self) -> StageName {
        StageName::Stamping
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<()> {
        let archive = ctx.job.archive_path();
        let report = ctx.job.hash_report_path();
        let buffer_size = ctx.job.hash_buffer_size;

        let (record, size) = {
            let (archive, report) = (archive.clone(), report.clone());
            blocking(move || {
                let mut verifier = IntegrityVerifier::with_buffer_size(buffer_size)?;
                let record = verifier.digest(&archive)?;
                verifier.save(&report)?;
                Ok((record, std::fs::metadata(&archive)?.len()))
            })
            .await?
        };

        info!(
            job_id = %ctx.job.job_id,
            "{} {} ({} bytes)",
            record.algorithm,
            record.hex_digest,
            size
        );
        ctx.artifacts.archive = Some(ArtifactRecord {
            path: archive,
            size,
            integrity: record,
        });
        ctx.artifacts.hash_report = Some(report);
        Ok(())
    }
}

pub struct EncryptStage;

#[async_trait]
impl StageExecutor for EncryptStage {
    fn name(&self) -> StageName {
        StageName::Encrypting
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<()> {
        let plain = ctx
            .artifacts
            .archive
            .as_ref()
            .map(|a| a.path.clone())
            .ok_or_else(|| missing_artifact("stamped archive"))?;
        let target = ctx.job.cipher_path();
        let key = ctx.job.key.clone();
        let written = blocking(move || cipher::encrypt(&plain, &target, &key)).await?;
        ctx.artifacts.ciphertext = Some(written);
        Ok(())
    }
}

pub struct PublishStage {
    retention: Arc<RetentionManager>,
}

impl PublishStage {
    pub fn new(retention: Arc<RetentionManager>) -> Self {
        Self { retention }
    }
}

#[async_trait]
impl StageExecutor for PublishStage {
    fn name(&self) -> StageName {
        StageName::Publishing
    }

    fn failure_class(&self) -> FailureClass {
        FailureClass::Retryable
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<()> {
        let ciphertext = ctx
            .artifacts
            .ciphertext
            .clone()
            .ok_or_else(|| missing_artifact("ciphertext"))?;
        let digest = ctx.artifacts.archive.as_ref().map(|a| a.integrity.hex_digest.clone());
        let size = tokio::fs::metadata(&ciphertext).await?.len();

        let request = PublishRequest {
            local_path: &ciphertext,
            name: &ctx.job.artifact_name,
            folder: &ctx.job.folder_id,
            policy: ctx.job.retention,
            sha256: digest.as_deref(),
        };
        let progress = logging_callback(format!("Uploading {}", ctx.job.artifact_name), size);
        let outcome = self.retention.publish(&request, progress, &ctx.cancel).await?;

        if let Some(e) = outcome.eviction_error() {
            warn!(job_id = %ctx.job.job_id, "Published, but retention is not satisfied: {}", e);
        }
        ctx.remote_file = Some(outcome.file.clone());
        ctx.publish = Some(outcome);
        Ok(())
    }
}

pub struct FetchStage {
    retention: Arc<RetentionManager>,
    source: RestoreSource,
}

impl FetchStage {
    pub fn new(retention: Arc<RetentionManager>, source: RestoreSource) -> Self {
        Self { retention, source }
    }

    async fn download(&self, file: &RemoteFile, dest: &Path, cancel: &CancellationToken) -> Result<PathBuf> {
        let bytes = self.retention.store().download(&file.id, dest, cancel).await?;
        info!("Fetched {} ({}, {} bytes)", file.name, file.id, bytes);
        Ok(dest.to_path_buf())
    }
}

#[async_trait]
impl StageExecutor for FetchStage {
    fn name(&self) -> StageName {
        StageName::Fetching
    }

    fn failure_class(&self) -> FailureClass {
        FailureClass::Retryable
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<()> {
        tokio::fs::create_dir_all(&ctx.job.work_dir).await?;

        let (ciphertext, remote, local_report) = match &self.source {
            RestoreSource::LocalArtifact(path) => {
                if !path.is_file() {
                    return Err(GBackupError::InvalidTarget {
                        target: path.display().to_string(),
                        message: "local artifact does not exist".to_string(),
                    });
                }
                let report = path.with_file_name("hash.txt");
                (path.clone(), None, Some(report))
            }
            RestoreSource::RemoteId(id) => {
                let file = self.retention.store().get(id).await?;
                let dest = self.download(&file, &ctx.job.cipher_path(), &ctx.cancel).await?;
                (dest, Some(file), None)
            }
            RestoreSource::Latest => {
                let file = self
                    .retention
                    .latest(&ctx.job.artifact_name, &ctx.job.folder_id, ctx.job.retention)
                    .await?
                    .ok_or_else(|| GBackupError::InvalidTarget {
                        target: ctx.job.artifact_name.clone(),
                        message: format!("no copy found in folder {}", ctx.job.folder_id),
                    })?;
                let dest = self.download(&file, &ctx.job.cipher_path(), &ctx.cancel).await?;
                (dest, Some(file), None)
            }
        };

        // Remote copies carry their digest as metadata; a local artifact may
        // have the hash report written next to it by the backup.
        ctx.expected_digest = match (&remote, local_report) {
            (Some(file), _) => file.sha256.clone(),
            (None, Some(report)) => local_digest(&report),
            (None, None) => None,
        };
        ctx.artifacts.ciphertext = Some(ciphertext);
        ctx.remote_file = remote;
        Ok(())
    }
}

fn local_digest(report: &Path) -> Option<String> {
    if !report.is_file() {
        return None;
    }
    match integrity::load_report(report) {
        Ok(record) => Some(record.hex_digest),
        Err(e) => {
            warn!("Ignoring unreadable hash report {}: {}", report.display(), e);
            None
        }
    }
}

pub struct DecryptStage;

#[async_trait]
impl StageExecutor for DecryptStage {
    fn name(&self) -> StageName {
        StageName::Decrypting
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<()> {
        let ciphertext = ctx
            .artifacts
            .ciphertext
            .clone()
            .ok_or_else(|| missing_artifact("ciphertext"))?;
        let plain = ctx.job.archive_path();
        let key = ctx.job.key.clone();
        blocking(move || cipher::decrypt(&ciphertext, &plain, &key)).await?;
        Ok(())
    }
}

pub struct VerifyStage;

#[async_trait]
impl StageExecutor for VerifyStage {
    fn name(&self) -> StageName {
        StageName::VerifyingIntegrity
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<()> {
        let archive = ctx.job.archive_path();
        let buffer_size = ctx.job.hash_buffer_size;
        let expected = ctx.expected_digest.clone();

        let (record, size, matched) = {
            let archive = archive.clone();
            blocking(move || {
                let mut verifier = IntegrityVerifier::with_buffer_size(buffer_size)?;
                let record = verifier.digest(&archive)?;
                let matched = expected.as_deref().map(|e| verifier.verify(e));
                Ok((record, std::fs::metadata(&archive)?.len(), matched))
            })
            .await?
        };

        match (matched, &ctx.expected_digest) {
            (Some(false), Some(expected)) => {
                return Err(GBackupError::IntegrityMismatch {
                    expected: expected.clone(),
                    actual: record.hex_digest,
                });
            }
            (Some(true), _) => info!(job_id = %ctx.job.job_id, "Integrity verified: {}", record.hex_digest),
            _ => warn!(
                job_id = %ctx.job.job_id,
                "No recorded digest for this artifact; integrity not verified ({})",
                record.hex_digest
            ),
        }

        ctx.integrity_verified = Some(matched.unwrap_or(false));
        ctx.artifacts.archive = Some(ArtifactRecord {
            path: archive,
            size,
            integrity: record,
        });
        Ok(())
    }
}

pub struct UnpackStage;

#[async_trait]
impl StageExecutor for UnpackStage {
    fn name(&self) -> StageName {
        StageName::Unpacking
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<()> {
        let archive = ctx
            .artifacts
            .archive
            .as_ref()
            .map(|a| a.path.clone())
            .ok_or_else(|| missing_artifact("verified archive"))?;
        let restore_dir = ctx.job.restore_dir();
        // A previous restore in this working directory is replaced, not merged.
        if tokio::fs::try_exists(&restore_dir).await? {
            tokio::fs::remove_dir_all(&restore_dir).await?;
        }
        let out = restore_dir.clone();
        blocking(move || archive::unpack(&archive, &out)).await?;
        ctx.artifacts.restore_dir = Some(restore_dir);
        Ok(())
    }
}

pub struct RestoreStage {
    tools: MongoTools,
}

impl RestoreStage {
    pub fn new(tools: MongoTools) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl StageExecutor for RestoreStage {
    fn name(&self) -> StageName {
        StageName::Restoring
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<()> {
        self.tools
            .restore(&ctx.job.database, &ctx.job.restore_source())
            .await
    }
}
