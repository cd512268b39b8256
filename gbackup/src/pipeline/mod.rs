//! Backup and restore orchestration.
//!
//! A [`Pipeline`] is a flat, statically ordered list of [`StageExecutor`]s.
//! Stages run one at a time against a shared [`StageContext`]; the first
//! failure moves the job to [`JobState::Failed`] and nothing after it runs.
//! Cancellation is checked at every stage boundary. Artifacts written by
//! completed stages stay on disk whatever the outcome.

pub mod batch;
pub mod job;
pub mod stages;

use crate::integrity::IntegrityRecord;
use crate::preflight::Preflight;
use crate::remote::{PublishOutcome, RemoteFile, RetentionManager};
use crate::tools::MongoTools;
use crate::utils::errors::{GBackupError, Result};
use async_trait::async_trait;
use job::{BackupJob, RestoreSource};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StageName {
    Preflighting,
    Dumping,
    Packing,
    Stamping,
    Encrypting,
    Publishing,
    Fetching,
    Decrypting,
    VerifyingIntegrity,
    Unpacking,
    Restoring,
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Transient; re-running the job may succeed
    Retryable,
    Fatal,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Retryable => write!(f, "retryable"),
            FailureClass::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running(StageName),
    Done,
    Failed { stage: StageName, cause: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running(_))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Running(stage) => write!(f, "{stage}"),
            JobState::Done => write!(f, "Done"),
            JobState::Failed { stage, cause } => write!(f, "Failed({stage}: {cause})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Restore,
}

#[derive(Debug, Error)]
#[error("stage {stage} failed ({class}): {cause}")]
pub struct PipelineFailure {
    pub stage: StageName,
    pub class: FailureClass,
    #[source]
    pub cause: GBackupError,
}

/// A stage artifact with its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub path: PathBuf,
    pub size: u64,
    pub integrity: IntegrityRecord,
}

/// Local files produced so far. Paths are only set once the file exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifacts {
    pub dump_dir: Option<PathBuf>,
    pub archive: Option<ArtifactRecord>,
    pub hash_report: Option<PathBuf>,
    pub ciphertext: Option<PathBuf>,
    pub restore_dir: Option<PathBuf>,
}

/// Mutable state threaded through the stages of one job.
#[derive(Debug)]
pub struct StageContext {
    pub job: BackupJob,
    pub cancel: CancellationToken,
    pub artifacts: Artifacts,
    /// Digest a restore must match, when one is known
    pub expected_digest: Option<String>,
    pub integrity_verified: Option<bool>,
    pub remote_file: Option<RemoteFile>,
    pub publish: Option<PublishOutcome>,
}

impl StageContext {
    pub fn new(job: BackupJob, cancel: CancellationToken) -> Self {
        Self {
            job,
            cancel,
            artifacts: Artifacts::default(),
            expected_digest: None,
            integrity_verified: None,
            remote_file: None,
            publish: None,
        }
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(GBackupError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn name(&self) -> StageName;

    /// Declared class of this stage's failures. Retryable stages may retry
    /// internally; the orchestrator never does.
    fn failure_class(&self) -> FailureClass {
        FailureClass::Fatal
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<()>;
}

/// Collaborators shared by every job of a run.
#[derive(Clone)]
pub struct PipelineEnv {
    pub tools: MongoTools,
    pub preflight: Arc<Preflight>,
    pub retention: Arc<RetentionManager>,
}

impl PipelineEnv {
    pub fn new(tools: MongoTools, retention: Arc<RetentionManager>) -> Self {
        Self {
            preflight: Arc::new(Preflight::new(tools.clone())),
            tools,
            retention,
        }
    }

    pub fn with_preflight(mut self, preflight: Preflight) -> Self {
        self.preflight = Arc::new(preflight);
        self
    }
}

pub struct Pipeline {
    kind: JobKind,
    stages: Vec<Box<dyn StageExecutor>>,
}

impl Pipeline {
    pub fn new(kind: JobKind, stages: Vec<Box<dyn StageExecutor>>) -> Self {
        Self { kind, stages }
    }

    /// Preflight, dump, pack, stamp, encrypt, publish.
    pub fn backup(env: &PipelineEnv) -> Self {
        Self::new(
            JobKind::Backup,
            vec![
                Box::new(stages::PreflightStage::new(env.preflight.clone())),
                Box::new(stages::DumpStage::new(env.tools.clone())),
                Box::new(stages::PackStage),
                Box::new(stages::StampStage),
                Box::new(stages::EncryptStage),
                Box::new(stages::PublishStage::new(env.retention.clone())),
            ],
        )
    }

    /// Preflight, fetch, decrypt, verify, unpack, restore.
    pub fn restore(env: &PipelineEnv, source: RestoreSource) -> Self {
        Self::new(
            JobKind::Restore,
            vec![
                Box::new(stages::PreflightStage::new(env.preflight.clone())),
                Box::new(stages::FetchStage::new(env.retention.clone(), source)),
                Box::new(stages::DecryptStage),
                Box::new(stages::VerifyStage),
                Box::new(stages::UnpackStage),
                Box::new(stages::RestoreStage::new(env.tools.clone())),
            ],
        )
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn stage_names(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, job: BackupJob, cancel: CancellationToken) -> JobReport {
        let started = Instant::now();
        let job_id = job.job_id.clone();
        let database = job.database.name.clone();
        let mut ctx = StageContext::new(job, cancel);
        let mut transitions = Vec::with_capacity(self.stages.len() + 1);
        let mut failure = None;

        info!(job_id = %job_id, database = %database, "Starting {:?} job", self.kind);

        for stage in &self.stages {
            let name = stage.name();
            let outcome = match ctx.check_cancelled() {
                Ok(()) => {
                    transitions.push(JobState::Running(name));
                    info!(job_id = %job_id, database = %database, stage = %name, "Entering stage");
                    stage.run(&mut ctx).await
                }
                Err(e) => Err(e),
            };

            if let Err(cause) = outcome {
                let class = stage.failure_class();
                error!(
                    job_id = %job_id,
                    database = %database,
                    stage = %name,
                    "Job failed ({}): {}",
                    class,
                    cause
                );
                transitions.push(JobState::Failed {
                    stage: name,
                    cause: cause.to_string(),
                });
                failure = Some(PipelineFailure {
                    stage: name,
                    class,
                    cause,
                });
                break;
            }
        }

        if failure.is_none() {
            transitions.push(JobState::Done);
        }
        let duration = started.elapsed();
        info!(
            job_id = %job_id,
            database = %database,
            "Job finished in {:.1}s: {}",
            duration.as_secs_f64(),
            transitions.last().map(|s| s.to_string()).unwrap_or_default()
        );

        JobReport {
            job_id,
            database,
            kind: self.kind,
            transitions,
            failure,
            artifacts: ctx.artifacts,
            integrity_verified: ctx.integrity_verified,
            remote_file: ctx.remote_file,
            publish: ctx.publish,
            duration,
        }
    }
}

#[derive(Debug)]
pub struct JobReport {
    pub job_id: String,
    pub database: String,
    pub kind: JobKind,
    /// Every state entered, ending with `Done` or `Failed`
    pub transitions: Vec<JobState>,
    pub failure: Option<PipelineFailure>,
    pub artifacts: Artifacts,
    /// Restore only: whether the fetched archive matched a known digest
    pub integrity_verified: Option<bool>,
    pub remote_file: Option<RemoteFile>,
    pub publish: Option<PublishOutcome>,
    pub duration: Duration,
}

impl JobReport {
    pub fn state(&self) -> Option<&JobState> {
        self.transitions.last()
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.state(), Some(JobState::Done))
    }

    pub fn reached(&self, stage: StageName) -> bool {
        self.transitions.contains(&JobState::Running(stage))
    }

    pub fn integrity(&self) -> Option<&IntegrityRecord> {
        self.artifacts.archive.as_ref().map(|a| &a.integrity)
    }

    /// Eviction problems after a successful upload
    pub fn eviction_error(&self) -> Option<GBackupError> {
        self.publish.as_ref().and_then(|p| p.eviction_error())
    }

    pub fn into_result(self) -> std::result::Result<JobReport, PipelineFailure> {
        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(self),
        }
    }
}
