//! Independent jobs for several databases, bounded in parallelism.
//!
//! Each job owns its working directory; a batch that would share one between
//! two jobs is rejected before anything runs. One job failing never stops its
//! siblings.

use super::job::BackupJob;
use super::{JobReport, Pipeline};
use crate::utils::errors::{GBackupError, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Result for one database of a batch. `Err` only when the job task itself died.
#[derive(Debug)]
pub struct BatchEntry {
    pub database: String,
    pub result: Result<JobReport>,
}

impl BatchEntry {
    pub fn succeeded(&self) -> bool {
        matches!(&self.result, Ok(report) if report.succeeded())
    }
}

pub fn check_exclusive_work_dirs(jobs: &[BackupJob]) -> Result<()> {
    let mut seen = HashSet::new();
    for job in jobs {
        if !seen.insert(job.work_dir.clone()) {
            return Err(GBackupError::Config(format!(
                "working directory {} is shared by more than one job",
                job.work_dir.display()
            )));
        }
    }
    Ok(())
}

/// Run `jobs` through `pipeline` with at most `max_concurrent` in flight.
/// Entries come back in the order the jobs were given.
pub async fn run_batch(
    pipeline: Arc<Pipeline>,
    jobs: Vec<BackupJob>,
    max_concurrent: usize,
    cancel: CancellationToken,
) -> Result<Vec<BatchEntry>> {
    if max_concurrent == 0 {
        return Err(GBackupError::Config("max_concurrent_jobs must be at least 1".to_string()));
    }
    check_exclusive_work_dirs(&jobs)?;

    let databases: Vec<String> = jobs.iter().map(|j| j.database.name.clone()).collect();
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut set = JoinSet::new();

    info!(
        "Running {} {:?} job(s), at most {} at a time",
        jobs.len(),
        pipeline.kind(),
        max_concurrent
    );

    for (index, job) in jobs.into_iter().enumerate() {
        let pipeline = pipeline.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.child_token();
        set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return (index, Err(GBackupError::JobAborted(e.to_string()))),
            };
            (index, Ok(pipeline.run(job, cancel).await))
        });
    }

    let mut results: Vec<Option<Result<JobReport>>> = databases.iter().map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(e) => error!("Job task ended abnormally: {}", e),
        }
    }

    Ok(databases
        .into_iter()
        .zip(results)
        .map(|(database, result)| BatchEntry {
            result: result
                .unwrap_or_else(|| Err(GBackupError::JobAborted(format!("job for {database} did not complete")))),
            database,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherKey;
    use crate::pipeline::job::DatabaseLocator;
    use crate::pipeline::{JobKind, StageContext, StageExecutor, StageName};
    use crate::remote::RetentionPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Gauge {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StageExecutor for Gauge {
        fn name(&self) -> StageName {
            StageName::Dumping
        }

        async fn run(&self, ctx: &mut StageContext) -> Result<()> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            if ctx.job.database.name == "broken" {
                return Err(GBackupError::UnexpectedToolFailure {
                    tool: "mongodump".into(),
                    status: Some(1),
                    stderr: "boom".into(),
                });
            }
            Ok(())
        }
    }

    fn job(root: &TempDir, name: &str, dir: &str) -> BackupJob {
        BackupJob::new(
            DatabaseLocator::new(name),
            root.path().join(dir),
            format!("{name}.tar.zst.enc"),
            "folder",
            RetentionPolicy::OverwriteByName,
            Arc::new(CipherKey::from_bytes([3u8; 32])),
        )
    }

    #[tokio::test]
    async fn test_bounded_concurrency_and_isolation() {
        let root = TempDir::new().unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pipeline = Arc::new(Pipeline::new(
            JobKind::Backup,
            vec![Box::new(Gauge {
                current: current.clone(),
                peak: peak.clone(),
            })],
        ));
        let jobs = vec![
            job(&root, "a", "a"),
            job(&root, "broken", "broken"),
            job(&root, "c", "c"),
            job(&root, "d", "d"),
        ];

        let entries = run_batch(pipeline, jobs, 2, CancellationToken::new()).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);

        let names: Vec<&str> = entries.iter().map(|e| e.database.as_str()).collect();
        assert_eq!(names, vec!["a", "broken", "c", "d"]);
        let ok: Vec<bool> = entries.iter().map(|e| e.succeeded()).collect();
        assert_eq!(ok, vec![true, false, true, true]);
    }

    #[tokio::test]
    async fn test_shared_work_dir_rejected() {
        let root = TempDir::new().unwrap();
        let pipeline = Arc::new(Pipeline::new(JobKind::Backup, Vec::new()));
        let jobs = vec![job(&root, "a", "same"), job(&root, "b", "same")];
        let err = run_batch(pipeline, jobs, 2, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, GBackupError::Config(_)));
    }
}
