//! GBackup - Main entry point
//!
//! Dump, archive, stamp, encrypt and publish databases to a remote store, or
//! run the mirrored restore.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gbackup::cipher::CipherKey;
use gbackup::config::{Config, DatabaseConfig};
use gbackup::daemon::shutdown::ShutdownCoordinator;
use gbackup::integrity::IntegrityVerifier;
use gbackup::pipeline::batch::run_batch;
use gbackup::pipeline::job::{BackupJob, RestoreSource};
use gbackup::preflight::{Preflight, Readiness};
use gbackup::remote::{DriveStore, RetentionManager};
use gbackup::tools::{MongoTools, ProcessRunner};
use gbackup::{utils, JobReport, Pipeline, PipelineEnv};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check tools, connectivity and credentials
    Preflight {
        /// Only this database
        #[arg(long)]
        db: Option<String>,
    },
    /// Back up one or all configured databases
    Backup {
        /// Only this database
        #[arg(long)]
        db: Option<String>,
    },
    /// Restore a database from its newest remote copy
    Restore {
        #[arg(long)]
        db: String,

        /// Restore this remote file instead of the newest copy
        #[arg(long, conflicts_with = "from")]
        remote_id: Option<String>,

        /// Restore a local encrypted artifact
        #[arg(long, value_name = "FILE")]
        from: Option<PathBuf>,
    },
    /// Generate a new cipher key
    Keygen {
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
    },
    /// Compute the SHA-256 of a file
    Digest {
        file: PathBuf,

        /// Also write the hash report here
        #[arg(long, value_name = "PATH")]
        save: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("gbackup v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Preflight { db } => preflight(&config, db.as_deref()).await,
        Command::Backup { db } => backup(&config, db.as_deref()).await,
        Command::Restore { db, remote_id, from } => {
            let source = match (remote_id, from) {
                (Some(id), _) => RestoreSource::RemoteId(id),
                (None, Some(path)) => RestoreSource::LocalArtifact(path),
                (None, None) => RestoreSource::Latest,
            };
            restore(&config, &db, source).await
        }
        Command::Keygen { out } => {
            CipherKey::generate_to(&out)?;
            println!("Key written to {}. Store a copy somewhere safe: without it no backup can be decrypted.", out.display());
            Ok(())
        }
        Command::Digest { file, save } => {
            let mut verifier = IntegrityVerifier::with_buffer_size(config.pipeline.hash_buffer_size)?;
            let record = verifier
                .digest(&file)
                .with_context(|| format!("hashing {}", file.display()))?;
            println!("{}  {}", record.hex_digest, file.display());
            if let Some(path) = save {
                verifier.save(&path)?;
                println!("Report written to {}", path.display());
            }
            Ok(())
        }
    }
}

fn selected<'a>(config: &'a Config, db: Option<&str>) -> Result<Vec<&'a DatabaseConfig>> {
    match db {
        Some(name) => Ok(vec![config.database(name)?]),
        None if config.databases.is_empty() => bail!("no databases configured"),
        None => Ok(config.databases.iter().collect()),
    }
}

fn tools() -> MongoTools {
    MongoTools::new(Arc::new(ProcessRunner))
}

async fn environment(config: &Config) -> Result<PipelineEnv> {
    let token = config.remote.access_token()?;
    let store = DriveStore::connect(&config.remote, token)
        .await
        .context("remote store is not reachable")?;
    let retention = Arc::new(RetentionManager::new(Arc::new(store)));
    Ok(PipelineEnv::new(tools(), retention))
}

fn job_for(config: &Config, db: &DatabaseConfig, key: Arc<CipherKey>) -> Result<BackupJob> {
    Ok(BackupJob::new(
        db.locator()?,
        config.job_dir(&db.name),
        db.artifact_name(),
        db.folder_id.clone(),
        db.retention,
        key,
    )
    .with_hash_buffer_size(config.pipeline.hash_buffer_size))
}

/// Cancel running jobs on SIGINT/SIGTERM.
fn install_shutdown() -> Arc<ShutdownCoordinator> {
    let coordinator = Arc::new(ShutdownCoordinator::new());
    let waiter = coordinator.clone();
    tokio::spawn(async move {
        waiter.wait_for_signal().await;
    });
    coordinator
}

async fn preflight(config: &Config, db: Option<&str>) -> Result<()> {
    let checker = Preflight::new(tools());
    let mut unready = 0;
    for database in selected(config, db)? {
        match checker.verify(&database.locator()?).await {
            Readiness::Ready => println!("{}: ready", database.name),
            Readiness::Unready(reason) => {
                unready += 1;
                println!("{}: unready: {}", database.name, reason);
            }
        }
    }
    if unready > 0 {
        bail!("{} database(s) not ready", unready);
    }
    Ok(())
}

async fn backup(config: &Config, db: Option<&str>) -> Result<()> {
    let key = Arc::new(config.cipher.load_key()?);
    let databases = selected(config, db)?;
    let jobs = databases
        .iter()
        .map(|d| job_for(config, d, key.clone()))
        .collect::<Result<Vec<_>>>()?;

    let env = environment(config).await?;
    let shutdown = install_shutdown();
    let entries = run_batch(
        Arc::new(Pipeline::backup(&env)),
        jobs,
        config.pipeline.max_concurrent_jobs,
        shutdown.token(),
    )
    .await?;

    let mut failed = 0;
    for entry in &entries {
        match &entry.result {
            Ok(report) => print_report(report),
            Err(e) => println!("{}: aborted: {}", entry.database, e),
        }
        if !entry.succeeded() {
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{} of {} backup(s) failed", failed, entries.len());
    }
    Ok(())
}

async fn restore(config: &Config, db: &str, source: RestoreSource) -> Result<()> {
    let key = Arc::new(config.cipher.load_key()?);
    let job = job_for(config, config.database(db)?, key)?;
    let env = environment(config).await?;
    let shutdown = install_shutdown();

    let report = Pipeline::restore(&env, source).run(job, shutdown.token()).await;
    print_report(&report);
    report.into_result()?;
    Ok(())
}

fn print_report(report: &JobReport) {
    let states: Vec<String> = report.transitions.iter().map(|s| s.to_string()).collect();
    println!(
        "{} [{}] {:?} in {:.1}s: {}",
        report.database,
        report.job_id,
        report.kind,
        report.duration.as_secs_f64(),
        states.join(" -> ")
    );
    if let Some(record) = report.integrity() {
        println!("  {}: {}", record.algorithm, record.hex_digest);
    }
    if let Some(verified) = report.integrity_verified {
        println!("  integrity verified: {}", verified);
    }
    if let Some(file) = &report.remote_file {
        println!("  remote: {} ({})", file.name, file.id);
    }
    if let Some(publish) = &report.publish {
        for file in &publish.eviction.deleted {
            println!("  evicted: {} ({})", file.name, file.id);
        }
    }
    if let Some(e) = report.eviction_error() {
        println!("  warning: {}", e);
    }
    if let Some(failure) = &report.failure {
        println!("  error: {}", failure);
        if let Some(archive) = &report.artifacts.archive {
            println!("  kept for inspection: {}", archive.path.display());
        }
    }
}
