//! External dump/restore tool invocation.
//!
//! The tools are plain processes: success is exit status zero and stderr is
//! surfaced verbatim on failure. Everything goes through [`CommandRunner`] so
//! the pipeline can be driven by scripted runners in tests.

use crate::pipeline::job::DatabaseLocator;
use crate::utils::errors::{GBackupError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{debug, info};

pub const DUMP_TOOL: &str = "mongodump";
pub const RESTORE_TOOL: &str = "mongorestore";

/// Collection name used by the authentication probe; never expected to exist.
const PROBE_COLLECTION: &str = "__gbackup_preflight_probe__";

/// Captured result of one process call
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion. A program that cannot be spawned yields `Err`.
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs real processes with tokio. Children are killed if the future is dropped.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// The dump/restore tool pair for one database server
#[derive(Clone)]
pub struct MongoTools {
    runner: Arc<dyn CommandRunner>,
    dump_program: String,
    restore_program: String,
}

impl MongoTools {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            dump_program: DUMP_TOOL.to_string(),
            restore_program: RESTORE_TOOL.to_string(),
        }
    }

    pub fn dump_program(&self) -> &str {
        &self.dump_program
    }

    pub fn restore_program(&self) -> &str {
        &self.restore_program
    }

    /// `<program> --version` exits zero. Spawn failures count as unavailable.
    pub async fn probe_version(&self, program: &str) -> bool {
        match self.runner.run(program, &["--version".to_string()]).await {
            Ok(output) => output.success(),
            Err(e) => {
                debug!("{} could not be spawned: {}", program, e);
                false
            }
        }
    }

    /// Dump one database into `out_dir/<name>/`.
    pub async fn dump(&self, db: &DatabaseLocator, out_dir: &Path) -> Result<()> {
        let mut args = connection_args(db);
        args.push("--out".to_string());
        args.push(out_dir.display().to_string());
        args.extend(credential_args(db));

        info!("Executing: {} {}", self.dump_program, redacted(&args));
        let output = self.invoke(&self.dump_program, &args).await?;
        info!("Dump of {} written to {}", db.name, out_dir.display());
        debug!("{} stderr: {}", self.dump_program, output.stderr.trim());
        Ok(())
    }

    /// Restore one database from `source_dir`, which must already exist.
    pub async fn restore(&self, db: &DatabaseLocator, source_dir: &Path) -> Result<()> {
        if !source_dir.is_dir() {
            return Err(GBackupError::DirectoryNotFound(source_dir.to_path_buf()));
        }

        let mut args = connection_args(db);
        args.push(source_dir.display().to_string());
        args.extend(credential_args(db));

        info!("Executing: {} {}", self.restore_program, redacted(&args));
        self.invoke(&self.restore_program, &args).await?;
        info!("Restored {} from {}", db.name, source_dir.display());
        Ok(())
    }

    /// Dump a collection that does not exist to stdout. Cheap, but goes through
    /// the server's authentication and authorization checks.
    pub async fn auth_probe(&self, db: &DatabaseLocator) -> std::io::Result<CommandOutput> {
        let mut args = connection_args(db);
        args.push("--collection".to_string());
        args.push(PROBE_COLLECTION.to_string());
        args.push("--archive".to_string());
        args.push("--quiet".to_string());
        args.extend(credential_args(db));

        debug!("Executing probe: {} {}", self.dump_program, redacted(&args));
        self.runner.run(&self.dump_program, &args).await
    }

    async fn invoke(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = self.runner.run(program, args).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GBackupError::ToolUnavailable(program.to_string())
            } else {
                GBackupError::Io(e)
            }
        })?;

        if !output.success() {
            return Err(GBackupError::UnexpectedToolFailure {
                tool: program.to_string(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

fn connection_args(db: &DatabaseLocator) -> Vec<String> {
    vec![
        "--host".to_string(),
        db.host.clone(),
        "--port".to_string(),
        db.port.to_string(),
        "--db".to_string(),
        db.name.clone(),
    ]
}

fn credential_args(db: &DatabaseLocator) -> Vec<String> {
    match &db.credentials {
        Some(c) => vec![
            "--username".to_string(),
            c.username.clone(),
            "--password".to_string(),
            c.password.clone(),
            "--authenticationDatabase".to_string(),
            c.auth_db.clone(),
        ],
        None => Vec::new(),
    }
}

/// Join arguments for logging with the password masked.
fn redacted(args: &[String]) -> String {
    let mut out = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            out.push("****");
            mask_next = false;
        } else {
            mask_next = arg == "--password";
            out.push(arg.as_str());
        }
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job::Credentials;
    use crate::testing::ScriptedRunner;
    use tempfile::TempDir;

    fn secured() -> DatabaseLocator {
        DatabaseLocator::new("orders").with_credentials(Credentials {
            username: "admin".to_string(),
            password: "s3cret".to_string(),
            auth_db: "admin".to_string(),
        })
    }

    #[test]
    fn test_credential_args_only_when_present() {
        assert!(credential_args(&DatabaseLocator::new("orders")).is_empty());
        let args = credential_args(&secured());
        assert_eq!(args[0], "--username");
        assert_eq!(args[5], "admin");
    }

    #[test]
    fn test_redacted_masks_password() {
        let mut args = connection_args(&secured());
        args.extend(credential_args(&secured()));
        let line = redacted(&args);
        assert!(!line.contains("s3cret"));
        assert!(line.contains("--password ****"));
        assert!(line.contains("--port 27017"));
    }

    #[tokio::test]
    async fn test_dump_builds_expected_command() {
        let runner = Arc::new(ScriptedRunner::new());
        let tools = MongoTools::new(runner.clone());
        tools.dump(&secured(), Path::new("/tmp/out")).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        let (program, args) = &calls[0];
        assert_eq!(program, "mongodump");
        assert_eq!(
            &args[..8],
            &["--host", "localhost", "--port", "27017", "--db", "orders", "--out", "/tmp/out"]
        );
        assert!(args.contains(&"--authenticationDatabase".to_string()));
    }

    #[tokio::test]
    async fn test_tool_failure_surfaces_stderr() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("mongodump", 1, "Failed: error connecting to db server: no reachable servers");
        let tools = MongoTools::new(runner);

        let err = tools
            .dump(&DatabaseLocator::new("orders"), Path::new("/tmp/out"))
            .await
            .unwrap_err();
        match err {
            GBackupError::UnexpectedToolFailure { tool, stderr, status } => {
                assert_eq!(tool, "mongodump");
                assert_eq!(status, Some(1));
                assert!(stderr.contains("no reachable servers"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_restore_requires_existing_directory() {
        let runner = Arc::new(ScriptedRunner::new());
        let tools = MongoTools::new(runner.clone());
        let missing = Path::new("/definitely/not/here");

        let err = tools
            .restore(&DatabaseLocator::new("orders"), missing)
            .await
            .unwrap_err();
        assert!(matches!(err, GBackupError::DirectoryNotFound(_)));
        assert!(runner.calls().is_empty());

        let dir = TempDir::new().unwrap();
        tools
            .restore(&DatabaseLocator::new("orders"), dir.path())
            .await
            .unwrap();
        assert_eq!(runner.calls()[0].0, "mongorestore");
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.missing("mongodump");
        let tools = MongoTools::new(runner);
        assert!(!tools.probe_version("mongodump").await);
        assert!(tools.probe_version("mongorestore").await);
    }
}
