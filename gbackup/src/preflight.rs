//! Preflight checks run before any stage that could mutate state.
//!
//! Order: dump tool version probe, restore tool version probe, TCP reachability,
//! then an authenticated no-op dump whose stderr is classified. Nothing is
//! retried; callers re-run the whole check after fixing the environment.

use crate::pipeline::job::DatabaseLocator;
use crate::tools::MongoTools;
use crate::utils::errors::{GBackupError, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{info, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Readiness {
    Ready,
    Unready(GBackupError),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Readiness::Ready => Ok(()),
            Readiness::Unready(reason) => Err(reason),
        }
    }
}

pub struct Preflight {
    tools: MongoTools,
    connect_timeout: Duration,
}

impl Preflight {
    pub fn new(tools: MongoTools) -> Self {
        Self {
            tools,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub async fn verify(&self, db: &DatabaseLocator) -> Readiness {
        match self.check(db).await {
            Ok(()) => {
                info!(database = %db.name, "Preflight passed for {}:{}", db.host, db.port);
                Readiness::Ready
            }
            Err(reason) => {
                warn!(database = %db.name, "Preflight failed: {}", reason);
                Readiness::Unready(reason)
            }
        }
    }

    async fn check(&self, db: &DatabaseLocator) -> Result<()> {
        for program in [self.tools.dump_program(), self.tools.restore_program()] {
            if !self.tools.probe_version(program).await {
                return Err(GBackupError::ToolUnavailable(program.to_string()));
            }
        }

        self.probe_tcp(db).await?;

        let output = self.tools.auth_probe(db).await.map_err(|e| {
            GBackupError::ToolUnavailable(format!("{} ({})", self.tools.dump_program(), e))
        })?;
        if output.success() {
            return Ok(());
        }
        Err(classify_probe_failure(db, &output.stderr))
    }

    /// The stream is dropped (and the socket closed) on every path out of here.
    async fn probe_tcp(&self, db: &DatabaseLocator) -> Result<()> {
        let unreachable = |detail: String| GBackupError::ConnectionUnreachable {
            host: db.host.clone(),
            port: db.port,
            detail,
        };

        match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((db.host.as_str(), db.port)),
        )
        .await
        {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(())
            }
            Ok(Err(e)) => Err(unreachable(e.to_string())),
            Err(_) => Err(unreachable(format!(
                "connect timed out after {}s",
                self.connect_timeout.as_secs()
            ))),
        }
    }
}

/// Map the dump tool's stderr from a failed probe onto the error taxonomy.
pub fn classify_probe_failure(db: &DatabaseLocator, stderr: &str) -> GBackupError {
    let text = stderr.to_lowercase();
    let has_credentials = db.credentials.is_some();
    let detail = stderr.trim().to_string();

    let auth_failed = ["authentication failed", "auth error", "sasl"]
        .iter()
        .any(|p| text.contains(p));
    let auth_needed = ["requires authentication", "not authorized", "unauthorized"]
        .iter()
        .any(|p| text.contains(p));
    let unreachable = [
        "no reachable servers",
        "connection refused",
        "server selection error",
        "error connecting",
        "timed out",
    ]
    .iter()
    .any(|p| text.contains(p));

    if (auth_failed || auth_needed) && has_credentials {
        GBackupError::AuthenticationRejected {
            host: db.host.clone(),
            port: db.port,
            detail,
        }
    } else if auth_failed || auth_needed {
        GBackupError::AuthenticationRequired {
            host: db.host.clone(),
            port: db.port,
        }
    } else if unreachable {
        GBackupError::ConnectionUnreachable {
            host: db.host.clone(),
            port: db.port,
            detail,
        }
    } else {
        GBackupError::UnexpectedToolFailure {
            tool: "preflight probe".to_string(),
            status: None,
            stderr: detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job::Credentials;
    use crate::testing::ScriptedRunner;
    use std::net::TcpListener;
    use std::sync::Arc;

    fn local_db(listener: &TcpListener) -> DatabaseLocator {
        let port = listener.local_addr().unwrap().port();
        DatabaseLocator::new("orders").with_address("127.0.0.1", port)
    }

    fn creds() -> Credentials {
        Credentials {
            username: "admin".to_string(),
            password: "wrong".to_string(),
            auth_db: "admin".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ready_when_everything_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let preflight = Preflight::new(MongoTools::new(runner.clone()));

        assert!(preflight.verify(&local_db(&listener)).await.is_ready());
        let programs: Vec<_> = runner.calls().into_iter().map(|(p, _)| p).collect();
        assert_eq!(programs, vec!["mongodump", "mongorestore", "mongodump"]);
    }

    #[tokio::test]
    async fn test_missing_dump_tool() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.missing("mongodump");
        let preflight = Preflight::new(MongoTools::new(runner));

        let result = preflight.verify(&DatabaseLocator::new("orders")).await.into_result();
        assert!(matches!(result, Err(GBackupError::ToolUnavailable(t)) if t == "mongodump"));
    }

    #[tokio::test]
    async fn test_failing_restore_tool() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("mongorestore", 127, "");
        let preflight = Preflight::new(MongoTools::new(runner));

        let result = preflight.verify(&DatabaseLocator::new("orders")).await.into_result();
        assert!(matches!(result, Err(GBackupError::ToolUnavailable(t)) if t == "mongorestore"));
    }

    #[tokio::test]
    async fn test_unreachable_port() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let runner = Arc::new(ScriptedRunner::new());
        let preflight = Preflight::new(MongoTools::new(runner))
            .with_connect_timeout(Duration::from_secs(1));

        let db = DatabaseLocator::new("orders").with_address("127.0.0.1", port);
        let result = preflight.verify(&db).await.into_result();
        assert!(matches!(result, Err(GBackupError::ConnectionUnreachable { .. })));
    }

    #[tokio::test]
    async fn test_auth_required_without_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail_when(
            "mongodump",
            "--collection",
            1,
            "Failed: error counting orders.x: (Unauthorized) command count requires authentication",
        );
        let preflight = Preflight::new(MongoTools::new(runner));

        let result = preflight.verify(&local_db(&listener)).await.into_result();
        assert!(matches!(result, Err(GBackupError::AuthenticationRequired { .. })));
    }

    #[tokio::test]
    async fn test_auth_rejected_with_bad_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail_when(
            "mongodump",
            "--collection",
            1,
            "Failed: can't create session: connection() error: auth error: sasl conversation error: Authentication failed.",
        );
        let preflight = Preflight::new(MongoTools::new(runner));

        let db = local_db(&listener).with_credentials(creds());
        let result = preflight.verify(&db).await.into_result();
        assert!(matches!(result, Err(GBackupError::AuthenticationRejected { .. })));
    }

    #[test]
    fn test_classify_unreachable_and_unknown() {
        let db = DatabaseLocator::new("orders");
        assert!(matches!(
            classify_probe_failure(&db, "server selection error: context deadline exceeded"),
            GBackupError::ConnectionUnreachable { .. }
        ));
        assert!(matches!(
            classify_probe_failure(&db, "something odd happened"),
            GBackupError::UnexpectedToolFailure { .. }
        ));
    }
}
