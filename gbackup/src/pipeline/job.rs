//! Job descriptions: what one pipeline run operates on.

use crate::cipher::CipherKey;
use crate::remote::RetentionPolicy;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Database login. Only passed to the dump/restore tools, never inspected.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub auth_db: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("auth_db", &self.auth_db)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseLocator {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub credentials: Option<Credentials>,
}

impl DatabaseLocator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 27017,
            name: name.into(),
            credentials: None,
        }
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Where a restore takes its encrypted artifact from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    /// Newest remote copy matching the artifact name under the job's policy
    Latest,
    /// A specific remote file
    RemoteId(String),
    /// An encrypted artifact already on local disk
    LocalArtifact(PathBuf),
}

/// One end-to-end run. Immutable once built.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub job_id: String,
    pub database: DatabaseLocator,
    pub work_dir: PathBuf,
    pub artifact_name: String,
    pub folder_id: String,
    pub retention: RetentionPolicy,
    pub key: Arc<CipherKey>,
    pub hash_buffer_size: usize,
}

impl BackupJob {
    pub fn new(
        database: DatabaseLocator,
        work_dir: impl Into<PathBuf>,
        artifact_name: impl Into<String>,
        folder_id: impl Into<String>,
        retention: RetentionPolicy,
        key: Arc<CipherKey>,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            database,
            work_dir: work_dir.into(),
            artifact_name: artifact_name.into(),
            folder_id: folder_id.into(),
            retention,
            key,
            hash_buffer_size: crate::integrity::DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_hash_buffer_size(mut self, size: usize) -> Self {
        self.hash_buffer_size = size;
        self
    }

    /// Raw dump output (`<work>/dump`, one sub-directory per database)
    pub fn dump_dir(&self) -> PathBuf {
        self.work_dir.join("dump")
    }

    /// Packed archive of the dump directory
    pub fn archive_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}.tar.zst", self.database.name))
    }

    /// Encrypted archive, the artifact that leaves the machine
    pub fn cipher_path(&self) -> PathBuf {
        self.work_dir.join(&self.artifact_name)
    }

    pub fn hash_report_path(&self) -> PathBuf {
        self.work_dir.join("hash.txt")
    }

    /// Where a restore unpacks the archive
    pub fn restore_dir(&self) -> PathBuf {
        self.work_dir.join("restore")
    }

    /// Database directory inside an unpacked archive
    pub fn restore_source(&self) -> PathBuf {
        self.restore_dir().join("dump").join(&self.database.name)
    }
}
