//! Configuration management for gbackup.
//!
//! Loads configuration from a TOML file. Secrets are never stored in the file
//! itself: the file names the environment variables (or key/token files) that
//! hold them, and `.env` is loaded first so those variables can live there.

use crate::cipher::CipherKey;
use crate::pipeline::job::{Credentials, DatabaseLocator};
use crate::remote::RetentionPolicy;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub cipher: CipherConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of the per-job working directories
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Read buffer used while hashing artifacts
    #[serde(default = "default_hash_buffer_size")]
    pub hash_buffer_size: usize,

    /// Maximum number of database jobs in flight at once
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CipherConfig {
    /// File holding the base64 encoded key
    pub key_file: Option<PathBuf>,

    /// Environment variable holding the base64 encoded key
    pub key_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Metadata API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Upload API base URL
    #[serde(default = "default_upload_url")]
    pub upload_url: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// File holding the bearer token (takes precedence over `token_env`)
    pub token_file: Option<PathBuf>,

    /// Resumable upload chunk size in bytes (multiple of 256 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Retries per chunk on transient failures
    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database name
    pub name: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: Option<String>,

    /// Environment variable holding the password
    pub password_env: Option<String>,

    /// Database the user authenticates against
    pub auth_db: Option<String>,

    /// Remote artifact name; defaults to `<name>.tar.zst.enc`
    pub artifact_name: Option<String>,

    /// Remote folder identifier
    pub folder_id: String,

    #[serde(default)]
    pub retention: RetentionPolicy,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/gbackup")
}

fn default_hash_buffer_size() -> usize {
    64 * 1024
}

fn default_max_concurrent_jobs() -> usize {
    1
}

fn default_api_url() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}

fn default_upload_url() -> String {
    "https://www.googleapis.com/upload/drive/v3".to_string()
}

fn default_token_env() -> String {
    "GBACKUP_DRIVE_TOKEN".to_string()
}

fn default_chunk_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_max_chunk_retries() -> u32 {
    3
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    27017
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            hash_buffer_size: default_hash_buffer_size(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            upload_url: default_upload_url(),
            token_env: default_token_env(),
            token_file: None,
            chunk_size: default_chunk_size(),
            max_chunk_retries: default_max_chunk_retries(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pipeline.hash_buffer_size == 0 {
            bail!("pipeline.hash_buffer_size must be greater than zero");
        }
        if self.pipeline.max_concurrent_jobs == 0 {
            bail!("pipeline.max_concurrent_jobs must be greater than zero");
        }
        if self.remote.chunk_size == 0 || self.remote.chunk_size % (256 * 1024) != 0 {
            bail!("remote.chunk_size must be a non-zero multiple of 256 KiB");
        }
        for db in &self.databases {
            if let RetentionPolicy::KeepNewest { keep: 0 } = db.retention {
                bail!("database {}: keep-newest retention needs keep >= 1", db.name);
            }
            if db.folder_id.is_empty() {
                bail!("database {}: folder_id is required", db.name);
            }
        }
        // keep-newest evicts by folder, so it would remove another database's generations
        for db in &self.databases {
            if !matches!(db.retention, RetentionPolicy::KeepNewest { .. }) {
                continue;
            }
            if let Some(other) = self
                .databases
                .iter()
                .find(|o| o.name != db.name && o.folder_id == db.folder_id)
            {
                bail!(
                    "database {}: keep-newest retention needs a folder of its own, but {} shares folder {}",
                    db.name,
                    other.name,
                    db.folder_id
                );
            }
        }
        let mut names: Vec<&str> = self.databases.iter().map(|d| d.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            bail!("database names must be unique (each owns its working directory)");
        }
        Ok(())
    }

    /// Look up a configured database by name
    pub fn database(&self, name: &str) -> anyhow::Result<&DatabaseConfig> {
        self.databases
            .iter()
            .find(|d| d.name == name)
            .with_context(|| format!("database {} is not configured", name))
    }

    /// Working directory owned by one database's jobs
    pub fn job_dir(&self, database: &str) -> PathBuf {
        self.pipeline.work_dir.join(database)
    }
}

impl CipherConfig {
    /// Load the caller-supplied key. Never generates one.
    pub fn load_key(&self) -> anyhow::Result<CipherKey> {
        if let Some(path) = &self.key_file {
            return CipherKey::from_file(path)
                .with_context(|| format!("loading key from {}", path.display()));
        }
        if let Some(var) = &self.key_env {
            let encoded = std::env::var(var)
                .with_context(|| format!("environment variable {} is not set", var))?;
            return Ok(CipherKey::from_base64(&encoded)?);
        }
        bail!("no cipher key configured: set cipher.key_file or cipher.key_env (use `gbackup keygen` to create one)")
    }
}

impl RemoteConfig {
    pub fn access_token(&self) -> anyhow::Result<String> {
        if let Some(path) = &self.token_file {
            let token = std::fs::read_to_string(path)
                .with_context(|| format!("reading token file {}", path.display()))?;
            return Ok(token.trim().to_string());
        }
        std::env::var(&self.token_env)
            .with_context(|| format!("environment variable {} is not set", self.token_env))
    }
}

impl DatabaseConfig {
    pub fn artifact_name(&self) -> String {
        self.artifact_name
            .clone()
            .unwrap_or_else(|| format!("{}.tar.zst.enc", self.name))
    }

    /// Resolve the locator, reading the password from its environment variable
    pub fn locator(&self) -> anyhow::Result<DatabaseLocator> {
        let password = match &self.password_env {
            Some(var) => Some(
                std::env::var(var)
                    .with_context(|| format!("environment variable {} is not set", var))?,
            ),
            None => None,
        };

        let credentials = match (&self.username, password, &self.auth_db) {
            (Some(username), Some(password), Some(auth_db)) => Some(Credentials {
                username: username.clone(),
                password,
                auth_db: auth_db.clone(),
            }),
            (None, None, None) => None,
            _ => bail!(
                "database {}: username, password_env and auth_db must be set together",
                self.name
            ),
        };

        Ok(DatabaseLocator {
            host: self.host.clone(),
            port: self.port,
            name: self.name.clone(),
            credentials,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[log]
level = "debug"

[pipeline]
work_dir = "/tmp/gbackup"

[cipher]
key_env = "GBACKUP_KEY"

[[databases]]
name = "orders"
folder_id = "folder-1"
retention = { policy = "keep-newest", keep = 3 }

[[databases]]
name = "users"
host = "db.internal"
port = 27018
folder_id = "folder-2"
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.pipeline.hash_buffer_size, 64 * 1024);
        assert_eq!(config.databases.len(), 2);

        let orders = config.database("orders").unwrap();
        assert_eq!(orders.host, "localhost");
        assert_eq!(orders.port, 27017);
        assert_eq!(orders.retention, RetentionPolicy::KeepNewest { keep: 3 });
        assert_eq!(orders.artifact_name(), "orders.tar.zst.enc");

        let users = config.database("users").unwrap();
        assert_eq!(users.retention, RetentionPolicy::OverwriteByName);
        assert_eq!(config.job_dir("users"), PathBuf::from("/tmp/gbackup/users"));
    }

    #[test]
    fn test_keep_zero_rejected() {
        let text = r#"
[[databases]]
name = "orders"
folder_id = "f"
retention = { policy = "keep-newest", keep = 0 }
"#;
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn test_keep_newest_folder_must_not_be_shared() {
        let shared = r#"
[[databases]]
name = "orders"
folder_id = "common"
retention = { policy = "keep-newest", keep = 3 }

[[databases]]
name = "users"
folder_id = "common"
"#;
        let err = Config::parse(shared).unwrap_err();
        assert!(err.to_string().contains("folder of its own"));

        // Overwrite-by-name only touches its own file name
        let overwrite = r#"
[[databases]]
name = "orders"
folder_id = "common"

[[databases]]
name = "users"
folder_id = "common"
"#;
        assert!(Config::parse(overwrite).is_ok());
    }

    #[test]
    fn test_duplicate_database_rejected() {
        let text = r#"
[[databases]]
name = "orders"
folder_id = "a"

[[databases]]
name = "orders"
folder_id = "b"
"#;
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn test_partial_credentials_rejected() {
        let db = DatabaseConfig {
            name: "orders".to_string(),
            host: default_host(),
            port: default_port(),
            username: Some("admin".to_string()),
            password_env: None,
            auth_db: None,
            artifact_name: None,
            folder_id: "f".to_string(),
            retention: RetentionPolicy::OverwriteByName,
        };
        assert!(db.locator().is_err());
    }

    #[test]
    fn test_locator_without_credentials() {
        let db = DatabaseConfig {
            name: "orders".to_string(),
            host: "db".to_string(),
            port: 27000,
            username: None,
            password_env: None,
            auth_db: None,
            artifact_name: Some("nightly.enc".to_string()),
            folder_id: "f".to_string(),
            retention: RetentionPolicy::OverwriteByName,
        };
        let locator = db.locator().unwrap();
        assert_eq!(locator.host, "db");
        assert!(locator.credentials.is_none());
        assert_eq!(db.artifact_name(), "nightly.enc");
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let cipher = CipherConfig::default();
        assert!(cipher.load_key().is_err());
    }
}
