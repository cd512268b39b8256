//! GBackup Library
//!
//! Database backup pipeline: dump, archive, integrity-stamp, encrypt and
//! publish to a remote store under a retention policy, plus the mirrored
//! restore path.

pub mod archive;
pub mod cipher;
pub mod config;
pub mod daemon;
pub mod integrity;
pub mod pipeline;
pub mod preflight;
pub mod remote;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tools;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use pipeline::{JobReport, Pipeline, PipelineEnv};
pub use utils::errors::{GBackupError, Result};
