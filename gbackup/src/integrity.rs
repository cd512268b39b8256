//! SHA-256 stamping and verification of artifacts.
//!
//! Artifacts are streamed through a fixed-size buffer so memory use does not
//! depend on artifact size. The verifier remembers only its most recent record.

use crate::utils::errors::{GBackupError, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Default read buffer (64 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

pub const ALGORITHM: &str = "sha256";

const REPORT_TITLE: &str = "GBackup File Hash";
const REPORT_SEPARATOR: &str = "--------------------------------------";
const CHECKSUM_PREFIX: &str = "SHA256 Checksum: ";
const GENERATED_PREFIX: &str = "Generated at: ";
const GENERATED_SUFFIX: &str = " (local)";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityRecord {
    pub algorithm: String,
    pub hex_digest: String,
    pub generated_at: DateTime<Local>,
}

#[derive(Debug)]
pub struct IntegrityVerifier {
    buffer_size: usize,
    last: Option<IntegrityRecord>,
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            last: None,
        }
    }

    pub fn with_buffer_size(buffer_size: usize) -> Result<Self> {
        let mut verifier = Self::new();
        verifier.set_buffer_size(buffer_size)?;
        Ok(verifier)
    }

    pub fn set_buffer_size(&mut self, buffer_size: usize) -> Result<()> {
        if buffer_size == 0 {
            return Err(GBackupError::Config("hash buffer size must be non-zero".into()));
        }
        self.buffer_size = buffer_size;
        Ok(())
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn last_record(&self) -> Option<&IntegrityRecord> {
        self.last.as_ref()
    }

    /// Hash `path` and replace the remembered record.
    pub fn digest(&mut self, path: &Path) -> Result<IntegrityRecord> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        let record = IntegrityRecord {
            algorithm: ALGORITHM.to_string(),
            hex_digest: hex::encode(hasher.finalize()),
            generated_at: Local::now(),
        };
        self.last = Some(record.clone());
        Ok(record)
    }

    /// Compare against the most recent digest. False when nothing was computed yet.
    pub fn verify(&self, expected_hex: &str) -> bool {
        self.last
            .as_ref()
            .is_some_and(|r| r.hex_digest.eq_ignore_ascii_case(expected_hex.trim()))
    }

    /// Write the human-readable report for the most recent digest.
    pub fn save(&self, path: &Path) -> Result<()> {
        let record = self.last.as_ref().ok_or_else(|| {
            GBackupError::Config("no digest has been computed yet".to_string())
        })?;
        std::fs::write(path, render_report(record))?;
        Ok(())
    }
}

pub fn render_report(record: &IntegrityRecord) -> String {
    format!(
        "{REPORT_TITLE}\n{REPORT_SEPARATOR}\n{CHECKSUM_PREFIX}{}\n{GENERATED_PREFIX}{}{GENERATED_SUFFIX}",
        record.hex_digest,
        record.generated_at.format(TIMESTAMP_FORMAT),
    )
}

/// Read a report written by [`IntegrityVerifier::save`].
pub fn load_report(path: &Path) -> Result<IntegrityRecord> {
    let content = std::fs::read_to_string(path)?;
    parse_report(&content)
}

pub fn parse_report(content: &str) -> Result<IntegrityRecord> {
    let malformed = |what: &str| GBackupError::Config(format!("malformed hash report: {what}"));

    let hex_digest = content
        .lines()
        .find_map(|l| l.strip_prefix(CHECKSUM_PREFIX))
        .map(|s| s.trim().to_string())
        .ok_or_else(|| malformed("missing checksum line"))?;

    let stamp = content
        .lines()
        .find_map(|l| l.strip_prefix(GENERATED_PREFIX))
        .map(|s| s.trim_end_matches(GENERATED_SUFFIX).trim())
        .ok_or_else(|| malformed("missing timestamp line"))?;
    let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .map_err(|e| malformed(&e.to_string()))?;
    let generated_at = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| malformed("timestamp does not exist in local time"))?;

    Ok(IntegrityRecord {
        algorithm: ALGORITHM.to_string(),
        hex_digest,
        generated_at,
    })
}
