//! Symmetric encryption of single artifacts.
//!
//! AES-256-GCM in the STREAM construction (32-bit big-endian segment counter
//! plus last-segment flag), so artifacts of any size are processed in bounded
//! memory and truncation or reordering is detected. Layout:
//!
//! ```text
//! "GBK1" | nonce prefix (7 bytes) | sealed segment 0 | sealed segment 1 | ...
//! ```
//!
//! Keys are always supplied by the caller. The only way to create one is
//! [`CipherKey::generate_to`], which writes it to disk before returning it.

use crate::utils::errors::{GBackupError, Result};
use aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;
use aes_gcm::{Aes256Gcm, KeyInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const MAGIC: &[u8; 4] = b"GBK1";
const NONCE_PREFIX_LEN: usize = 7;
const SEGMENT_LEN: usize = 64 * 1024;
const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey([u8; KEY_LEN]);

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(<redacted>)")
    }
}

impl CipherKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| GBackupError::Config(format!("cipher key is not valid base64: {e}")))?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            GBackupError::Config(format!("cipher key must be {KEY_LEN} bytes, got {}", b.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_base64(&std::fs::read_to_string(path)?)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Generate a fresh key and persist it to `path` before handing it out.
    /// Refuses to overwrite an existing file: losing a key loses every
    /// artifact encrypted with it.
    pub fn generate_to(path: &Path) -> Result<Self> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        let key = Self(bytes);

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        writeln!(file, "{}", key.to_base64())?;
        file.sync_all()?;

        warn!(
            "Generated a new cipher key at {}. Store it safely: artifacts encrypted with it cannot be recovered without it",
            path.display()
        );
        Ok(key)
    }

    fn aead(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.0.into())
    }
}

/// Encrypt `plain_path` into `cipher_path`.
pub fn encrypt(plain_path: &Path, cipher_path: &Path, key: &CipherKey) -> Result<PathBuf> {
    let staging = staging_path(cipher_path);
    let result = encrypt_into(plain_path, &staging, key);
    finish(result, &staging, cipher_path)
}

/// Decrypt `cipher_path` into `plain_path`. A wrong key, truncation or any
/// tampering yields [`GBackupError::DecryptionFailed`] and no output file.
pub fn decrypt(cipher_path: &Path, plain_path: &Path, key: &CipherKey) -> Result<PathBuf> {
    let staging = staging_path(plain_path);
    let result = decrypt_into(cipher_path, &staging, key);
    finish(result, &staging, plain_path)
}

fn finish(result: Result<()>, staging: &Path, target: &Path) -> Result<PathBuf> {
    match result {
        Ok(()) => {
            std::fs::rename(staging, target)?;
            Ok(target.to_path_buf())
        }
        Err(e) => {
            let _ = std::fs::remove_file(staging);
            Err(e)
        }
    }
}

fn encrypt_into(plain_path: &Path, out_path: &Path, key: &CipherKey) -> Result<()> {
    let mut reader = BufReader::new(File::open(plain_path)?);
    let mut writer = BufWriter::new(File::create(out_path)?);

    let mut nonce = [0u8; NONCE_PREFIX_LEN];
    OsRng.fill_bytes(&mut nonce);
    writer.write_all(MAGIC)?;
    writer.write_all(&nonce)?;

    let mut encryptor = EncryptorBE32::from_aead(key.aead(), nonce.as_slice().into());
    let mut current = vec![0u8; SEGMENT_LEN];
    let mut next = vec![0u8; SEGMENT_LEN];
    let mut current_len = read_full(&mut reader, &mut current)?;

    loop {
        let next_len = if current_len == SEGMENT_LEN {
            read_full(&mut reader, &mut next)?
        } else {
            0
        };
        if next_len == 0 {
            let sealed = encryptor
                .encrypt_last(&current[..current_len])
                .map_err(|_| GBackupError::ArchiveFailure("segment encryption failed".into()))?;
            writer.write_all(&sealed)?;
            break;
        }
        let sealed = encryptor
            .encrypt_next(&current[..current_len])
            .map_err(|_| GBackupError::ArchiveFailure("segment encryption failed".into()))?;
        writer.write_all(&sealed)?;
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
    }

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn decrypt_into(cipher_path: &Path, out_path: &Path, key: &CipherKey) -> Result<()> {
    let mut reader = BufReader::new(File::open(cipher_path)?);

    let mut header = [0u8; 4 + NONCE_PREFIX_LEN];
    if read_full(&mut reader, &mut header)? != header.len() || &header[..4] != MAGIC {
        return Err(GBackupError::DecryptionFailed);
    }
    let nonce = &header[4..];

    let mut writer = BufWriter::new(File::create(out_path)?);
    let mut decryptor = DecryptorBE32::from_aead(key.aead(), nonce.into());
    let sealed_len = SEGMENT_LEN + TAG_LEN;
    let mut current = vec![0u8; sealed_len];
    let mut next = vec![0u8; sealed_len];
    let mut current_len = read_full(&mut reader, &mut current)?;

    loop {
        let next_len = if current_len == sealed_len {
            read_full(&mut reader, &mut next)?
        } else {
            0
        };
        if next_len == 0 {
            let plain = decryptor
                .decrypt_last(&current[..current_len])
                .map_err(|_| GBackupError::DecryptionFailed)?;
            writer.write_all(&plain)?;
            break;
        }
        let plain = decryptor
            .decrypt_next(&current[..current_len])
            .map_err(|_| GBackupError::DecryptionFailed)?;
        writer.write_all(&plain)?;
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
    }

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

/// Fill `buf` unless EOF comes first; returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
