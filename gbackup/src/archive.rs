//! Directory <-> single compressed artifact (tar + zstd).
//!
//! Both directions stage their output next to the destination and only move it
//! into place once the codec has finished, so a caller either gets the complete
//! result or an error.

use crate::utils::errors::{GBackupError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder as TarBuilder};
use tracing::info;
use walkdir::WalkDir;
use zstd::stream::{Decoder as ZstdDecoder, Encoder as ZstdEncoder};

const COMPRESSION_LEVEL: i32 = 3;

/// Pack `source_dir` into `output_path`. Entries are stored under the
/// directory's own name, so unpacking recreates `<output_dir>/<name>/...`.
pub fn pack(source_dir: &Path, output_path: &Path) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        return Err(GBackupError::DirectoryNotFound(source_dir.to_path_buf()));
    }
    let arcname = source_dir
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| {
            GBackupError::ArchiveFailure(format!("cannot pack {}: no directory name", source_dir.display()))
        })?;

    let staging = staging_path(output_path);
    let result = (|| -> std::io::Result<()> {
        let file = File::create(&staging)?;
        let encoder = ZstdEncoder::new(BufWriter::new(file), COMPRESSION_LEVEL)?;
        let mut builder = TarBuilder::new(encoder);
        builder.append_dir_all(&arcname, source_dir)?;
        let encoder = builder.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&staging);
        return Err(GBackupError::ArchiveFailure(format!(
            "packing {} failed: {}",
            source_dir.display(),
            e
        )));
    }
    std::fs::rename(&staging, output_path)?;

    let files = WalkDir::new(source_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count();
    let size = std::fs::metadata(output_path)?.len();
    info!(
        "Packed {} ({} files) into {} ({} bytes)",
        source_dir.display(),
        files,
        output_path.display(),
        size
    );
    Ok(output_path.to_path_buf())
}

/// Unpack `archive_path` into `output_dir` (created if missing). Top-level
/// entries that already exist in `output_dir` are an error, never overwritten.
pub fn unpack(archive_path: &Path, output_dir: &Path) -> Result<PathBuf> {
    if !archive_path.is_file() {
        return Err(GBackupError::ArchiveFailure(format!(
            "archive {} does not exist",
            archive_path.display()
        )));
    }
    std::fs::create_dir_all(output_dir)?;

    let staging = staging_path(output_dir);
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    let extracted = (|| -> std::io::Result<()> {
        let file = File::open(archive_path)?;
        let decoder = ZstdDecoder::new(BufReader::new(file))?;
        let mut archive = Archive::new(decoder);
        archive.unpack(&staging)
    })();

    if let Err(e) = extracted {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(GBackupError::ArchiveFailure(format!(
            "unpacking {} failed: {}",
            archive_path.display(),
            e
        )));
    }

    let moved = move_entries(&staging, output_dir);
    let _ = std::fs::remove_dir_all(&staging);
    moved?;

    info!("Unpacked {} into {}", archive_path.display(), output_dir.display());
    Ok(output_dir.to_path_buf())
}

fn move_entries(from: &Path, to: &Path) -> Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if target.exists() {
            return Err(GBackupError::ArchiveFailure(format!(
                "refusing to overwrite existing {}",
                target.display()
            )));
        }
        std::fs::rename(entry.path(), target)?;
    }
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
