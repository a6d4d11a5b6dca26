// restore-sidecar/src/restore/archive.rs
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::path::Path;
use tar::Archive;
use tracing::debug;
use walkdir::WalkDir;

/// Extracts a GZipped TAR archive into `extract_to_dir`, creating the
/// directory when needed. Returns the number of regular files now present
/// under the directory.
pub fn extract_tar_gz_archive(archive_path: &Path, extract_to_dir: &Path) -> Result<usize> {
    if !archive_path.is_file() {
        anyhow::bail!("Archive for extraction is not a file: {}", archive_path.display());
    }
    if extract_to_dir.exists() && !extract_to_dir.is_dir() {
        anyhow::bail!(
            "Extraction path exists but is not a directory: {}",
            extract_to_dir.display()
        );
    }
    fs::create_dir_all(extract_to_dir).with_context(|| {
        format!("Failed to create extraction directory: {}", extract_to_dir.display())
    })?;

    let archive_file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(archive_file));
    archive.set_preserve_permissions(false);
    archive.unpack(extract_to_dir).with_context(|| {
        format!(
            "Failed to unpack archive {} to {}",
            archive_path.display(),
            extract_to_dir.display()
        )
    })?;

    let file_count = WalkDir::new(extract_to_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && entry.path() != archive_path)
        .count();
    debug!(
        archive = %archive_path.display(),
        destination = %extract_to_dir.display(),
        file_count,
        "Extracted slice archive"
    );
    Ok(file_count)
}
