//! Checksums and single-entry archive extraction
//!
//! Release assets are tar+gzip (zip on Windows) archives holding one binary.
//! Only that binary is ever written out.

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use tar::Archive;

use crate::error::{Result, UpdateError};

// ============================================================================
// Checksums
// ============================================================================

/// Hex-encoded SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 65_536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Find the expected hash for `file_name` in a `hash  filename` manifest.
///
/// Filenames must match exactly; a leading `*` (binary mode marker written by
/// `sha256sum -b`) is ignored. The hash is returned lowercased.
pub fn find_checksum(manifest: &str, file_name: &str) -> Option<String> {
    manifest.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let hash = parts.next()?;
        let name = parts.next()?.trim_start_matches('*');
        (name == file_name).then(|| hash.to_ascii_lowercase())
    })
}

// ============================================================================
// Extraction
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    /// Format used for release assets on the given OS (release naming, e.g. `windows`).
    pub fn for_os(os: &str) -> Self {
        if os == "windows" {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::TarGz
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::Zip => ".zip",
        }
    }
}

/// Extract the entry called `entry_name` (exact path or base name) to `dest`.
pub fn extract_binary(
    archive_path: &Path,
    format: ArchiveFormat,
    entry_name: &str,
    dest: &Path,
) -> Result<()> {
    let result = match format {
        ArchiveFormat::TarGz => extract_tar_gz(archive_path, entry_name, dest),
        ArchiveFormat::Zip => extract_zip(archive_path, entry_name, dest),
    };

    if let Err(UpdateError::ExtractFailed { .. }) = &result {
        // Don't leave a half-written binary where the caller expects a good one
        let _ = fs::remove_file(dest);
    }
    result
}

fn entry_matches(entry_path: &str, entry_name: &str) -> bool {
    entry_path == entry_name
        || Path::new(entry_path)
            .file_name()
            .is_some_and(|base| base == entry_name)
}

fn extract_failed(archive_path: &Path, e: impl std::fmt::Display) -> UpdateError {
    UpdateError::ExtractFailed {
        archive: archive_path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn extract_tar_gz(archive_path: &Path, entry_name: &str, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive_path).map_err(|e| extract_failed(archive_path, e))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let entries = archive.entries().map_err(|e| extract_failed(archive_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| extract_failed(archive_path, e))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry
            .path()
            .map_err(|e| extract_failed(archive_path, e))?
            .to_string_lossy()
            .to_string();
        if entry_matches(&path, entry_name) {
            let mut out = fs::File::create(dest).map_err(|e| extract_failed(archive_path, e))?;
            io::copy(&mut entry, &mut out).map_err(|e| extract_failed(archive_path, e))?;
            return Ok(());
        }
    }

    Err(UpdateError::AssetNotFound {
        archive: archive_path.to_path_buf(),
        entry: entry_name.to_string(),
    })
}

fn extract_zip(archive_path: &Path, entry_name: &str, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive_path).map_err(|e| extract_failed(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| extract_failed(archive_path, e))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| extract_failed(archive_path, e))?;
        if entry.is_dir() || !entry_matches(entry.name(), entry_name) {
            continue;
        }

        let mut out = fs::File::create(dest).map_err(|e| extract_failed(archive_path, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| extract_failed(archive_path, e))?;
        return Ok(());
    }

    Err(UpdateError::AssetNotFound {
        archive: archive_path.to_path_buf(),
        entry: entry_name.to_string(),
    })
}
