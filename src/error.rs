//! Error types for the update engine.

use std::path::PathBuf;

/// Everything that can go wrong while checking for, fetching, verifying or
/// swapping in a new release.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// A version string could not be parsed as a semantic version.
    #[error("invalid version {version:?}: {reason}")]
    InvalidVersion { version: String, reason: String },

    /// Transport error or non-2xx response while talking to the release server.
    #[error("download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    /// The archive did not contain the expected binary entry.
    #[error("{entry} not found in archive {}", archive.display())]
    AssetNotFound { archive: PathBuf, entry: String },

    /// The archive could not be read or the entry could not be written out.
    #[error("failed to extract {}: {reason}", archive.display())]
    ExtractFailed { archive: PathBuf, reason: String },

    /// The checksum manifest has no line for the asset.
    #[error("checksum not found for {asset}")]
    ChecksumMissing { asset: String },

    #[error("checksum mismatch for {asset}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        asset: String,
        expected: String,
        actual: String,
    },

    /// Swapping a binary into `target` failed.
    #[error("failed to replace {}: {reason}", target.display())]
    ReplaceFailed { target: PathBuf, reason: String },

    /// The binary did not pass its self-check.
    #[error("binary validation failed for {}: {reason}", path.display())]
    ValidationFailed { path: PathBuf, reason: String },

    #[error("no previous binary found at {}", backup.display())]
    NoPreviousVersion { backup: PathBuf },

    /// A replacement failed and restoring the backup failed too. The live
    /// binary may be broken; both causes are kept for diagnosis.
    #[error("{original}; rollback also failed: {rollback}")]
    RollbackFailed {
        original: Box<UpdateError>,
        rollback: Box<UpdateError>,
    },

    /// Another update is in progress.
    #[error("another update is already in progress: {holder} (lock: {})", path.display())]
    Locked { path: PathBuf, holder: String },

    /// The persisted state file could not be written or read.
    #[error("update state error at {}: {reason}", path.display())]
    State { path: PathBuf, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl UpdateError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        UpdateError::Io {
            context: context.into(),
            source,
        }
    }

    /// True if the live binary may have been left in a bad state.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, UpdateError::RollbackFailed { .. })
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, UpdateError>;
