//! Error types for the storage core.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::country::CountryId;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while managing map packages.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transport failure or non-success HTTP status.
    #[error("network request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    /// Network timeout.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    /// The server does not have the requested file.
    #[error("{url} not found on server")]
    NotFound { url: String },

    /// Failed to write, rename or delete a file.
    #[error("disk operation on {} failed: {source}", path.display())]
    Disk {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Downloaded file does not match its expected size or checksum.
    #[error("integrity check failed for {}: {reason}", path.display())]
    Integrity { path: PathBuf, reason: String },

    /// A binary patch could not be applied cleanly.
    #[error("failed to apply diff for {country}: {reason}")]
    DiffApplication { country: CountryId, reason: String },

    /// Malformed catalog manifest or diff manifest response.
    #[error("failed to parse {source_name}: {reason}")]
    ManifestParse { source_name: String, reason: String },

    /// Country id is not present in the catalog.
    #[error("unknown country: {0}")]
    UnknownCountry(CountryId),

    /// A consumer holds a handle to the file, so it cannot be removed.
    #[error("{country} is in use by {lock_count} handle(s)")]
    FileLocked { country: CountryId, lock_count: usize },

    /// The operation requires an idle download queue.
    #[error("operation not allowed while downloads are in progress")]
    DownloadInProgress,

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StorageError {
    /// Wrap an IO error with the path it concerns.
    pub fn disk(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Disk {
            path: path.into(),
            source,
        }
    }

    /// Classify the error for presentation next to a failed status.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::NotFound { .. } => {
                ErrorKind::Network
            }
            Self::Disk { .. } => ErrorKind::Disk,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::DiffApplication { .. } => ErrorKind::DiffApplication,
            Self::ManifestParse { .. } => ErrorKind::ManifestParse,
            _ => ErrorKind::Other,
        }
    }
}

/// Error classification surfaced to subscribers with `DownloadFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No error recorded.
    None,
    Network,
    Disk,
    Integrity,
    DiffApplication,
    ManifestParse,
    Other,
}
