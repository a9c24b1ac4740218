//! Scan engine error types.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for scan operations.
pub type ScanResult<T> = Result<T, ScanError>;

/// Errors that can occur while scanning add-in folders.
///
/// Most variants are recorded against a single file and never abort a scan.
/// `Io` on the cache or registry root, `Cache` and `Cancelled` are the ones
/// that propagate out of [`AddinScanner::scan`](super::AddinScanner::scan).
#[derive(Debug, Error)]
pub enum ScanError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The scan cache store could not be used.
    #[error("Scan cache error: {0}")]
    Cache(String),

    /// Invalid declarative add-in manifest.
    #[error("Invalid add-in manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    /// Invalid directory-list file.
    #[error("Could not process directory list {path}: {reason}")]
    DirectoryList { path: PathBuf, reason: String },

    /// The metadata provider failed.
    #[error("Metadata provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Extraction crashed (panic or worker death) while handling a file.
    #[error("Extraction crashed while scanning {path}: {reason}")]
    Crashed { path: PathBuf, reason: String },

    /// The registry refused or failed an operation.
    #[error("Registry error: {0}")]
    Registry(String),

    /// The isolated worker could not be driven.
    #[error("Worker error: {0}")]
    Worker(String),

    /// The caller cancelled the scan.
    #[error("Scan cancelled")]
    Cancelled,
}

/// Errors reported by a [`MetadataProvider`](super::MetadataProvider).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The module could not be found.
    #[error("Module not found: {0}")]
    NotFound(PathBuf),

    /// The module is not in a format this provider understands.
    #[error("Malformed module {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// Any other inspection failure.
    #[error("{0}")]
    Other(String),
}
