//! Error types for the ingest → index → query pipeline.
//!
//! Three boundaries, three enums: [`IngestError`] for everything that can go
//! wrong while reading a bugreport and building the cache, [`CacheError`] for
//! the on-disk artifacts themselves, and [`QueryError`] for request-time
//! failures. Per-row parse problems are never errors — they are absorbed into
//! the `malformed` counter during the build.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the parse/ingest entry points.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Input path does not exist or is not a regular file.
    #[error("bugreport not found: {}", .0.display())]
    BugreportNotFound(PathBuf),

    /// The input is an archive but contains no usable bugreport entry,
    /// or the flat text contains no logcat section at all.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The archive exists but cannot be decoded.
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    /// Underlying I/O failure while reading the report.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller dropped the parse handle mid-build.
    #[error("parse cancelled")]
    Cancelled,

    /// Failure writing or committing the cache.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl From<zip::result::ZipError> for IngestError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => IngestError::Io(io),
            other => IngestError::CorruptArchive(other.to_string()),
        }
    }
}

/// Errors raised by the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No per-user cache location could be determined.
    #[error("could not determine a cache directory")]
    NoCacheDir,

    /// The cache for this report is missing, belongs to a different report
    /// identity, or was written by an incompatible schema version. The
    /// caller should re-parse.
    #[error("cache stale: {0}")]
    Stale(String),

    /// An artifact failed structural validation on read. The cache directory
    /// has been deleted; the caller should re-parse.
    #[error("cache corrupt: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the query executor.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The presented cursor does not fit the current request: its filter
    /// fingerprint differs, or its position is outside the row store.
    #[error("cursor invalid: {0}")]
    CursorInvalid(String),

    /// The filter set itself is infeasible (e.g. `tsFrom > tsTo`).
    #[error("invalid filter: {0}")]
    FilterInvalid(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueryError {
    pub fn is_cursor_invalid(&self) -> bool {
        matches!(self, Self::CursorInvalid(_))
    }

    pub fn is_cache_stale(&self) -> bool {
        matches!(self, Self::Cache(CacheError::Stale(_)))
    }
}
