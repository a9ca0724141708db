//! Crate-wide error type.
//!
//! The store, the ANN indexes and the external-service clients surface
//! these errors to callers. Batch jobs (ingest, sync) catch per-photo
//! errors, log them and count them instead of aborting.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Entity missing (photo, marker, subject).
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent write collision, e.g. a (photo_id, face_index) unique
    /// constraint violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Vector rejected at the store boundary: wrong dimensionality.
    #[error("bad vector dimension: expected {expected}, got {got}")]
    BadDim { expected: usize, got: usize },

    /// Vector rejected at the store boundary: not L2-normalized.
    #[error("vector is not L2-normalized (norm {norm})")]
    BadNorm { norm: f32 },

    /// External service unreachable or still 5xx after retry.
    #[error("{service} unavailable: {reason}")]
    ExternalUnavailable { service: &'static str, reason: String },

    /// External service answered 4xx (credentials, bad input).
    #[error("{service} rejected request ({status}): {reason}")]
    ExternalRejected {
        service: &'static str,
        status: u16,
        reason: String,
    },

    /// On-disk ANN snapshot disagreed with the store. Callers treat this
    /// as a trigger for a rebuild, never as a user-facing failure.
    #[error("index snapshot stale: {0}")]
    IndexStale(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Postgres(#[from] postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Whether this error marks the target entity as gone rather than the
    /// operation as failed. The synchronizer relies on this to tell
    /// "photo was deleted upstream" apart from "the service is down".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
