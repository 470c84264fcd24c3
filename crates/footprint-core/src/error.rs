use rusqlite::ErrorCode;
use thiserror::Error;

use crate::capture::CaptureError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A find-or-create lookup came back empty right after its insert committed.
    #[error("{kind} not found after insert: {key}")]
    IdentityMissing { kind: &'static str, key: String },

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("export error: {0}")]
    Export(String),
}

/// How the durable writer should react to a failed commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFailure {
    /// Lock contention; roll back and try again.
    Busy,
    /// The medium is full or the store is unusable; stop capturing.
    Exhausted,
    /// Anything else; roll back, log, keep going.
    Other,
}

impl CoreError {
    pub fn storage_failure(&self) -> StorageFailure {
        let CoreError::Database(rusqlite::Error::SqliteFailure(err, _)) = self else {
            return StorageFailure::Other;
        };

        match err.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StorageFailure::Busy,
            ErrorCode::DiskFull
            | ErrorCode::SystemIoFailure
            | ErrorCode::CannotOpen
            | ErrorCode::ReadOnly
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::NotADatabase => StorageFailure::Exhausted,
            _ => StorageFailure::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
