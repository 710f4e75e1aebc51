//! Error types for the recording core

use std::path::PathBuf;

/// Errors surfaced by the recording core.
///
/// Traffic that simply doesn't look like a prompt is not an error; the
/// extraction path returns `None` for it.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown prompt id: {0}")]
    UnknownPrompt(String),

    #[error("recording is paused")]
    RecordingPaused,

    #[error("primary store busy after {attempts} attempts")]
    StoreBusy { attempts: u32 },

    #[error("primary store error: {0}")]
    PrimaryStore(#[from] rusqlite::Error),

    #[error("primary store unavailable: {0}")]
    PrimaryUnavailable(String),

    #[error("backup store write failed at {path}: {source}")]
    BackupStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backup store at {path} is unreadable: {source}")]
    BackupCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lock poisoned")]
    Poisoned,
}

impl RecorderError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    /// True when the primary store reported that another connection holds its lock.
    pub fn is_busy(&self) -> bool {
        match self {
            RecorderError::StoreBusy { .. } => true,
            RecorderError::PrimaryStore(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T, E = RecorderError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_classification() {
        let busy = RecorderError::PrimaryStore(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_busy());

        let locked = RecorderError::PrimaryStore(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            None,
        ));
        assert!(locked.is_busy());

        assert!(!RecorderError::validation("empty").is_busy());
        assert!(!RecorderError::PrimaryStore(rusqlite::Error::QueryReturnedNoRows).is_busy());
    }
}
