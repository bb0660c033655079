use std::fmt::{Display, Formatter};

use crate::durable::StorageError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupErrorCode {
    SnapshotFailed,
    NotFound,
    InvalidSnapshot,
    Storage,
}

impl BackupErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupErrorCode::SnapshotFailed => "backup/snapshot-failed",
            BackupErrorCode::NotFound => "backup/not-found",
            BackupErrorCode::InvalidSnapshot => "backup/invalid-snapshot",
            BackupErrorCode::Storage => "backup/storage",
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackupError {
    pub code: BackupErrorCode,
    message: String,
}

impl BackupError {
    pub fn new(code: BackupErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for BackupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl std::error::Error for BackupError {}

impl From<StorageError> for BackupError {
    fn from(err: StorageError) -> Self {
        storage_error(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        storage_error(format!("failed to encode backups: {err}"))
    }
}

pub type BackupResult<T> = Result<T, BackupError>;

pub fn snapshot_failed(message: impl Into<String>) -> BackupError {
    BackupError::new(BackupErrorCode::SnapshotFailed, message)
}

pub fn not_found(message: impl Into<String>) -> BackupError {
    BackupError::new(BackupErrorCode::NotFound, message)
}

pub fn invalid_snapshot(message: impl Into<String>) -> BackupError {
    BackupError::new(BackupErrorCode::InvalidSnapshot, message)
}

pub fn storage_error(message: impl Into<String>) -> BackupError {
    BackupError::new(BackupErrorCode::Storage, message)
}
