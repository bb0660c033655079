use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageErrorCode {
    Unavailable,
    QuotaExceeded,
    Serialization,
    InvalidArgument,
}

impl StorageErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageErrorCode::Unavailable => "storage/unavailable",
            StorageErrorCode::QuotaExceeded => "storage/quota-exceeded",
            StorageErrorCode::Serialization => "storage/serialization",
            StorageErrorCode::InvalidArgument => "storage/invalid-argument",
        }
    }
}

#[derive(Clone, Debug)]
pub struct StorageError {
    pub code: StorageErrorCode,
    message: String,
}

impl StorageError {
    pub fn new(code: StorageErrorCode, message: impl Into<String>) -> Self {
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

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl std::error::Error for StorageError {}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        serialization_error(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

pub fn unavailable(message: impl Into<String>) -> StorageError {
    StorageError::new(StorageErrorCode::Unavailable, message)
}

pub fn quota_exceeded(message: impl Into<String>) -> StorageError {
    StorageError::new(StorageErrorCode::QuotaExceeded, message)
}

pub fn serialization_error(message: impl Into<String>) -> StorageError {
    StorageError::new(StorageErrorCode::Serialization, message)
}

pub fn invalid_argument(message: impl Into<String>) -> StorageError {
    StorageError::new(StorageErrorCode::InvalidArgument, message)
}
