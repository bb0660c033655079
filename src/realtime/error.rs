use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RealtimeErrorCode {
    NotConnected,
    Transport,
    InvalidArgument,
    Cancelled,
}

impl RealtimeErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RealtimeErrorCode::NotConnected => "realtime/not-connected",
            RealtimeErrorCode::Transport => "realtime/transport",
            RealtimeErrorCode::InvalidArgument => "realtime/invalid-argument",
            RealtimeErrorCode::Cancelled => "realtime/cancelled",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RealtimeError {
    pub code: RealtimeErrorCode,
    message: String,
}

impl RealtimeError {
    pub fn new(code: RealtimeErrorCode, message: impl Into<String>) -> Self {
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

impl Display for RealtimeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl std::error::Error for RealtimeError {}

pub type RealtimeResult<T> = Result<T, RealtimeError>;

pub fn not_connected(message: impl Into<String>) -> RealtimeError {
    RealtimeError::new(RealtimeErrorCode::NotConnected, message)
}

pub fn transport_error(message: impl Into<String>) -> RealtimeError {
    RealtimeError::new(RealtimeErrorCode::Transport, message)
}

pub fn invalid_argument(message: impl Into<String>) -> RealtimeError {
    RealtimeError::new(RealtimeErrorCode::InvalidArgument, message)
}

pub fn cancelled(message: impl Into<String>) -> RealtimeError {
    RealtimeError::new(RealtimeErrorCode::Cancelled, message)
}
