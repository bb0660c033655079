use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use crate::logger::Logger;

static NOTICE_LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@storefront/notices"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A transient, user-facing message (a toast).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Surface that shows [`Notice`]s to the user.
pub trait NoticeSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log. Used when the host does not supply a sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNoticeSink;

impl NoticeSink for LoggingNoticeSink {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info => NOTICE_LOGGER.info(notice.message),
            NoticeLevel::Warning => NOTICE_LOGGER.warn(notice.message),
            NoticeLevel::Error => NOTICE_LOGGER.error(notice.message),
        }
    }
}

/// Keeps every notice in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingNoticeSink {
    notices: Arc<Mutex<Vec<Notice>>>,
}

impl RecordingNoticeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NoticeSink for RecordingNoticeSink {
    fn notify(&self, notice: Notice) {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notice);
    }
}
