//! Error types for the backup engine.

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::content::ContentError;
use crate::cron::{CronEvalError, CronParseError};
use crate::envelope::EnvelopeError;
use crate::sink::SinkError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed input rejected before anything is persisted.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid cron expression: {0}")]
    Cron(#[from] CronParseError),

    #[error("Scheduling error: {0}")]
    Unsatisfiable(#[from] CronEvalError),

    /// Envelope HMAC mismatch; the archive must be treated as unrecoverable.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Envelope authenticated but its content did not decode.
    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Envelope error: {0}")]
    Envelope(String),

    #[error("Task execution error: {0}")]
    TaskExecution(String),

    #[error("Version conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<EnvelopeError> for EngineError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Integrity => EngineError::Integrity(err.to_string()),
            EnvelopeError::Decryption(_) => EngineError::Decryption(err.to_string()),
            EnvelopeError::Io(e) => EngineError::Io(e),
            other => EngineError::Envelope(other.to_string()),
        }
    }
}

impl From<ArchiveError> for EngineError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Io(e) => EngineError::Io(e),
            ArchiveError::Envelope(e) => e.into(),
            other => EngineError::TaskExecution(other.to_string()),
        }
    }
}

impl From<ContentError> for EngineError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::Io(e) => EngineError::Io(e),
            other => EngineError::TaskExecution(other.to_string()),
        }
    }
}

impl From<SinkError> for EngineError {
    fn from(err: SinkError) -> Self {
        EngineError::TaskExecution(err.to_string())
    }
}

impl EngineError {
    /// Whether the error came from rejected input rather than a runtime failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_) | EngineError::Cron(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
