//! Error taxonomy shared by every engine module.

use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StorageError;

#[derive(Error, Debug)]
pub enum TrackerError {
    /// The focus timer owns the clock, or a merge would swallow other work.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation is not valid for the current tracker state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("validation error: {0}")]
    Validation(String),

    /// An imported document is missing required fields or cannot be decoded.
    #[error("data format error: {0}")]
    DataFormat(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

impl TrackerError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        TrackerError::Conflict(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        TrackerError::InvalidState(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        TrackerError::Validation(msg.into())
    }

    pub fn data_format(msg: impl Into<String>) -> Self {
        TrackerError::DataFormat(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        TrackerError::NotFound(msg.into())
    }

    /// Non-fatal outcomes that leave the store untouched and are shown to the
    /// user as warnings rather than failures.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            TrackerError::Conflict(_) | TrackerError::InvalidState(_) | TrackerError::NotFound(_)
        )
    }
}
