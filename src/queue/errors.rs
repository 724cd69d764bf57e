use thiserror::Error;
use crate::media::PreprocessError;
use crate::storage::StorageError;
use super::types::TaskId;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Preprocess error: {0}")]
    Preprocess(#[from] PreprocessError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Identity unresolved: {0}")]
    Identity(String),

    /// 用户/系统主动中断，不算失败，不计入重试
    #[error("Transfer aborted")]
    Aborted,

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Queue has shut down")]
    QueueShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
