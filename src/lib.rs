pub mod config;
pub mod media;
pub mod queue;
pub mod storage;
pub mod utils;

// 重新导出核心类型
pub use queue::{
    QueueConfig,
    QueueStats,
    Result,
    RetryDecision,
    RetryPolicy,
    SourceFile,
    TaskId,
    TaskProgress,
    TaskStatus,
    UploadError,
    UploadEvent,
    UploadOutcome,
    UploadQueue,
    UploadQueueHandle,
    UploadTask,
};

pub use media::{MediaPreprocessor, PreprocessConfig, PreprocessError};

pub use storage::{
    HttpObjectStorage,
    HttpStorageConfig,
    IdentityProvider,
    ObjectStorage,
    StaticIdentity,
    StorageError,
};
