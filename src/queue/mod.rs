mod errors;
mod executor;
mod manager;
mod retry;
pub mod stats;
mod types;
mod worker;

pub use errors::{Result, UploadError};
pub use manager::{FilteredEventReceiver, UploadQueue, UploadQueueHandle};
pub use retry::{RetryDecision, RetryPolicy};
pub use types::{
    ArtifactInfo, QueueConfig, QueueStats, SourceFile, TaskId, TaskProgress, TaskStatus,
    UploadEvent, UploadOutcome, UploadTask,
};
