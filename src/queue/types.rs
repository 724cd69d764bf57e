use std::path::Path;
use std::time::Duration;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;
use crate::media::PreprocessConfig;
use super::errors::Result;

/// 上传任务唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 任务状态枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum TaskStatus {
    /// 等待中（在队列中）
    Pending,
    /// 预处理中（压缩、生成缩略图）
    Processing,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Error,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    /// 终态：不会再发生任何状态迁移
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

/// 待上传的源文件（字节 + 名称 + 声明的内容类型）
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data,
        }
    }

    /// 从磁盘读取文件，内容类型根据扩展名推断
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let data = tokio::fs::read(path).await?;

        Ok(Self {
            content_type: guess_content_type(&name).to_string(),
            name,
            data: Bytes::from(data),
        })
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

fn guess_content_type(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

/// 预处理产物的描述信息（字节本体由执行器持有，不进任务快照）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactInfo {
    pub content_type: String,
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
}

/// 上传任务
#[derive(Debug, Clone)]
pub struct UploadTask {
    /// 任务 ID
    pub id: TaskId,
    /// 源文件
    pub file: SourceFile,
    /// 所属实体（帖子/叶子节点）的标识，可在提交后补挂
    pub association_id: Option<String>,
    /// 当前状态
    pub status: TaskStatus,
    /// 进度百分比 [0, 100]，单次尝试内单调不减
    pub progress: f32,
    /// 重试次数
    pub retry_count: u32,
    /// 最近一次失败原因，下一次尝试开始时清空
    pub last_error: Option<String>,
    /// 压缩产物描述
    pub processed: Option<ArtifactInfo>,
    /// 缩略图产物描述
    pub thumbnail: Option<ArtifactInfo>,
    /// 上传完成后的持久 URL
    pub uploaded_url: Option<String>,
    /// 缩略图 URL
    pub thumbnail_url: Option<String>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 开始时间
    pub started_at: Option<DateTime<Utc>>,
    /// 完成时间
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadTask {
    pub(crate) fn new(file: SourceFile, association_id: Option<String>) -> Self {
        Self {
            id: TaskId::new(),
            file,
            association_id,
            status: TaskStatus::Pending,
            progress: 0.0,
            retry_count: 0,
            last_error: None,
            processed: None,
            thumbnail: None,
            uploaded_url: None,
            thumbnail_url: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// 单个任务的进度信息
#[derive(Debug, Clone)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    /// 进度百分比 [0, 100]
    pub percentage: f32,
    /// 瞬时速度（字节/秒）
    pub speed: f64,
    /// 预计剩余时间
    pub eta: Option<Duration>,
}

/// 任务终态结果，每个任务恰好产生一次
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadOutcome {
    pub task_id: TaskId,
    pub success: bool,
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub error: Option<String>,
}

/// 队列统计（按状态计数 + 整体进度）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub uploading: usize,
    pub paused: usize,
    pub completed: usize,
    pub error: usize,
    pub cancelled: usize,
    pub total: usize,
    /// 当前列表内所有任务进度的算术平均
    pub overall_progress: f32,
}

/// 上传事件
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 任务已加入队列
    TaskAdded {
        task_id: TaskId,
    },
    /// 任务状态变更
    StateChanged {
        task_id: TaskId,
        old_status: TaskStatus,
        new_status: TaskStatus,
    },
    /// 进度更新
    Progress(TaskProgress),
    /// 任务到达终态（完成/失败/取消），每个任务恰好一次
    TaskDone(UploadOutcome),
}

/// 队列配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// 最大并发任务数
    pub max_concurrent: usize,
    /// 单个任务的最大重试次数
    pub max_retries: u32,
    /// 重试退避基数
    pub base_delay: Duration,
    /// 退避上限
    pub max_delay: Duration,
    /// 无进度超时：超过该时长没有任何字节进展按超时失败处理
    pub stall_timeout: Duration,
    /// 单文件大小上限
    pub max_file_bytes: u64,
    /// 接受的内容类型前缀
    pub accepted_types: Vec<String>,
    /// 图片预处理配置
    pub preprocess: PreprocessConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(30),
            max_file_bytes: 500 * 1024 * 1024, // 500MB
            accepted_types: vec![
                "image/".to_string(),
                "video/".to_string(),
                "audio/".to_string(),
            ],
            preprocess: PreprocessConfig::default(),
        }
    }
}

/// 队列管理器命令
pub(crate) enum ManagerCommand {
    /// 提交一批文件
    Submit {
        files: Vec<SourceFile>,
        association_id: Option<String>,
        reply: oneshot::Sender<Result<Vec<TaskId>>>,
    },

    /// 暂停：中断上传中的任务，停止后续调度
    Pause {
        reply: oneshot::Sender<()>,
    },

    /// 恢复
    Resume {
        reply: oneshot::Sender<()>,
    },

    /// 取消单个任务，或取消全部（task_id 为 None）
    Cancel {
        task_id: Option<TaskId>,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 清除所有 <Completed/Cancelled> 状态的任务
    ClearCompleted {
        reply: oneshot::Sender<usize>,
    },

    /// 获取统计信息
    GetStats {
        reply: oneshot::Sender<QueueStats>,
    },

    /// 获取所有任务
    GetTasks {
        reply: oneshot::Sender<Vec<UploadTask>>,
    },

    /// 获取任务信息
    GetTask {
        task_id: TaskId,
        reply: oneshot::Sender<Option<UploadTask>>,
    },

    /// 给所有仍处于 Pending 的任务补挂所属实体标识
    UpdateAssociation {
        association_id: String,
        reply: oneshot::Sender<usize>,
    },

    /// 等待一批任务全部到达终态
    WaitBatch {
        ids: Vec<TaskId>,
        reply: oneshot::Sender<Vec<UploadOutcome>>,
    },
}
