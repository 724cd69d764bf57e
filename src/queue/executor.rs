use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::media::{MediaPreprocessor, PreprocessOutput, ProcessedMedia};
use crate::storage::{IdentityProvider, ObjectStorage, ProgressFn, SpeedTracker, StorageError};
use super::errors::{Result, UploadError};
use super::types::{ArtifactInfo, TaskId, TaskProgress, UploadTask};

/// 执行器发往队列 worker 的内部消息，都带 attempt 标记，
/// worker 据此丢弃过期尝试的消息
#[derive(Debug)]
pub(crate) enum ExecutorMsg {
    /// 预处理完成（透传时产物为 None），任务可进入上传阶段
    Preprocessed {
        task_id: TaskId,
        attempt: u32,
        processed: Option<ArtifactInfo>,
        thumbnail: Option<ArtifactInfo>,
    },
    /// 进度更新
    Progress {
        task_id: TaskId,
        attempt: u32,
        progress: TaskProgress,
    },
    /// 本次尝试结束，结果在 JoinHandle 里
    Done {
        task_id: TaskId,
        attempt: u32,
    },
}

/// 一次成功传输的结果
#[derive(Debug, Clone)]
pub(crate) struct TransferOutcome {
    pub url: String,
    pub thumbnail_url: Option<String>,
}

/// 单个任务的传输执行器：预处理 → 身份解析 → 主文件上传 → 缩略图上传
///
/// 每个被调度的任务各起一个 tokio 任务运行 `run`，取消令牌贯穿全程。
pub(crate) struct TransferExecutor {
    pub storage: Arc<dyn ObjectStorage>,
    pub identity: Arc<dyn IdentityProvider>,
    pub preprocessor: Arc<MediaPreprocessor>,
    pub token: CancellationToken,
    pub msg_tx: mpsc::UnboundedSender<ExecutorMsg>,
    pub stall_timeout: Duration,
}

impl TransferExecutor {
    pub(crate) async fn run(self, task: UploadTask) -> Result<TransferOutcome> {
        let task_id = task.id;
        let attempt = task.retry_count;

        // 预处理是 CPU 密集操作，丢到 blocking 线程池，
        // 同时监听取消信号避免阻塞暂停/取消
        let output = self.preprocess(&task).await?;
        let _ = self.msg_tx.send(ExecutorMsg::Preprocessed {
            task_id,
            attempt,
            processed: output.processed.as_ref().map(artifact_info),
            thumbnail: output.thumbnail.as_ref().map(artifact_info),
        });
        if self.token.is_cancelled() {
            return Err(UploadError::Aborted);
        }

        let owner = self
            .identity
            .current_user()
            .map_err(|err| UploadError::Identity(err.to_string()))?;

        // 有压缩产物就传产物（文件名扩展跟着产物格式走），否则传原文件
        let (data, content_type, upload_name) = match &output.processed {
            Some(p) => (
                p.data.clone(),
                p.content_type.clone(),
                processed_name(&task.file.name),
            ),
            None => (
                task.file.data.clone(),
                task.file.content_type.clone(),
                task.file.name.clone(),
            ),
        };

        let key = derive_key(
            &owner,
            task.association_id.as_deref(),
            task_id,
            &upload_name,
        );
        let progress = self.progress_fn(task_id, attempt, data.len() as u64);
        let url = self
            .transfer(&key, data, &content_type, Some(progress.0), progress.1)
            .await?;

        let thumbnail_url = match &output.thumbnail {
            Some(thumb) => {
                let thumb_key = derive_key(
                    &owner,
                    task.association_id.as_deref(),
                    task_id,
                    &thumbnail_name(&task.file.name),
                );
                let counter = Arc::new(AtomicU64::new(0));
                Some(
                    self.transfer(&thumb_key, thumb.data.clone(), &thumb.content_type, None, counter)
                        .await?,
                )
            }
            None => None,
        };

        tracing::debug!(%task_id, %url, "transfer finished");

        Ok(TransferOutcome { url, thumbnail_url })
    }

    async fn preprocess(&self, task: &UploadTask) -> Result<PreprocessOutput> {
        let file = task.file.clone();
        let preprocessor = self.preprocessor.clone();
        let work = tokio::task::spawn_blocking(move || preprocessor.process(&file));

        tokio::select! {
            result = work => {
                let output = result
                    .map_err(|err| UploadError::internal(format!("preprocess task panicked: {err}")))??;
                Ok(output)
            }
            _ = self.token.cancelled() => Err(UploadError::Aborted),
        }
    }

    /// 把字节计数转换为 [0, 100] 进度消息；计数器同时供停滞看门狗观察
    fn progress_fn(&self, task_id: TaskId, attempt: u32, total_bytes: u64) -> (ProgressFn, Arc<AtomicU64>) {
        let counter = Arc::new(AtomicU64::new(0));
        let tracker = Arc::new(Mutex::new(SpeedTracker::new()));
        let msg_tx = self.msg_tx.clone();
        let watched = counter.clone();

        let callback: ProgressFn = Arc::new(move |bytes_sent| {
            watched.store(bytes_sent, Ordering::Relaxed);
            let mut tracker = tracker.lock();
            tracker.add_sample(bytes_sent);
            let percentage = if total_bytes > 0 {
                ((bytes_sent as f64 / total_bytes as f64) * 100.0).min(100.0) as f32
            } else {
                100.0
            };
            let _ = msg_tx.send(ExecutorMsg::Progress {
                task_id,
                attempt,
                progress: TaskProgress {
                    task_id,
                    bytes_sent,
                    total_bytes,
                    percentage,
                    speed: tracker.instant_speed(),
                    eta: tracker.eta(bytes_sent, total_bytes),
                },
            });
        });

        (callback, counter)
    }

    /// 传输一个对象：取消信号与停滞看门狗同时生效
    async fn transfer(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        progress: Option<ProgressFn>,
        counter: Arc<AtomicU64>,
    ) -> Result<String> {
        let future = self.storage.put_object(key, data, content_type, progress);

        tokio::select! {
            result = future => result.map_err(UploadError::Storage),
            _ = self.token.cancelled() => Err(UploadError::Aborted),
            _ = stall_watchdog(counter, self.stall_timeout) => {
                Err(UploadError::Storage(StorageError::Timeout))
            }
        }
    }
}

/// 一个完整窗口内字节数没有任何前进即视为停滞（完成时返回触发超时）
async fn stall_watchdog(counter: Arc<AtomicU64>, timeout: Duration) {
    let mut last = counter.load(Ordering::Relaxed);
    loop {
        tokio::time::sleep(timeout).await;
        let current = counter.load(Ordering::Relaxed);
        if current == last {
            return;
        }
        last = current;
    }
}

fn artifact_info(media: &ProcessedMedia) -> ArtifactInfo {
    ArtifactInfo {
        content_type: media.content_type.clone(),
        size_bytes: media.metadata.size_bytes,
        width: media.metadata.width,
        height: media.metadata.height,
    }
}

/// 存储 key：{owner}/{association|unattached}/{task_id}/{filename}
pub(crate) fn derive_key(
    owner: &str,
    association: Option<&str>,
    task_id: TaskId,
    filename: &str,
) -> String {
    format!(
        "{}/{}/{}/{}",
        owner,
        association.unwrap_or("unattached"),
        task_id,
        sanitize_filename(filename)
    )
}

fn file_stem(filename: &str) -> &str {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename,
    }
}

/// 压缩产物文件名：{原文件名去扩展名}.jpg
fn processed_name(filename: &str) -> String {
    format!("{}.jpg", file_stem(filename))
}

/// 缩略图文件名：thumb_{原文件名去扩展名}.jpg
fn thumbnail_name(filename: &str) -> String {
    format!("thumb_{}.jpg", file_stem(filename))
}

fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_control() || c.is_whitespace() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_format() {
        let id = TaskId::new();
        let key = derive_key("user-1", Some("leaf-9"), id, "photo.jpg");
        assert_eq!(key, format!("user-1/leaf-9/{id}/photo.jpg"));

        let key = derive_key("user-1", None, id, "photo.jpg");
        assert_eq!(key, format!("user-1/unattached/{id}/photo.jpg"));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("my photo/1.jpg"), "my_photo_1.jpg");
        assert_eq!(sanitize_filename("plain.png"), "plain.png");
    }

    #[test]
    fn test_derived_names() {
        assert_eq!(processed_name("photo.png"), "photo.jpg");
        assert_eq!(processed_name("noext"), "noext.jpg");
        assert_eq!(thumbnail_name("photo.jpg"), "thumb_photo.jpg");
        assert_eq!(thumbnail_name("archive.tar.gz"), "thumb_archive.tar.jpg");
        assert_eq!(thumbnail_name("noext"), "thumb_noext.jpg");
    }
}
