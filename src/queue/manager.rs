use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use crate::storage::{IdentityProvider, ObjectStorage};
use super::errors::{Result, UploadError};
use super::types::{
    ManagerCommand, QueueConfig, QueueStats, SourceFile, TaskId, UploadEvent, UploadOutcome,
    UploadTask,
};
use super::worker::QueueWorker;

/// 上传队列的公开句柄：命令走 mpsc 通道由 worker 串行处理，
/// 事件走 broadcast 通道分发给所有订阅者
#[derive(Clone)]
pub struct UploadQueue {
    command_tx: mpsc::Sender<ManagerCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
}

/// 队列句柄 - 包含队列和工作线程
pub struct UploadQueueHandle {
    pub queue: UploadQueue,
    pub worker_handle: JoinHandle<()>,
}

impl UploadQueueHandle {
    /// 关停：释放命令通道后等待 worker 退出，
    /// 进行中的传输会被立即中断
    pub async fn shutdown(self) -> Result<()> {
        drop(self.queue);
        self.worker_handle
            .await
            .map_err(|err| UploadError::internal(format!("worker panic: {err}")))
    }
}

impl UploadQueue {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        identity: Arc<dyn IdentityProvider>,
        config: QueueConfig,
    ) -> UploadQueueHandle {
        let (command_tx, command_rx) = mpsc::channel(100);
        // 最大缓存 256 个事件
        let (event_tx, _) = broadcast::channel(256);

        let worker_handle = tokio::spawn(QueueWorker::run(
            storage,
            identity,
            config,
            command_rx,
            event_tx.clone(),
        ));

        let queue = Self {
            command_tx,
            event_tx,
        };

        UploadQueueHandle {
            queue,
            worker_handle,
        }
    }

    /// 提交一批文件，立即返回任务 ID 列表，不等待传输
    pub async fn submit(
        &self,
        files: Vec<SourceFile>,
        association_id: Option<String>,
    ) -> Result<Vec<TaskId>> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(ManagerCommand::Submit {
                files,
                association_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| UploadError::QueueShutdown)?;

        // 等待响应
        reply_rx.await.map_err(|_| UploadError::QueueShutdown)?
    }

    /// 暂停整个队列：中断上传中的任务，停止派发新任务
    pub async fn pause(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(ManagerCommand::Pause { reply: reply_tx })
            .await
            .map_err(|_| UploadError::QueueShutdown)?;

        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    /// 恢复队列
    pub async fn resume(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(ManagerCommand::Resume { reply: reply_tx })
            .await
            .map_err(|_| UploadError::QueueShutdown)?;

        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    /// 取消单个任务（`Some(id)`）或全部非终态任务（`None`）
    pub async fn cancel(&self, task_id: Option<TaskId>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(ManagerCommand::Cancel {
                task_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| UploadError::QueueShutdown)?;

        reply_rx.await.map_err(|_| UploadError::QueueShutdown)?
    }

    /// 清除已完成/已取消的任务，返回清除数量
    pub async fn clear_completed(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(ManagerCommand::ClearCompleted { reply: reply_tx })
            .await
            .map_err(|_| UploadError::QueueShutdown)?;

        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    /// 获取队列统计
    pub async fn stats(&self) -> Result<QueueStats> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(ManagerCommand::GetStats { reply: reply_tx })
            .await
            .map_err(|_| UploadError::QueueShutdown)?;

        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    /// 按提交顺序获取所有任务快照
    pub async fn tasks(&self) -> Result<Vec<UploadTask>> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(ManagerCommand::GetTasks { reply: reply_tx })
            .await
            .map_err(|_| UploadError::QueueShutdown)?;

        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    /// 获取单个任务快照
    pub async fn task(&self, task_id: TaskId) -> Result<Option<UploadTask>> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(ManagerCommand::GetTask {
                task_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| UploadError::QueueShutdown)?;

        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    /// 给所有仍处于 Pending 的任务补挂所属实体标识，返回更新数量
    ///
    /// 用于文件先于所属实体开始上传的场景
    pub async fn update_association(&self, association_id: impl Into<String>) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(ManagerCommand::UpdateAssociation {
                association_id: association_id.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| UploadError::QueueShutdown)?;

        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    /// 等待一批任务全部到达终态，返回各自的结果
    ///
    /// 精确在最后一个任务终态时解析，没有轮询延迟
    pub async fn wait(&self, ids: Vec<TaskId>) -> Result<Vec<UploadOutcome>> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(ManagerCommand::WaitBatch {
                ids,
                reply: reply_tx,
            })
            .await
            .map_err(|_| UploadError::QueueShutdown)?;

        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    /// 订阅事件
    ///
    /// 注意：
    /// - 如果接收速度跟不上发送速度，可能会丢失事件（lagged error）
    /// - 每个订阅者都会收到完整的事件副本
    /// - 订阅者应该尽快处理事件，避免阻塞
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredEventReceiver<F>
    where
        F: Fn(&UploadEvent) -> bool,
    {
        FilteredEventReceiver {
            receiver: self.event_tx.subscribe(),
            filter,
        }
    }
}

/// 过滤的事件接收器
pub struct FilteredEventReceiver<F> {
    receiver: broadcast::Receiver<UploadEvent>,
    filter: F,
}

impl<F> FilteredEventReceiver<F>
where
    F: Fn(&UploadEvent) -> bool,
{
    pub async fn recv(&mut self) -> Result<UploadEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if (self.filter)(&event) {
                return Ok(event);
            }
        }
    }
}
