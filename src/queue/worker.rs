use std::collections::HashMap;
use std::sync::Arc;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::media::MediaPreprocessor;
use crate::storage::{IdentityProvider, ObjectStorage};
use crate::utils::format_bytes;
use super::errors::{Result, UploadError};
use super::executor::{ExecutorMsg, TransferExecutor, TransferOutcome};
use super::retry::{RetryDecision, RetryPolicy};
use super::stats;
use super::types::{
    ManagerCommand, QueueConfig, SourceFile, TaskId, TaskProgress, TaskStatus, UploadEvent,
    UploadOutcome, UploadTask,
};

/// 任务在 worker 内部的完整记录：快照 + 运行期句柄
struct TaskEntry {
    task: UploadTask,
    /// 中断令牌，仅在一次尝试进行中存在，尝试结束即失效
    token: Option<CancellationToken>,
    join_handle: Option<JoinHandle<Result<TransferOutcome>>>,
    /// 当前派发的尝试序号，用于丢弃过期尝试的消息
    dispatched_attempt: u32,
    /// 终态事件只发一次
    done_emitted: bool,
    outcome: Option<UploadOutcome>,
}

impl TaskEntry {
    fn new(task: UploadTask) -> Self {
        Self {
            task,
            token: None,
            join_handle: None,
            dispatched_attempt: 0,
            done_emitted: false,
            outcome: None,
        }
    }
}

/// 等待一批任务全部到达终态的挂起请求
struct BatchWaiter {
    ids: Vec<TaskId>,
    reply: oneshot::Sender<Vec<UploadOutcome>>,
}

/// 队列 worker：独占全部任务状态，所有状态迁移都串行经过这里的事件循环
pub(crate) struct QueueWorker {
    config: QueueConfig,
    policy: RetryPolicy,
    storage: Arc<dyn ObjectStorage>,
    identity: Arc<dyn IdentityProvider>,
    preprocessor: Arc<MediaPreprocessor>,

    tasks: HashMap<TaskId, TaskEntry>,
    /// 提交顺序
    order: Vec<TaskId>,
    /// 可调度的 Pending 任务（FIFO）
    queued: Vec<TaskId>,
    /// 占用并发额度的任务数（Processing + Uploading，直到尝试归位）
    active: usize,
    /// 队列级暂停：挂起后不再派发新任务
    paused: bool,

    event_tx: broadcast::Sender<UploadEvent>,
    msg_tx: mpsc::UnboundedSender<ExecutorMsg>,
    msg_rx: mpsc::UnboundedReceiver<ExecutorMsg>,
    retry_tx: mpsc::UnboundedSender<TaskId>,
    retry_rx: mpsc::UnboundedReceiver<TaskId>,
    waiters: Vec<BatchWaiter>,
}

impl QueueWorker {
    pub(crate) async fn run(
        storage: Arc<dyn ObjectStorage>,
        identity: Arc<dyn IdentityProvider>,
        config: QueueConfig,
        mut command_rx: mpsc::Receiver<ManagerCommand>,
        event_tx: broadcast::Sender<UploadEvent>,
    ) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let policy = RetryPolicy::new(config.max_retries, config.base_delay, config.max_delay);
        let preprocessor = Arc::new(MediaPreprocessor::new(config.preprocess.clone()));

        let mut worker = Self {
            config,
            policy,
            storage,
            identity,
            preprocessor,
            tasks: HashMap::new(),
            order: Vec::new(),
            queued: Vec::new(),
            active: 0,
            paused: false,
            event_tx,
            msg_tx,
            msg_rx,
            retry_tx,
            retry_rx,
            waiters: Vec::new(),
        };

        // 主事件循环：命令、执行器消息、重试到期
        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(command) => worker.handle_command(command),
                        // 所有句柄都已释放，关停
                        None => break,
                    }
                }
                Some(msg) = worker.msg_rx.recv() => {
                    worker.handle_executor_msg(msg).await;
                }
                Some(task_id) = worker.retry_rx.recv() => {
                    worker.handle_retry_due(task_id);
                }
            }

            worker.process_queue();
            worker.resolve_waiters();
        }

        tracing::debug!("queue worker shutting down");
        for entry in worker.tasks.values_mut() {
            if let Some(token) = entry.token.take() {
                token.cancel();
            }
        }
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Submit { files, association_id, reply } => {
                let _ = reply.send(self.submit(files, association_id));
            }
            ManagerCommand::Pause { reply } => {
                self.pause();
                let _ = reply.send(());
            }
            ManagerCommand::Resume { reply } => {
                self.resume();
                let _ = reply.send(());
            }
            ManagerCommand::Cancel { task_id, reply } => {
                let result = match task_id {
                    Some(task_id) => self.cancel_task(task_id),
                    None => {
                        self.cancel_all();
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
            ManagerCommand::ClearCompleted { reply } => {
                let _ = reply.send(self.clear_completed());
            }
            ManagerCommand::GetStats { reply } => {
                let stats = stats::aggregate(
                    self.order
                        .iter()
                        .filter_map(|id| self.tasks.get(id))
                        .map(|entry| &entry.task),
                );
                let _ = reply.send(stats);
            }
            ManagerCommand::GetTasks { reply } => {
                let tasks = self
                    .order
                    .iter()
                    .filter_map(|id| self.tasks.get(id))
                    .map(|entry| entry.task.clone())
                    .collect();
                let _ = reply.send(tasks);
            }
            ManagerCommand::GetTask { task_id, reply } => {
                let task = self.tasks.get(&task_id).map(|entry| entry.task.clone());
                let _ = reply.send(task);
            }
            ManagerCommand::UpdateAssociation { association_id, reply } => {
                let mut updated = 0;
                for entry in self.tasks.values_mut() {
                    if entry.task.status == TaskStatus::Pending {
                        entry.task.association_id = Some(association_id.clone());
                        updated += 1;
                    }
                }
                let _ = reply.send(updated);
            }
            ManagerCommand::WaitBatch { ids, reply } => {
                self.waiters.push(BatchWaiter { ids, reply });
            }
        }
    }

    /// 整批校验后建任务：任何一个文件不合法，整批拒绝，不产生任务
    fn submit(
        &mut self,
        files: Vec<SourceFile>,
        association_id: Option<String>,
    ) -> Result<Vec<TaskId>> {
        if files.is_empty() {
            return Err(UploadError::validation("empty batch"));
        }
        for file in &files {
            self.validate(file)?;
        }

        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            let task = UploadTask::new(file, association_id.clone());
            let task_id = task.id;
            self.order.push(task_id);
            self.queued.push(task_id);
            self.tasks.insert(task_id, TaskEntry::new(task));
            let _ = self.event_tx.send(UploadEvent::TaskAdded { task_id });
            ids.push(task_id);
        }

        tracing::debug!(count = ids.len(), "batch submitted");
        Ok(ids)
    }

    fn validate(&self, file: &SourceFile) -> Result<()> {
        if file.data.is_empty() {
            return Err(UploadError::validation(format!("file '{}' is empty", file.name)));
        }
        if file.size() > self.config.max_file_bytes {
            return Err(UploadError::validation(format!(
                "file '{}' exceeds size limit ({} > {})",
                file.name,
                format_bytes(file.size()),
                format_bytes(self.config.max_file_bytes),
            )));
        }
        let accepted = self
            .config
            .accepted_types
            .iter()
            .any(|prefix| file.content_type.starts_with(prefix.as_str()));
        if !accepted {
            return Err(UploadError::validation(format!(
                "file '{}' has unsupported content type '{}'",
                file.name, file.content_type,
            )));
        }
        Ok(())
    }

    /// 暂停：中断所有上传中的任务；Pending/Processing 不动（还没开始网络 IO），
    /// 但队列级调度挂起
    fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;

        for task_id in self.order.clone() {
            let Some(entry) = self.tasks.get_mut(&task_id) else { continue };
            if entry.task.status == TaskStatus::Uploading {
                if let Some(token) = entry.token.take() {
                    token.cancel();
                }
                entry.task.status = TaskStatus::Paused;
                let _ = self.event_tx.send(UploadEvent::StateChanged {
                    task_id,
                    old_status: TaskStatus::Uploading,
                    new_status: TaskStatus::Paused,
                });
            }
        }
        tracing::debug!("queue paused");
    }

    /// 恢复：Paused 任务按提交顺序回到 Pending 池
    fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;

        for task_id in self.order.clone() {
            let Some(entry) = self.tasks.get_mut(&task_id) else { continue };
            if entry.task.status == TaskStatus::Paused {
                entry.token = None;
                entry.task.status = TaskStatus::Pending;
                let _ = self.event_tx.send(UploadEvent::StateChanged {
                    task_id,
                    old_status: TaskStatus::Paused,
                    new_status: TaskStatus::Pending,
                });
                // 中断还没归位的任务等 Done 消息再入队
                if entry.join_handle.is_none() {
                    self.queued.push(task_id);
                }
            }
        }
        tracing::debug!("queue resumed");
    }

    /// 取消单个任务：幂等，终态任务是空操作
    fn cancel_task(&mut self, task_id: TaskId) -> Result<()> {
        let Some(entry) = self.tasks.get_mut(&task_id) else {
            return Err(UploadError::TaskNotFound(task_id));
        };
        if entry.task.status.is_terminal() {
            return Ok(());
        }

        if let Some(token) = entry.token.take() {
            token.cancel();
        }
        self.queued.retain(|id| *id != task_id);

        let old_status = entry.task.status;
        entry.task.status = TaskStatus::Cancelled;
        entry.task.completed_at = Some(Utc::now());
        let _ = self.event_tx.send(UploadEvent::StateChanged {
            task_id,
            old_status,
            new_status: TaskStatus::Cancelled,
        });
        self.emit_outcome(task_id, UploadOutcome {
            task_id,
            success: false,
            url: None,
            thumbnail_url: None,
            error: Some("upload cancelled".to_string()),
        });
        Ok(())
    }

    fn cancel_all(&mut self) {
        for task_id in self.order.clone() {
            let _ = self.cancel_task(task_id);
        }
    }

    /// 清除终态的 Completed/Cancelled 任务，返回清除数量
    fn clear_completed(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, entry| {
            !matches!(
                entry.task.status,
                TaskStatus::Completed | TaskStatus::Cancelled
            )
        });
        self.order.retain(|id| self.tasks.contains_key(id));
        before - self.tasks.len()
    }

    /// 调度：未暂停时按 FIFO 补满并发额度
    fn process_queue(&mut self) {
        if self.paused {
            return;
        }

        while self.active < self.config.max_concurrent && !self.queued.is_empty() {
            let task_id = self.queued.remove(0);
            let Some(entry) = self.tasks.get(&task_id) else { continue };
            if entry.task.status == TaskStatus::Pending && entry.join_handle.is_none() {
                self.dispatch(task_id);
            }
        }
    }

    /// 派发一次尝试：Pending → Processing，起执行器任务
    fn dispatch(&mut self, task_id: TaskId) {
        let Some(entry) = self.tasks.get_mut(&task_id) else { return };

        let attempt = entry.task.retry_count;
        // 新尝试开始：清失败原因，进度归零，产物重算
        entry.task.last_error = None;
        entry.task.progress = 0.0;
        entry.task.processed = None;
        entry.task.thumbnail = None;
        if entry.task.started_at.is_none() {
            entry.task.started_at = Some(Utc::now());
        }

        let old_status = entry.task.status;
        entry.task.status = TaskStatus::Processing;
        entry.dispatched_attempt = attempt;

        let token = CancellationToken::new();
        entry.token = Some(token.clone());

        let executor = TransferExecutor {
            storage: self.storage.clone(),
            identity: self.identity.clone(),
            preprocessor: self.preprocessor.clone(),
            token,
            msg_tx: self.msg_tx.clone(),
            stall_timeout: self.config.stall_timeout,
        };
        let snapshot = entry.task.clone();
        let msg_tx = self.msg_tx.clone();
        entry.join_handle = Some(tokio::spawn(async move {
            let result = executor.run(snapshot).await;
            // 通知归位，结果通过 JoinHandle 取回
            let _ = msg_tx.send(ExecutorMsg::Done { task_id, attempt });
            result
        }));

        self.active += 1;
        let _ = self.event_tx.send(UploadEvent::StateChanged {
            task_id,
            old_status,
            new_status: TaskStatus::Processing,
        });
        tracing::debug!(%task_id, attempt, "task dispatched");
    }

    async fn handle_executor_msg(&mut self, msg: ExecutorMsg) {
        match msg {
            ExecutorMsg::Preprocessed { task_id, attempt, processed, thumbnail } => {
                self.handle_preprocessed(task_id, attempt, processed, thumbnail);
            }
            ExecutorMsg::Progress { task_id, attempt, progress } => {
                self.handle_progress(task_id, attempt, progress);
            }
            ExecutorMsg::Done { task_id, attempt } => {
                self.handle_task_done(task_id, attempt).await;
            }
        }
    }

    fn handle_preprocessed(
        &mut self,
        task_id: TaskId,
        attempt: u32,
        processed: Option<super::types::ArtifactInfo>,
        thumbnail: Option<super::types::ArtifactInfo>,
    ) {
        let Some(entry) = self.tasks.get_mut(&task_id) else { return };
        if entry.dispatched_attempt != attempt || entry.task.status != TaskStatus::Processing {
            return;
        }

        entry.task.processed = processed;
        entry.task.thumbnail = thumbnail;

        if self.paused {
            // 队列已暂停：不允许开始新的网络 IO，中断本次尝试，
            // Done 归位时任务转入 Paused
            if let Some(token) = entry.token.take() {
                token.cancel();
            }
            return;
        }

        entry.task.status = TaskStatus::Uploading;
        let _ = self.event_tx.send(UploadEvent::StateChanged {
            task_id,
            old_status: TaskStatus::Processing,
            new_status: TaskStatus::Uploading,
        });
    }

    fn handle_progress(&mut self, task_id: TaskId, attempt: u32, progress: TaskProgress) {
        let Some(entry) = self.tasks.get_mut(&task_id) else { return };
        // 过期尝试或已离开上传态的进度一律丢弃，保证单次尝试内单调
        if entry.dispatched_attempt != attempt || entry.task.status != TaskStatus::Uploading {
            return;
        }
        if progress.percentage > entry.task.progress {
            entry.task.progress = progress.percentage;
        }
        let _ = self.event_tx.send(UploadEvent::Progress(progress));
    }

    /// 一次尝试归位：释放并发额度，按结果分流
    async fn handle_task_done(&mut self, task_id: TaskId, attempt: u32) {
        // 每次派发恰好对应一条 Done；任务即便已被清出列表，额度也要归还
        self.active = self.active.saturating_sub(1);

        let join_handle = {
            let Some(entry) = self.tasks.get_mut(&task_id) else { return };
            if entry.dispatched_attempt != attempt {
                return;
            }
            entry.token = None;
            entry.join_handle.take()
        };
        let Some(join_handle) = join_handle else { return };

        let result = match join_handle.await {
            Ok(result) => result,
            Err(err) => Err(UploadError::internal(format!("executor task panicked: {err}"))),
        };

        match result {
            Ok(outcome) => self.finish_success(task_id, outcome),
            Err(err) if err.is_aborted() => self.finish_aborted(task_id),
            Err(err) => self.finish_failure(task_id, err),
        }
    }

    fn finish_success(&mut self, task_id: TaskId, outcome: TransferOutcome) {
        let Some(entry) = self.tasks.get_mut(&task_id) else { return };
        if entry.task.status == TaskStatus::Cancelled {
            // 取消和完成赛跑时取消语义优先，已传完的结果丢弃
            return;
        }

        let old_status = entry.task.status;
        entry.task.status = TaskStatus::Completed;
        entry.task.progress = 100.0;
        entry.task.uploaded_url = Some(outcome.url.clone());
        entry.task.thumbnail_url = outcome.thumbnail_url.clone();
        entry.task.completed_at = Some(Utc::now());
        let total_bytes = entry.task.file.size();

        let _ = self.event_tx.send(UploadEvent::StateChanged {
            task_id,
            old_status,
            new_status: TaskStatus::Completed,
        });
        // 没有细粒度进度回调的存储端也保证收尾 100
        let _ = self.event_tx.send(UploadEvent::Progress(TaskProgress {
            task_id,
            bytes_sent: total_bytes,
            total_bytes,
            percentage: 100.0,
            speed: 0.0,
            eta: None,
        }));
        self.emit_outcome(task_id, UploadOutcome {
            task_id,
            success: true,
            url: Some(outcome.url),
            thumbnail_url: outcome.thumbnail_url,
            error: None,
        });
    }

    /// 中断归位：不是失败，不计入重试
    fn finish_aborted(&mut self, task_id: TaskId) {
        let Some(entry) = self.tasks.get_mut(&task_id) else { return };
        match entry.task.status {
            // 取消路径已发过终态事件
            TaskStatus::Cancelled => {}
            // pause() 已标记
            TaskStatus::Paused => {}
            // 中断确认前就被 resume 了，现在重新入队
            TaskStatus::Pending => {
                if !self.queued.contains(&task_id) {
                    self.queued.push(task_id);
                }
            }
            // 预处理阶段被暂停打断；中断确认期间队列可能又恢复了
            TaskStatus::Processing | TaskStatus::Uploading => {
                let old_status = entry.task.status;
                let new_status = if self.paused {
                    TaskStatus::Paused
                } else {
                    TaskStatus::Pending
                };
                entry.task.status = new_status;
                let _ = self.event_tx.send(UploadEvent::StateChanged {
                    task_id,
                    old_status,
                    new_status,
                });
                if new_status == TaskStatus::Pending && !self.queued.contains(&task_id) {
                    self.queued.push(task_id);
                }
            }
            TaskStatus::Completed | TaskStatus::Error => {}
        }
    }

    fn finish_failure(&mut self, task_id: TaskId, err: UploadError) {
        let Some(entry) = self.tasks.get_mut(&task_id) else { return };
        if entry.task.status == TaskStatus::Cancelled {
            return;
        }

        let message = err.to_string();
        match self.policy.decide(entry.task.retry_count, &err) {
            RetryDecision::Retry(delay) => {
                entry.task.retry_count += 1;
                entry.task.last_error = Some(message.clone());
                entry.task.progress = 0.0;
                let old_status = entry.task.status;
                entry.task.status = TaskStatus::Pending;
                let _ = self.event_tx.send(UploadEvent::StateChanged {
                    task_id,
                    old_status,
                    new_status: TaskStatus::Pending,
                });
                tracing::debug!(
                    %task_id,
                    retry = entry.task.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "scheduling retry"
                );

                // 确定性重试定时器：到期发消息重新入队，等待期间不占并发额度
                let retry_tx = self.retry_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = retry_tx.send(task_id);
                });
            }
            RetryDecision::Terminal => {
                entry.task.last_error = Some(message.clone());
                entry.task.completed_at = Some(Utc::now());
                let old_status = entry.task.status;
                entry.task.status = TaskStatus::Error;
                let _ = self.event_tx.send(UploadEvent::StateChanged {
                    task_id,
                    old_status,
                    new_status: TaskStatus::Error,
                });
                tracing::warn!(%task_id, error = %message, "upload failed");
                self.emit_outcome(task_id, UploadOutcome {
                    task_id,
                    success: false,
                    url: None,
                    thumbnail_url: None,
                    error: Some(message),
                });
            }
        }
    }

    fn handle_retry_due(&mut self, task_id: TaskId) {
        let Some(entry) = self.tasks.get(&task_id) else { return };
        if entry.task.status == TaskStatus::Pending
            && entry.join_handle.is_none()
            && !self.queued.contains(&task_id)
        {
            self.queued.push(task_id);
        }
    }

    fn emit_outcome(&mut self, task_id: TaskId, outcome: UploadOutcome) {
        let Some(entry) = self.tasks.get_mut(&task_id) else { return };
        if entry.done_emitted {
            return;
        }
        entry.done_emitted = true;
        entry.outcome = Some(outcome.clone());
        let _ = self.event_tx.send(UploadEvent::TaskDone(outcome));
    }

    /// 批次等待：全部终态（或已被清除）即应答
    fn resolve_waiters(&mut self) {
        if self.waiters.is_empty() {
            return;
        }

        let mut remaining = Vec::new();
        for waiter in std::mem::take(&mut self.waiters) {
            let all_done = waiter.ids.iter().all(|id| {
                self.tasks
                    .get(id)
                    .map_or(true, |entry| entry.task.status.is_terminal())
            });
            if all_done {
                let outcomes = waiter
                    .ids
                    .iter()
                    .filter_map(|id| self.tasks.get(id).and_then(|entry| entry.outcome.clone()))
                    .collect();
                let _ = waiter.reply.send(outcomes);
            } else {
                remaining.push(waiter);
            }
        }
        self.waiters = remaining;
    }
}
