use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};
use tokio::sync::Semaphore;
use uplink::storage::ProgressFn;
use uplink::{
    IdentityProvider, ObjectStorage, PreprocessConfig, QueueConfig, SourceFile, StaticIdentity,
    StorageError, TaskStatus, UploadError, UploadEvent, UploadQueue, UploadQueueHandle,
};

/// 模拟对象存储 - 用于测试
///
/// - `gate`：每次 put 消耗一个信号量许可，测试端靠补发许可放行
/// - `script`：预先排好的失败剧本，按调用顺序弹出
struct MockStorage {
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    script: Mutex<VecDeque<StorageError>>,
    calls: AtomicU32,
    concurrent: AtomicUsize,
    max_concurrent_seen: AtomicUsize,
    keys: Mutex<Vec<String>>,
    content_types: Mutex<Vec<String>>,
}

impl MockStorage {
    fn new() -> Self {
        Self {
            delay: Duration::from_millis(10),
            gate: None,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent_seen: AtomicUsize::new(0),
            keys: Mutex::new(Vec::new()),
            content_types: Mutex::new(Vec::new()),
        }
    }

    fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn with_failures(self, failures: Vec<StorageError>) -> Self {
        *self.script.lock().unwrap() = failures.into();
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

/// 并发计数守卫：put 的 future 被中途 drop 时也要正确递减
struct ConcurrencyGuard<'a> {
    concurrent: &'a AtomicUsize,
}

impl<'a> ConcurrencyGuard<'a> {
    fn enter(concurrent: &'a AtomicUsize, max_seen: &AtomicUsize) -> Self {
        let current = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        max_seen.fetch_max(current, Ordering::SeqCst);
        Self { concurrent }
    }
}

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStorage for MockStorage {
    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        progress: Option<ProgressFn>,
    ) -> Result<String, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push(key.to_string());
        self.content_types
            .lock()
            .unwrap()
            .push(content_type.to_string());
        let _guard = ConcurrencyGuard::enter(&self.concurrent, &self.max_concurrent_seen);

        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| StorageError::Network("gate closed".to_string()))?;
            permit.forget();
        }

        tokio::time::sleep(self.delay).await;

        if let Some(progress) = &progress {
            let total = data.len() as u64;
            progress(total / 2);
            progress(total);
        }

        Ok(format!("https://mock.storage/{key}"))
    }
}

/// 无法解析身份的提供方
struct NoIdentity;

impl IdentityProvider for NoIdentity {
    fn current_user(&self) -> Result<String, uplink::storage::IdentityError> {
        Err(uplink::storage::IdentityError("no active session".to_string()))
    }
}

fn test_config(max_concurrent: usize) -> QueueConfig {
    QueueConfig {
        max_concurrent,
        max_retries: 3,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(200),
        preprocess: PreprocessConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn build_queue(storage: Arc<MockStorage>, config: QueueConfig) -> UploadQueueHandle {
    UploadQueue::new(storage, Arc::new(StaticIdentity::new("user-1")), config)
}

fn video_file(name: &str) -> SourceFile {
    SourceFile::new(name, "video/mp4", Bytes::from(vec![7u8; 64 * 1024]))
}

fn png_file(name: &str, width: u32, height: u32) -> SourceFile {
    let img = RgbaImage::from_pixel(width, height, Rgba([30, 144, 255, 255]));
    let mut buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .unwrap();
    SourceFile::new(name, "image/png", Bytes::from(buffer))
}

/// 后台收集事件
fn collect_events(queue: &UploadQueue) -> Arc<Mutex<Vec<UploadEvent>>> {
    let mut receiver = queue.subscribe_events();
    let store = Arc::new(Mutex::new(Vec::new()));
    let sink = store.clone();
    tokio::spawn(async move {
        while let Ok(event) = receiver.recv().await {
            sink.lock().unwrap().push(event);
        }
    });
    store
}

// 场景 A：5 个文件、并发 2 → 立即 2 个上传中 3 个等待，按 FIFO 依次递补
#[tokio::test]
async fn test_fifo_admission_with_bounded_concurrency() {
    let gate = Arc::new(Semaphore::new(0));
    let storage = Arc::new(MockStorage::new().with_gate(gate.clone()));
    let handle = build_queue(storage.clone(), test_config(2));
    let events = collect_events(&handle.queue);

    let files = (0..5).map(|i| video_file(&format!("f{i}.mp4"))).collect();
    let ids = handle.queue.submit(files, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = handle.queue.stats().await.unwrap();
    assert_eq!(stats.uploading, 2);
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.total, 5);

    gate.add_permits(5);
    let outcomes = handle.queue.wait(ids.clone()).await.unwrap();
    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.iter().all(|o| o.success));
    assert_eq!(storage.keys().len(), 5);

    // 调度顺序严格等于提交顺序
    tokio::time::sleep(Duration::from_millis(100)).await;
    let dispatch_order: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            UploadEvent::StateChanged {
                task_id,
                new_status: TaskStatus::Processing,
                ..
            } => Some(*task_id),
            _ => None,
        })
        .collect();
    assert_eq!(dispatch_order, ids);

    assert!(storage.max_concurrent_seen.load(Ordering::SeqCst) <= 2);
    handle.shutdown().await.unwrap();
}

// 场景 B：第一次网络错误 → 退避后重试成功，重试计数和进度复位可观察
#[tokio::test]
async fn test_network_failure_retries_with_backoff() {
    let storage = Arc::new(
        MockStorage::new()
            .with_failures(vec![StorageError::Network("connection reset".to_string())]),
    );
    let mut config = test_config(2);
    config.base_delay = Duration::from_millis(200);
    let handle = build_queue(storage.clone(), config);

    let mut receiver = handle.queue.subscribe_events();
    let ids = handle.queue.submit(vec![video_file("clip.mp4")], None).await.unwrap();
    let task_id = ids[0];

    // 等待任务因失败回到 Pending，此时退避中：重试已计数、进度归零、错误可见
    loop {
        match receiver.recv().await.unwrap() {
            UploadEvent::StateChanged { new_status: TaskStatus::Pending, .. } => break,
            _ => {}
        }
    }
    let task = handle.queue.task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.progress, 0.0);
    assert!(task.last_error.as_deref().unwrap().contains("connection reset"));

    let outcomes = handle.queue.wait(ids).await.unwrap();
    assert!(outcomes[0].success);
    assert_eq!(storage.calls(), 2);

    let task = handle.queue.task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.progress, 100.0);
    // 新尝试开始后错误已清空
    assert!(task.last_error.is_none());
    assert!(task.uploaded_url.is_some());
    handle.shutdown().await.unwrap();
}

// 场景 C：暂停中断上传中的任务，Pending 原地不动；恢复后全部回到调度
#[tokio::test]
async fn test_pause_aborts_uploads_and_resume_requeues() {
    let gate = Arc::new(Semaphore::new(0));
    let storage = Arc::new(MockStorage::new().with_gate(gate.clone()));
    let handle = build_queue(storage.clone(), test_config(2));

    let files = (0..3).map(|i| video_file(&format!("p{i}.mp4"))).collect();
    let ids = handle.queue.submit(files, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = handle.queue.stats().await.unwrap();
    assert_eq!(stats.uploading, 2);
    assert_eq!(stats.pending, 1);

    handle.queue.pause().await.unwrap();
    let stats = handle.queue.stats().await.unwrap();
    assert_eq!(stats.paused, 2);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.uploading, 0);

    // 中断必须真正终止传输（future 被 drop，许可没有被消耗）
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(storage.concurrent.load(Ordering::SeqCst), 0);
    // 暂停期间不派发新任务
    let stats = handle.queue.stats().await.unwrap();
    assert_eq!(stats.uploading, 0);

    handle.queue.resume().await.unwrap();
    gate.add_permits(10);
    let outcomes = handle.queue.wait(ids).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.success));
    handle.shutdown().await.unwrap();
}

// 场景 E：鉴权失败是终态，不重试，恰好一次完成回调
#[tokio::test]
async fn test_auth_failure_is_terminal() {
    let storage = Arc::new(
        MockStorage::new().with_failures(vec![StorageError::Auth { status: 401 }]),
    );
    let handle = build_queue(storage.clone(), test_config(2));
    let events = collect_events(&handle.queue);

    let ids = handle.queue.submit(vec![video_file("secret.mp4")], None).await.unwrap();
    let outcomes = handle.queue.wait(ids.clone()).await.unwrap();

    assert!(!outcomes[0].success);
    assert!(outcomes[0].error.as_deref().unwrap().contains("Authentication"));
    assert_eq!(storage.calls(), 1);

    let task = handle.queue.task(ids[0]).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.retry_count, 0);
    assert!(task.uploaded_url.is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let done_count = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, UploadEvent::TaskDone(_)))
        .count();
    assert_eq!(done_count, 1);
    handle.shutdown().await.unwrap();
}

// 重试耗尽后转终态 Error
#[tokio::test]
async fn test_retries_exhausted_becomes_error() {
    let failures = (0..10)
        .map(|_| StorageError::Network("flaky".to_string()))
        .collect();
    let storage = Arc::new(MockStorage::new().with_failures(failures));
    let mut config = test_config(1);
    config.max_retries = 2;
    let handle = build_queue(storage.clone(), config);

    let ids = handle.queue.submit(vec![video_file("doomed.mp4")], None).await.unwrap();
    let outcomes = handle.queue.wait(ids.clone()).await.unwrap();

    assert!(!outcomes[0].success);
    // 首次 + 2 次重试
    assert_eq!(storage.calls(), 3);
    let task = handle.queue.task(ids[0]).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.retry_count, 2);
    assert!(task.last_error.is_some());
    handle.shutdown().await.unwrap();
}

// 取消幂等：第二次取消是空操作，终态回调只发一次
#[tokio::test]
async fn test_cancel_is_idempotent_and_terminal() {
    let gate = Arc::new(Semaphore::new(0));
    let storage = Arc::new(MockStorage::new().with_gate(gate.clone()));
    let handle = build_queue(storage.clone(), test_config(2));
    let events = collect_events(&handle.queue);

    let ids = handle.queue.submit(vec![video_file("c.mp4")], None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    handle.queue.cancel(Some(ids[0])).await.unwrap();
    handle.queue.cancel(Some(ids[0])).await.unwrap();

    let task = handle.queue.task(ids[0]).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.uploaded_url.is_none());

    // 取消后不会被重新调度
    gate.add_permits(10);
    tokio::time::sleep(Duration::from_millis(150)).await;
    let task = handle.queue.task(ids[0]).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    let done_count = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, UploadEvent::TaskDone(_)))
        .count();
    assert_eq!(done_count, 1);

    // 不存在的任务报错
    let missing = handle.queue.cancel(Some(uplink::TaskId::new())).await;
    assert!(matches!(missing, Err(UploadError::TaskNotFound(_))));
    handle.shutdown().await.unwrap();
}

// 全量取消 + 清理
#[tokio::test]
async fn test_cancel_all_and_clear_completed() {
    let gate = Arc::new(Semaphore::new(0));
    let storage = Arc::new(MockStorage::new().with_gate(gate));
    let handle = build_queue(storage, test_config(2));

    let files = (0..3).map(|i| video_file(&format!("x{i}.mp4"))).collect();
    let ids = handle.queue.submit(files, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    handle.queue.cancel(None).await.unwrap();
    let outcomes = handle.queue.wait(ids).await.unwrap();
    assert!(outcomes.iter().all(|o| !o.success));

    let stats = handle.queue.stats().await.unwrap();
    assert_eq!(stats.cancelled, 3);
    assert_eq!(stats.total, 3);

    let cleared = handle.queue.clear_completed().await.unwrap();
    assert_eq!(cleared, 3);
    let stats = handle.queue.stats().await.unwrap();
    assert_eq!(stats.total, 0);
    handle.shutdown().await.unwrap();
}

// 场景 D 的端到端侧：图片被压缩 + 产出缩略图，两个对象都落存储
#[tokio::test]
async fn test_image_preprocessing_end_to_end() {
    let storage = Arc::new(MockStorage::new());
    let mut config = test_config(2);
    config.preprocess = PreprocessConfig::default();
    let handle = build_queue(storage.clone(), config);

    let ids = handle
        .queue
        .submit(vec![png_file("photo.png", 2500, 1000)], None)
        .await
        .unwrap();
    let outcomes = handle.queue.wait(ids.clone()).await.unwrap();

    assert!(outcomes[0].success);
    assert!(outcomes[0].thumbnail_url.is_some());

    let keys = storage.keys();
    assert_eq!(keys.len(), 2);
    assert!(keys[0].ends_with(".jpg"), "main upload should be the compressed jpeg: {}", keys[0]);
    assert!(keys[1].contains("thumb_"), "second upload should be the thumbnail: {}", keys[1]);
    let content_types = storage.content_types.lock().unwrap().clone();
    assert!(content_types.iter().all(|ct| ct == "image/jpeg"));

    let task = handle.queue.task(ids[0]).await.unwrap().unwrap();
    let processed = task.processed.unwrap();
    assert!(processed.width <= 1920 && processed.height <= 1920);
    let thumbnail = task.thumbnail.unwrap();
    assert!(thumbnail.width <= 300 && thumbnail.height <= 300);
    handle.shutdown().await.unwrap();
}

// 校验失败在提交时拒绝，不产生任务
#[tokio::test]
async fn test_validation_rejects_at_submit() {
    let storage = Arc::new(MockStorage::new());
    let mut config = test_config(2);
    config.max_file_bytes = 1024;
    let handle = build_queue(storage.clone(), config);

    let oversized = SourceFile::new("big.mp4", "video/mp4", Bytes::from(vec![0u8; 4096]));
    let result = handle.queue.submit(vec![oversized], None).await;
    assert!(matches!(result, Err(UploadError::Validation(_))));

    let unsupported = SourceFile::new("doc.pdf", "application/pdf", Bytes::from_static(b"%PDF"));
    let result = handle.queue.submit(vec![unsupported], None).await;
    assert!(matches!(result, Err(UploadError::Validation(_))));

    // 整批原子：混入一个坏文件时好文件也不入队
    let mixed = vec![
        video_file("good.mp4"),
        SourceFile::new("bad.bin", "application/octet-stream", Bytes::from_static(b"xx")),
    ];
    assert!(handle.queue.submit(mixed, None).await.is_err());

    let stats = handle.queue.stats().await.unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(storage.calls(), 0);
    handle.shutdown().await.unwrap();
}

// 延迟补挂所属实体：只影响仍在 Pending 的任务
#[tokio::test]
async fn test_update_association_for_pending_tasks() {
    let storage = Arc::new(MockStorage::new());
    let handle = build_queue(storage.clone(), test_config(2));

    // 先暂停，让任务停在 Pending
    handle.queue.pause().await.unwrap();
    let files = (0..2).map(|i| video_file(&format!("a{i}.mp4"))).collect();
    let ids = handle.queue.submit(files, None).await.unwrap();

    let updated = handle.queue.update_association("leaf-7").await.unwrap();
    assert_eq!(updated, 2);

    handle.queue.resume().await.unwrap();
    let outcomes = handle.queue.wait(ids).await.unwrap();
    assert!(outcomes.iter().all(|o| o.success));
    assert!(storage.keys().iter().all(|k| k.contains("/leaf-7/")));
    handle.shutdown().await.unwrap();
}

// 身份解析失败是终态错误
#[tokio::test]
async fn test_identity_failure_is_terminal() {
    let storage = Arc::new(MockStorage::new());
    let handle = UploadQueue::new(storage.clone(), Arc::new(NoIdentity), test_config(2));

    let ids = handle.queue.submit(vec![video_file("i.mp4")], None).await.unwrap();
    let outcomes = handle.queue.wait(ids.clone()).await.unwrap();

    assert!(!outcomes[0].success);
    assert!(outcomes[0].error.as_deref().unwrap().contains("Identity"));
    assert_eq!(storage.calls(), 0);
    let task = handle.queue.task(ids[0]).await.unwrap().unwrap();
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.status, TaskStatus::Error);
    handle.shutdown().await.unwrap();
}

// 单次尝试内进度单调不减，收尾为 100
#[tokio::test]
async fn test_progress_is_monotonic_within_attempt() {
    let storage = Arc::new(MockStorage::new());
    let handle = build_queue(storage, test_config(1));
    let events = collect_events(&handle.queue);

    let ids = handle.queue.submit(vec![video_file("m.mp4")], None).await.unwrap();
    handle.queue.wait(ids.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let percentages: Vec<f32> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            UploadEvent::Progress(p) if p.task_id == ids[0] => Some(p.percentage),
            _ => None,
        })
        .collect();

    assert!(!percentages.is_empty());
    assert!(percentages.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {percentages:?}");
    assert_eq!(*percentages.last().unwrap(), 100.0);
    handle.shutdown().await.unwrap();
}

// 并发上限在混合负载下也不被突破
#[tokio::test]
async fn test_max_concurrent_invariant() {
    let storage = Arc::new(MockStorage::new());
    let mut config = test_config(3);
    config.base_delay = Duration::from_millis(10);
    let handle = build_queue(storage.clone(), config);

    let files = (0..8).map(|i| video_file(&format!("n{i}.mp4"))).collect();
    let ids = handle.queue.submit(files, None).await.unwrap();
    let outcomes = handle.queue.wait(ids).await.unwrap();

    assert_eq!(outcomes.len(), 8);
    assert!(outcomes.iter().all(|o| o.success));
    assert!(storage.max_concurrent_seen.load(Ordering::SeqCst) <= 3);
    handle.shutdown().await.unwrap();
}

// 批次等待返回逐任务结果，顺序与提交一致
#[tokio::test]
async fn test_wait_returns_per_task_outcomes() {
    let storage = Arc::new(
        MockStorage::new().with_failures(vec![StorageError::Auth { status: 403 }]),
    );
    let handle = build_queue(storage, test_config(1));

    let ids = handle
        .queue
        .submit(vec![video_file("w0.mp4"), video_file("w1.mp4")], None)
        .await
        .unwrap();
    let outcomes = handle.queue.wait(ids.clone()).await.unwrap();

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].task_id, ids[0]);
    assert!(!outcomes[0].success);
    assert_eq!(outcomes[1].task_id, ids[1]);
    assert!(outcomes[1].success);
    handle.shutdown().await.unwrap();
}
