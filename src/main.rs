use std::sync::Arc;
use anyhow::Context;
use tracing_subscriber::EnvFilter;
use uplink::config::Config;
use uplink::utils::format_speed;
use uplink::{
    HttpObjectStorage, HttpStorageConfig, QueueConfig, SourceFile, StaticIdentity, UploadEvent,
    UploadQueue,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load("config.toml")?;
    let storage = Arc::new(HttpObjectStorage::new(HttpStorageConfig {
        endpoint: config.endpoint.clone(),
        token: config.token.clone(),
        ..Default::default()
    })?);
    let identity = Arc::new(StaticIdentity::new(config.user.clone()));
    let handle = UploadQueue::new(
        storage,
        identity,
        config.queue.clone().unwrap_or_else(QueueConfig::default),
    );

    // 打印进度和结果
    let mut events = handle.queue.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                UploadEvent::Progress(progress) => {
                    println!(
                        "[{}] {:.1}% ({})",
                        progress.task_id,
                        progress.percentage,
                        format_speed(progress.speed),
                    );
                }
                UploadEvent::StateChanged { task_id, new_status, .. } => {
                    println!("[{task_id}] -> {new_status:?}");
                }
                _ => {}
            }
        }
    });

    let mut files = Vec::with_capacity(config.files.len());
    for path in &config.files {
        files.push(
            SourceFile::from_path(path)
                .await
                .with_context(|| format!("failed to read file: {path}"))?,
        );
    }

    let ids = handle.queue.submit(files, config.association.clone()).await?;
    let outcomes = handle.queue.wait(ids).await?;
    for outcome in outcomes {
        match (outcome.success, outcome.url) {
            (true, Some(url)) => println!("[{}] uploaded: {url}", outcome.task_id),
            _ => println!(
                "[{}] failed: {}",
                outcome.task_id,
                outcome.error.unwrap_or_else(|| "unknown".to_string()),
            ),
        }
    }

    printer.abort();
    handle.shutdown().await?;
    Ok(())
}
