use super::types::{QueueStats, TaskStatus, UploadTask};

/// 从任务快照折算队列统计，只读不可变
///
/// 整体进度是当前列表内所有任务进度的算术平均：
/// 未开始按 0 计，已完成按 100 计，已取消的任务在被清除前仍参与分母。
pub fn aggregate<'a>(tasks: impl Iterator<Item = &'a UploadTask>) -> QueueStats {
    let mut stats = QueueStats::default();
    let mut progress_sum = 0.0f64;

    for task in tasks {
        match task.status {
            TaskStatus::Pending => stats.pending += 1,
            TaskStatus::Processing => stats.processing += 1,
            TaskStatus::Uploading => stats.uploading += 1,
            TaskStatus::Paused => stats.paused += 1,
            TaskStatus::Completed => stats.completed += 1,
            TaskStatus::Error => stats.error += 1,
            TaskStatus::Cancelled => stats.cancelled += 1,
        }
        stats.total += 1;
        progress_sum += task.progress as f64;
    }

    if stats.total > 0 {
        stats.overall_progress = (progress_sum / stats.total as f64) as f32;
    }

    stats
}
