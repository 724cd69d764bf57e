use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use super::ProgressFn;

pin_project! {
    /// 包装一个字节流，每产出一块数据就以累计字节数回调一次
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        bytes_sent: u64,
        progress: Option<ProgressFn>,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, progress: Option<ProgressFn>) -> Self {
        Self {
            inner,
            bytes_sent: 0,
            progress,
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    *this.bytes_sent += chunk.len() as u64;
                    if let Some(callback) = this.progress {
                        callback(*this.bytes_sent);
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// 速度计算器：环形缓冲区保存最近的 (时刻, 累计字节) 采样
pub(crate) struct SpeedTracker {
    samples: Vec<(Instant, u64)>,
    write_index: usize,
    max_samples: usize,
    start_time: Instant,
}

impl SpeedTracker {
    pub(crate) fn new() -> Self {
        let max_samples = 16;
        Self {
            samples: Vec::with_capacity(max_samples),
            write_index: 0,
            max_samples,
            start_time: Instant::now(),
        }
    }

    pub(crate) fn add_sample(&mut self, bytes_total: u64) {
        let now = Instant::now();
        if self.samples.len() < self.max_samples {
            self.samples.push((now, bytes_total));
        } else {
            // 缓冲区已满，覆盖最老的样本
            self.samples[self.write_index] = (now, bytes_total);
            self.write_index = (self.write_index + 1) % self.max_samples;
        }
    }

    /// 瞬时速度（字节/秒），基于窗口内最老与最新样本
    pub(crate) fn instant_speed(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }

        let oldest = if self.samples.len() < self.max_samples {
            self.samples[0]
        } else {
            self.samples[self.write_index]
        };
        let newest_index = if self.samples.len() < self.max_samples {
            self.samples.len() - 1
        } else {
            (self.write_index + self.max_samples - 1) % self.max_samples
        };
        let newest = self.samples[newest_index];

        let elapsed = newest.0.duration_since(oldest.0).as_secs_f64();
        if elapsed <= 0.0 || newest.1 <= oldest.1 {
            return 0.0;
        }

        (newest.1 - oldest.1) as f64 / elapsed
    }

    /// 平均速度（字节/秒），基于总耗时
    pub(crate) fn average_speed(&self, bytes_total: u64) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            bytes_total as f64 / elapsed
        } else {
            0.0
        }
    }

    /// 预计剩余时间
    pub(crate) fn eta(&self, bytes_total: u64, total_bytes: u64) -> Option<Duration> {
        let remaining = total_bytes.saturating_sub(bytes_total);
        if remaining == 0 {
            return Some(Duration::ZERO);
        }

        let speed = self.instant_speed();
        if speed > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / speed))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use futures::StreamExt;

    #[tokio::test]
    async fn test_progress_stream_reports_cumulative_bytes() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"hello")),
            Ok(Bytes::from_static(b" world")),
        ];
        let last_seen = Arc::new(AtomicU64::new(0));
        let seen = last_seen.clone();
        let callback: ProgressFn = Arc::new(move |bytes| {
            seen.store(bytes, Ordering::SeqCst);
        });

        let mut stream = ProgressStream::new(futures::stream::iter(chunks), Some(callback));
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(collected, b"hello world");
        assert_eq!(last_seen.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_speed_tracker_needs_two_samples() {
        let mut tracker = SpeedTracker::new();
        assert_eq!(tracker.instant_speed(), 0.0);
        tracker.add_sample(100);
        assert_eq!(tracker.instant_speed(), 0.0);
    }

    #[test]
    fn test_eta_zero_when_done() {
        let tracker = SpeedTracker::new();
        assert_eq!(tracker.eta(1000, 1000), Some(Duration::ZERO));
    }
}
