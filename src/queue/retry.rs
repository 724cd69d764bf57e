use std::time::Duration;
use crate::media::PreprocessError;
use crate::storage::StorageError;
use super::errors::UploadError;

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 退避指定时长后重新入队
    Retry(Duration),
    /// 终态失败，不再重试
    Terminal,
}

/// 重试策略：纯函数，无内部状态
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数
    pub max_retries: u32,
    /// 指数退避基数
    pub base_delay: Duration,
    /// 退避上限
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// 根据已重试次数和错误类型给出决策
    pub fn decide(&self, attempt: u32, error: &UploadError) -> RetryDecision {
        if attempt >= self.max_retries || !Self::is_retryable(error) {
            RetryDecision::Terminal
        } else {
            RetryDecision::Retry(self.delay_for(attempt))
        }
    }

    /// 错误分类：瞬时错误可重试，鉴权/配额/损坏输入为终态
    pub fn is_retryable(error: &UploadError) -> bool {
        match error {
            UploadError::Storage(err) => match err {
                StorageError::Network(_) | StorageError::Timeout | StorageError::Io(_) => true,
                // 5xx 属于服务端瞬时故障
                StorageError::Server { status, .. } => *status >= 500,
                StorageError::Auth { .. }
                | StorageError::QuotaExceeded
                | StorageError::InvalidResponse(_) => false,
            },
            // 资源紧张导致的预处理失败可重试，解码失败说明文件本身损坏
            UploadError::Preprocess(err) => matches!(err, PreprocessError::Resource(_)),
            UploadError::Validation(_)
            | UploadError::Identity(_)
            | UploadError::Aborted
            | UploadError::TaskNotFound(_)
            | UploadError::QueueShutdown
            | UploadError::Internal(_) => false,
        }
    }

    /// 计算第 attempt 次重试的退避时长：base * 2^attempt，封顶 max_delay
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(30) as i32);
        std::cmp::min(Duration::from_secs_f64(delay), self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_error() -> UploadError {
        UploadError::Storage(StorageError::Network("connection reset".to_string()))
    }

    #[test]
    fn test_exponential_backoff_with_cap() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(8));

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        // 封顶
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(20), Duration::from_secs(8));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RetryPolicy::is_retryable(&network_error()));
        assert!(RetryPolicy::is_retryable(&UploadError::Storage(
            StorageError::Timeout
        )));
        assert!(RetryPolicy::is_retryable(&UploadError::Storage(
            StorageError::Server {
                status: 503,
                message: "unavailable".to_string()
            }
        )));
        assert!(RetryPolicy::is_retryable(&UploadError::Preprocess(
            PreprocessError::Resource("out of memory".to_string())
        )));
    }

    #[test]
    fn test_terminal_classification() {
        assert!(!RetryPolicy::is_retryable(&UploadError::Storage(
            StorageError::Auth { status: 401 }
        )));
        assert!(!RetryPolicy::is_retryable(&UploadError::Storage(
            StorageError::QuotaExceeded
        )));
        assert!(!RetryPolicy::is_retryable(&UploadError::Storage(
            StorageError::Server {
                status: 404,
                message: "not found".to_string()
            }
        )));
        assert!(!RetryPolicy::is_retryable(&UploadError::Preprocess(
            PreprocessError::Decode("truncated jpeg".to_string())
        )));
        assert!(!RetryPolicy::is_retryable(&UploadError::Identity(
            "no session".to_string()
        )));
        assert!(!RetryPolicy::is_retryable(&UploadError::Aborted));
    }

    #[test]
    fn test_decide_respects_max_retries() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_secs(1));

        assert_eq!(
            policy.decide(0, &network_error()),
            RetryDecision::Retry(Duration::from_millis(10))
        );
        assert_eq!(
            policy.decide(1, &network_error()),
            RetryDecision::Retry(Duration::from_millis(20))
        );
        // 已达到最大重试次数
        assert_eq!(policy.decide(2, &network_error()), RetryDecision::Terminal);
    }

    #[test]
    fn test_decide_terminal_error_ignores_attempt() {
        let policy = RetryPolicy::default();
        let auth = UploadError::Storage(StorageError::Auth { status: 403 });
        assert_eq!(policy.decide(0, &auth), RetryDecision::Terminal);
    }
}
