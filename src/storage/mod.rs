mod http;
mod progress;

pub use http::{HttpObjectStorage, HttpStorageConfig};
pub use progress::ProgressStream;
pub(crate) use progress::SpeedTracker;

use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// 进度回调：参数为累计已发送字节数
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// 存储操作错误
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Transfer timed out")]
    Timeout,

    #[error("Authentication rejected: status {status}")]
    Auth { status: u16 },

    #[error("Storage quota exceeded")]
    QuotaExceeded,

    #[error("Server error: status {status}, message: {message}")]
    Server { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// 按响应状态码归类
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::Auth { status },
            // 402/413/507: 配额或容量不足
            402 | 413 | 507 => Self::QuotaExceeded,
            _ => Self::server_error(status, message),
        }
    }

    /// 传输层错误归类（超时与连接失败都是瞬时错误）
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// 对象存储抽象：所有存储后端都必须实现此接口
///
/// 中途取消由调用方负责：在 `put_object` 的 future 外层做 select，
/// drop future 即终止传输。
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// 上传一个对象，返回可持久访问的 URL
    ///
    /// `progress` 以累计字节数回调，同一次调用内单调不减。
    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        progress: Option<ProgressFn>,
    ) -> Result<String, StorageError>;
}

/// 身份解析失败
#[derive(Error, Debug)]
#[error("identity unresolved: {0}")]
pub struct IdentityError(pub String);

/// 身份提供方：给出当前操作用户的标识，用于存储 key 的命名空间
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Result<String, IdentityError>;
}

/// 固定身份（测试和单用户客户端场景）
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    user_id: String,
}

impl StaticIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Result<String, IdentityError> {
        if self.user_id.is_empty() {
            return Err(IdentityError("empty user id".to_string()));
        }
        Ok(self.user_id.clone())
    }
}
