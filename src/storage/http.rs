use std::time::Duration;
use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use futures_util::stream;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use url::Url;
use super::progress::ProgressStream;
use super::{ObjectStorage, ProgressFn, StorageError};

/// 上传请求体的分块大小
const BODY_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct HttpStorageConfig {
    /// 对象存储服务的基地址，如 `https://storage.example.com/objects`
    pub endpoint: String,
    /// Bearer token，可选
    pub token: Option<String>,
    /// 整体请求超时
    pub timeout: Duration,
}

impl Default for HttpStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            token: None,
            timeout: Duration::from_secs(300), // 5 分钟
        }
    }
}

/// 基于 HTTP PUT 的对象存储客户端
///
/// 语义约定：`PUT {endpoint}/{key}` 提交对象字节，成功响应的
/// `Location` 头（或 JSON 体中的 `url` 字段）给出持久 URL，
/// 都没有时退回到请求地址本身。
#[derive(Debug, Clone)]
pub struct HttpObjectStorage {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpObjectStorage {
    pub fn new(config: HttpStorageConfig) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| StorageError::Network(err.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint, key)
    }

    fn create_headers(&self, content_type: &str, name: &str) -> Result<HeaderMap, StorageError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Content-Type",
            content_type
                .parse()
                .map_err(|_| StorageError::InvalidResponse(format!("bad content type: {content_type}")))?,
        );
        // 文件名可能含非 ASCII 字符，base64 后再进头
        let encoded_name = BASE64_STANDARD.encode(name);
        if let Ok(value) = HeaderValue::from_str(&encoded_name) {
            headers.insert("X-Upload-Name", value);
        }
        if let Some(token) = &self.token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| StorageError::InvalidResponse("bad token".to_string()))?;
            headers.insert("Authorization", value);
        }

        Ok(headers)
    }

    /// 解析响应中的持久 URL：Location 头 > JSON 体 > 请求地址
    async fn resolve_url(&self, key: &str, response: reqwest::Response) -> Result<String, StorageError> {
        if let Some(location) = response.headers().get("Location") {
            let location = location
                .to_str()
                .map_err(|err| StorageError::InvalidResponse(err.to_string()))?
                .to_string();
            return self.absolutize(location);
        }

        if let Ok(body) = response.json::<serde_json::Value>().await {
            if let Some(uploaded) = body.get("url").and_then(|v| v.as_str()) {
                return Ok(uploaded.to_string());
            }
        }

        Ok(self.object_url(key))
    }

    /// 相对 Location 转绝对地址
    fn absolutize(&self, location: String) -> Result<String, StorageError> {
        if location.starts_with("http") {
            return Ok(location);
        }

        let base = Url::parse(&self.endpoint)
            .map_err(|_| StorageError::InvalidResponse(format!("invalid endpoint: {}", self.endpoint)))?;
        let origin = base.origin().ascii_serialization();
        Ok(format!("{origin}{location}"))
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        progress: Option<ProgressFn>,
    ) -> Result<String, StorageError> {
        let headers = self.create_headers(content_type, key.rsplit('/').next().unwrap_or(key))?;
        let total = data.len();

        // 零拷贝切块，上传过程中逐块回调进度
        let mut chunks = Vec::with_capacity(total / BODY_CHUNK_SIZE + 1);
        let mut offset = 0;
        while offset < total {
            let end = (offset + BODY_CHUNK_SIZE).min(total);
            chunks.push(std::io::Result::Ok(data.slice(offset..end)));
            offset = end;
        }
        let body_stream = ProgressStream::new(stream::iter(chunks), progress);

        tracing::debug!(key, total, "putting object");

        let response = self
            .client
            .put(self.object_url(key))
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body_stream))
            .send()
            .await
            .map_err(StorageError::from_reqwest)?;

        let status = response.status();
        if !matches!(
            status,
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT
        ) {
            let message = response.text().await.unwrap_or_default();
            return Err(StorageError::from_status(status.as_u16(), message));
        }

        self.resolve_url(key, response).await
    }
}
