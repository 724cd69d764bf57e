//! 演示二进制的配置加载

use std::path::Path;
use anyhow::Context;
use serde::Deserialize;
use crate::queue::QueueConfig;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// 对象存储服务地址
    pub endpoint: String,
    /// Bearer token
    pub token: Option<String>,
    /// 操作用户标识
    pub user: String,
    /// 所属实体标识，可选
    pub association: Option<String>,
    /// 待上传的文件路径
    pub files: Vec<String>,
    /// 队列配置，缺省用默认值
    #[serde(default)]
    pub queue: Option<QueueConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&config_str)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }
}
