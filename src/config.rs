//! 配置
//!
//! 配置文件为 TOML，默认位于 `~/.agent-bridge/config.toml`。文件不存在时使用默认值，
//! 命令行参数在加载后覆盖对应字段。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 应用目录名（位于用户主目录下）
pub const APP_DIR_NAME: &str = ".agent-bridge";

const DEFAULT_API_KEY_ENV: &str = "AGENT_BRIDGE_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败 {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("解析配置文件失败 {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 桥接服务配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// 监听地址
    pub listen_address: String,
    /// 监听端口
    pub listen_port: u16,
    /// 上游 Agent 事件流端点
    pub upstream_url: String,
    /// 上游 Bearer token，优先于 `api_key_env`
    pub api_key: Option<String>,
    /// 保存上游 token 的环境变量名
    pub api_key_env: Option<String>,
    /// 上游读取超时（秒），两次数据之间的最大间隔
    pub request_timeout_secs: u64,
    /// 请求体上限（字节）
    pub max_body_bytes: usize,
    /// 允许的模型列表，为空时不校验
    pub models: Vec<String>,
    pub image: ImageConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 15722,
            upstream_url: String::new(),
            api_key: None,
            api_key_env: Some(DEFAULT_API_KEY_ENV.to_string()),
            request_timeout_secs: 300,
            max_body_bytes: 32 * 1024 * 1024,
            models: Vec::new(),
            image: ImageConfig::default(),
        }
    }
}

/// 图片抓取配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// 单张图片解码后的最大字节数
    pub max_bytes: usize,
    /// 远程抓取超时（秒）
    pub fetch_timeout_secs: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            fetch_timeout_secs: 15,
        }
    }
}

/// 应用目录（不会 panic）
pub fn app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

impl BridgeConfig {
    pub fn default_path() -> PathBuf {
        app_dir().join("config.toml")
    }

    /// 加载配置
    ///
    /// 显式指定的文件必须存在；默认位置的文件不存在时返回默认配置。
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    log::info!("[Config] 未找到配置文件 {}，使用默认配置", path.display());
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("[Config] 已加载配置文件 {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_url.trim().is_empty() {
            return Err(ConfigError::Invalid("upstream_url 不能为空".to_string()));
        }
        let url = url::Url::parse(&self.upstream_url)
            .map_err(|e| ConfigError::Invalid(format!("upstream_url 无效: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "upstream_url 只支持 http/https: {}",
                url.scheme()
            )));
        }
        if self.listen_address.trim().is_empty() {
            return Err(ConfigError::Invalid("listen_address 不能为空".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs 必须大于 0".to_string()));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid("max_body_bytes 必须大于 0".to_string()));
        }
        if self.image.max_bytes == 0 {
            return Err(ConfigError::Invalid("image.max_bytes 必须大于 0".to_string()));
        }
        if self.image.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "image.fetch_timeout_secs 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 模型是否在允许列表中（列表为空时全部允许）
    pub fn allows_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}
