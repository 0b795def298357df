//! 上游凭证
//!
//! 凭证来源被抽象为 [`TokenProvider`]；默认实现从配置或环境变量读取静态 token。

use crate::config::BridgeConfig;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("No upstream credentials configured")]
    NotAuthenticated,
}

/// Bearer token 来源
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, AuthError>;
}

/// 静态 token（配置 `api_key` 或 `api_key_env` 指向的环境变量）
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    /// 配置中的 `api_key` 优先，其次读取 `api_key_env` 指定的环境变量
    pub fn from_config(config: &BridgeConfig) -> Self {
        let token = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                config
                    .api_key_env
                    .as_deref()
                    .filter(|name| !name.is_empty())
                    .and_then(|name| std::env::var(name).ok())
            });

        let provider = Self::new(token);
        match &provider.token {
            Some(token) => log::info!("[Auth] 使用上游凭证: {}", mask_token(token)),
            None => log::warn!("[Auth] 未配置上游凭证，请求将返回 401"),
        }
        provider
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String, AuthError> {
        self.token.clone().ok_or(AuthError::NotAuthenticated)
    }
}

/// 返回遮蔽后的 token（用于日志输出）
pub fn mask_token(token: &str) -> String {
    if token.chars().count() > 8 {
        let prefix: String = token.chars().take(4).collect();
        let suffix: String = token
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("{prefix}...{suffix}")
    } else {
        "***".to_string()
    }
}
