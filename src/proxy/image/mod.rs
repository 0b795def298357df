//! 图片摄取
//!
//! 把 `image_url` 引用（data URI 或远程 http/https URL）解析为 `(mimeType, base64)`。
//! 远程抓取有主机检查、超时和字节上限；任何一步失败都不会返回部分结果。

pub mod data_uri;
pub mod host_guard;

use crate::config::ImageConfig;
use crate::proxy::http_client;
use crate::proxy::log_codes::img as log_img;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::StreamExt;
use reqwest::{header, Client};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// 图片无法使用，整个请求以 400 失败
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageNotSupportedError {
    #[error("Image URL is empty")]
    Empty,

    #[error("Invalid data URI: {0}")]
    InvalidDataUri(String),

    #[error("Unsupported image MIME type: {0}")]
    UnsupportedMime(String),

    #[error("Invalid image URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported image URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Image host is not allowed: {0}")]
    BlockedHost(String),

    #[error("Image fetch timed out after {0}s")]
    Timeout(u64),

    #[error("Image fetch failed: {0}")]
    Fetch(String),

    #[error("Image fetch returned status {0}")]
    HttpStatus(u16),

    #[error("Image exceeds the maximum size of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("Image response body is empty")]
    EmptyBody,

    #[error("Could not determine image MIME type")]
    UnknownMime,
}

/// 内联图片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    /// 以 `image/` 开头
    pub mime_type: String,
    /// 标准 base64，无换行
    pub data: String,
}

#[derive(Clone)]
pub struct ImageIngestor {
    client: Client,
    max_bytes: usize,
    timeout: Duration,
    allow_private_hosts: bool,
}

impl ImageIngestor {
    pub fn new(client: Client, max_bytes: usize, timeout: Duration) -> Self {
        Self {
            client,
            max_bytes,
            timeout,
            allow_private_hosts: false,
        }
    }

    pub fn from_config(config: &ImageConfig) -> Result<Self, reqwest::Error> {
        let timeout = Duration::from_secs(config.fetch_timeout_secs);
        let client = http_client::build_image_client(timeout)?;
        Ok(Self::new(client, config.max_bytes, timeout))
    }

    /// 测试中 mock 服务器监听在回环地址上
    #[cfg(test)]
    fn with_private_hosts_allowed(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }

    pub async fn ingest(&self, url: &str) -> Result<ImagePayload, ImageNotSupportedError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ImageNotSupportedError::Empty);
        }

        let result = if url
            .get(..5)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:"))
        {
            data_uri::parse(url, self.max_bytes)
        } else {
            self.fetch_remote(url).await
        };

        match &result {
            Ok(payload) => log::debug!(
                "[Image] 图片已内联: {} ({} base64 chars)",
                payload.mime_type,
                payload.data.len()
            ),
            Err(e) => log::warn!(
                "[Image] [{}] 图片被拒绝: {e} ({})",
                log_img::REJECTED,
                http_client::mask_url(url)
            ),
        }
        result
    }

    async fn fetch_remote(&self, raw: &str) -> Result<ImagePayload, ImageNotSupportedError> {
        let url = Url::parse(raw).map_err(|e| ImageNotSupportedError::InvalidUrl(e.to_string()))?;

        match url.scheme() {
            "http" | "https" => {}
            other => return Err(ImageNotSupportedError::UnsupportedScheme(other.to_string())),
        }

        if !self.allow_private_hosts {
            host_guard::check_url(&url)
                .map_err(|r| ImageNotSupportedError::BlockedHost(r.to_string()))?;
        }

        match tokio::time::timeout(self.timeout, self.download(url)).await {
            Ok(result) => result,
            Err(_) => Err(ImageNotSupportedError::Timeout(self.timeout.as_secs())),
        }
    }

    async fn download(&self, url: Url) -> Result<ImagePayload, ImageNotSupportedError> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_redirect() {
                ImageNotSupportedError::BlockedHost(format!("redirect rejected: {e}"))
            } else if e.is_timeout() {
                ImageNotSupportedError::Timeout(self.timeout.as_secs())
            } else {
                ImageNotSupportedError::Fetch(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageNotSupportedError::HttpStatus(status.as_u16()));
        }

        let mime_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|m| m.starts_with("image/"))
            .or_else(|| mime_from_path(&url))
            .ok_or(ImageNotSupportedError::UnknownMime)?;

        if let Some(len) = response.content_length() {
            if len > self.max_bytes as u64 {
                return Err(ImageNotSupportedError::TooLarge {
                    max_bytes: self.max_bytes,
                });
            }
        }

        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ImageNotSupportedError::Fetch(e.to_string()))?;
            if body.len() + chunk.len() > self.max_bytes {
                return Err(ImageNotSupportedError::TooLarge {
                    max_bytes: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        if body.is_empty() {
            return Err(ImageNotSupportedError::EmptyBody);
        }

        Ok(ImagePayload {
            mime_type,
            data: STANDARD.encode(&body),
        })
    }
}

fn mime_from_path(url: &Url) -> Option<String> {
    mime_guess::from_path(url.path())
        .first()
        .filter(|m| m.type_() == mime_guess::mime::IMAGE)
        .map(|m| m.essence_str().to_string())
}
