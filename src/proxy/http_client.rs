//! HTTP 客户端构建
//!
//! 上游调用和图片抓取使用两个独立的客户端：
//! 上游客户端只限制连接和读取间隔（流式响应可能持续很久），
//! 图片客户端有整体超时，并在每次重定向时重新做主机检查。

use crate::proxy::image::host_guard;
use reqwest::{redirect, Client};
use std::time::Duration;

/// 图片抓取允许的最大重定向次数
const MAX_IMAGE_REDIRECTS: usize = 5;

/// 构建上游客户端
pub fn build_upstream_client(request_timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .read_timeout(request_timeout)
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Duration::from_secs(60))
        .build()
}

/// 构建图片抓取客户端
pub fn build_image_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    let policy = redirect::Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_IMAGE_REDIRECTS {
            return attempt.error(format!("more than {MAX_IMAGE_REDIRECTS} redirects"));
        }
        let scheme = attempt.url().scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return attempt.error(format!("redirect to unsupported scheme {scheme}"));
        }
        match host_guard::check_url(attempt.url()) {
            Ok(()) => attempt.follow(),
            Err(rejection) => {
                log::warn!(
                    "[Image] 拒绝重定向到 {}: {rejection}",
                    mask_url(attempt.url().as_str())
                );
                attempt.error(format!("redirect to blocked host ({rejection})"))
            }
        }
    });

    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .redirect(policy)
        .no_proxy()
        .build()
}

/// 隐藏 URL 中的敏感信息（用于日志）
pub fn mask_url(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        // 隐藏用户名、密码、路径和查询参数，保留 scheme、host 和端口
        let host = parsed.host_str().unwrap_or("?");
        match parsed.port() {
            Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
            None => format!("{}://{}", parsed.scheme(), host),
        }
    } else if url.chars().count() > 20 {
        format!("{}...", url.chars().take(20).collect::<String>())
    } else {
        url.to_string()
    }
}
