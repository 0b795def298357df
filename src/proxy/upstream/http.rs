//! HTTP 上游 Agent
//!
//! 以 JSON POST `{model, context, options}` 调用上游，解析返回的 SSE `data:` 帧为 [`UpstreamEvent`]。

use super::{CallOptions, UpstreamAgent, UpstreamContext, UpstreamError, UpstreamEvent, UpstreamEventStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::{header, Client};
use serde::Serialize;
use std::fmt::Display;
use tokio_util::sync::CancellationToken;

/// 上游请求体
#[derive(Debug, Serialize)]
struct AgentRequest<'a> {
    model: &'a str,
    context: &'a UpstreamContext,
    options: AgentOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

pub struct HttpAgent {
    client: Client,
    url: String,
}

impl HttpAgent {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl UpstreamAgent for HttpAgent {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn stream(
        &self,
        model: &str,
        context: UpstreamContext,
        options: CallOptions,
    ) -> Result<UpstreamEventStream, UpstreamError> {
        let body = AgentRequest {
            model,
            context: &context,
            options: AgentOptions {
                temperature: options.temperature,
                max_tokens: options.max_tokens,
            },
        };

        log::debug!(
            "[Upstream] >>> POST {} (model={model}, messages={})",
            self.url,
            context.messages.len()
        );

        let request = self
            .client
            .post(&self.url)
            .bearer_auth(&options.api_key)
            .header(header::ACCEPT, "text/event-stream")
            .json(&body);

        let response = tokio::select! {
            _ = options.cancel.cancelled() => return Err(UpstreamError::Cancelled),
            result = request.send() => result.map_err(|e| UpstreamError::Request(e.to_string()))?,
        };

        let status = response.status();
        log::info!("[Upstream] 上游响应状态: {status}");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(parse_event_stream(response.bytes_stream(), options.cancel).boxed())
    }
}

/// 单个 SSE 帧的最大字节数
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// 将字节流解析为上游事件流
///
/// 帧以空行分隔；`\r` 被丢弃以兼容 CRLF。`[DONE]`、空帧以及无法解析的帧被跳过。
/// 取消令牌触发后流立即结束。
pub fn parse_event_stream<S, E>(
    stream: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<UpstreamEvent, UpstreamError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    parse_event_stream_with_limit(stream, cancel, MAX_FRAME_BYTES)
}

/// 同 [`parse_event_stream`]，未结束的帧超过 `max_frame_bytes` 时以流错误结束
pub fn parse_event_stream_with_limit<S, E>(
    stream: S,
    cancel: CancellationToken,
    max_frame_bytes: usize,
) -> impl Stream<Item = Result<UpstreamEvent, UpstreamError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        // buffer 中已确认不含帧分隔符的前缀长度
        let mut scanned = 0usize;

        tokio::pin!(stream);

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("[Upstream] 调用已取消，停止读取事件流");
                    return;
                }
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = chunk else { break };

            match chunk {
                Ok(bytes) => {
                    buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

                    loop {
                        // 分隔符可能跨越上次扫描的边界，回退一个字节
                        let start = scanned.saturating_sub(1);
                        let Some(pos) = buffer[start..].windows(2).position(|w| w == b"\n\n") else {
                            scanned = buffer.len();
                            break;
                        };
                        let frame: Vec<u8> = buffer.drain(..start + pos + 2).collect();
                        scanned = 0;
                        if let Some(event) = parse_frame(&frame) {
                            yield Ok(event);
                        }
                    }

                    if buffer.len() > max_frame_bytes {
                        log::error!("[Upstream] 事件帧超过 {max_frame_bytes} 字节，终止读取");
                        yield Err(UpstreamError::Stream(format!(
                            "event frame exceeds {max_frame_bytes} bytes"
                        )));
                        return;
                    }
                }
                Err(e) => {
                    log::error!("[Upstream] 流错误: {e}");
                    yield Err(UpstreamError::Stream(e.to_string()));
                    return;
                }
            }
        }

        // 最后一帧可能没有结尾空行
        if let Some(event) = parse_frame(&buffer) {
            yield Ok(event);
        }
    }
}

fn parse_frame(frame: &[u8]) -> Option<UpstreamEvent> {
    let text = String::from_utf8_lossy(frame);
    let data = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|d| d.strip_prefix(' ').unwrap_or(d))
        .collect::<Vec<_>>()
        .join("\n");

    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    let parsed = serde_json::from_str(data)
        .map_err(|e| UpstreamError::InvalidEvent(e.to_string()))
        .and_then(UpstreamEvent::from_value);

    match parsed {
        Ok(event) => Some(event),
        Err(e) => {
            log::warn!("[Upstream] 跳过无法解析的事件: {e}");
            None
        }
    }
}
