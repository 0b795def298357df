//! 上游 Agent 接口
//!
//! 定义上游上下文（消息 / systemPrompt / 工具）、上游事件以及 [`UpstreamAgent`] trait。
//! 事件以拉取式 `Stream` 暴露，每个事件一个挂起点；取消通过 [`CallOptions::cancel`] 传递。

pub mod auth;
pub mod fields;
pub mod http;

pub use auth::{mask_token, AuthError, StaticTokenProvider, TokenProvider};
pub use http::HttpAgent;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// 上游上下文
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamContext {
    /// 上游要求字段必须存在，没有 system 消息时为空字符串
    pub system_prompt: String,
    pub messages: Vec<UpstreamMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<UpstreamTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

/// 上游消息
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum UpstreamMessage {
    User {
        content: UserContent,
        timestamp: i64,
    },
    Assistant {
        content: Vec<ContentItem>,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: Vec<ContentItem>,
        is_error: bool,
        timestamp: i64,
    },
}

/// 用户消息内容：纯文本直接透传，多模态展开为内容项
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Items(Vec<ContentItem>),
}

/// 上游内容项
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentItem {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        data: String,
        mime_type: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
}

/// 上游工具定义
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamTool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 调用选项
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Bearer token
    pub api_key: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// 客户端断开或服务关闭时触发
    pub cancel: CancellationToken,
}

/// 上游事件类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Start,
    TextStart,
    TextDelta,
    TextEnd,
    ToolCallStart,
    ToolCallDelta,
    ToolCallEnd,
    Error,
    Done,
    /// thinking_* 以及未来新增的事件，转换层忽略
    Other(String),
}

impl EventKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "start" => EventKind::Start,
            "text_start" => EventKind::TextStart,
            "text_delta" => EventKind::TextDelta,
            "text_end" => EventKind::TextEnd,
            "toolcall_start" | "tool_call_start" => EventKind::ToolCallStart,
            "toolcall_delta" | "tool_call_delta" => EventKind::ToolCallDelta,
            "toolcall_end" | "tool_call_end" => EventKind::ToolCallEnd,
            "error" => EventKind::Error,
            "done" => EventKind::Done,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// 上游事件
///
/// 保留原始 payload，逻辑字段通过 [`fields`] 的别名表读取。
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamEvent {
    pub kind: EventKind,
    pub payload: Value,
}

impl UpstreamEvent {
    /// 从 `{"type": "...", ...}` 形式的 JSON 构造
    pub fn from_value(payload: Value) -> Result<Self, UpstreamError> {
        let kind = payload
            .get("type")
            .and_then(|t| t.as_str())
            .map(EventKind::parse)
            .ok_or_else(|| UpstreamError::InvalidEvent("missing event type".to_string()))?;
        Ok(Self { kind, payload })
    }

    pub fn content_index(&self) -> u64 {
        fields::first_u64(&self.payload, fields::CONTENT_INDEX).unwrap_or(0)
    }

    pub fn text_delta(&self) -> Option<&str> {
        fields::first_str(&self.payload, fields::TEXT_DELTA)
    }

    /// text_end 携带的完整文本，缺失时回退到 partial 消息中对应内容块
    pub fn full_text(&self) -> Option<&str> {
        fields::first_str(&self.payload, fields::FULL_TEXT)
            .or_else(|| self.partial_item().and_then(|item| fields::first_str(item, &["text"])))
    }

    pub fn arguments_delta(&self) -> Option<&str> {
        fields::first_str(&self.payload, fields::ARGUMENTS_DELTA)
    }

    /// 工具调用 id：partial 负载 → 内嵌 toolCall 对象 → 事件显式字段
    pub fn tool_call_id(&self) -> Option<&str> {
        self.tool_call_sources()
            .find_map(|source| fields::first_non_empty_str(source, fields::TOOL_CALL_ID))
    }

    /// 工具名称：查找顺序同 [`tool_call_id`](Self::tool_call_id)
    pub fn tool_call_name(&self) -> Option<&str> {
        self.tool_call_sources().find_map(|source| {
            fields::first_non_empty_str(source, fields::TOOL_CALL_NAME).or_else(|| {
                source
                    .get("function")
                    .and_then(|f| fields::first_non_empty_str(f, &["name"]))
            })
        })
    }

    pub fn stop_reason(&self) -> Option<&str> {
        fields::first_str(&self.payload, fields::STOP_REASON).or_else(|| {
            self.terminal_message()
                .and_then(|m| fields::first_str(m, fields::STOP_REASON))
        })
    }

    /// done 事件携带的完整 assistant 消息
    pub fn terminal_message(&self) -> Option<&Value> {
        fields::first_object(&self.payload, fields::TERMINAL_MESSAGE)
    }

    /// error 事件中最具体的错误信息
    pub fn error_message(&self) -> String {
        let from_error = match self.payload.get("error") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            Some(err @ Value::Object(_)) => fields::first_non_empty_str(err, fields::ERROR_MESSAGE),
            _ => None,
        };
        from_error
            .or_else(|| fields::first_non_empty_str(&self.payload, fields::ERROR_MESSAGE))
            .unwrap_or("Upstream model error")
            .to_string()
    }

    /// partial 消息中当前 contentIndex 对应的内容块
    fn partial_item(&self) -> Option<&Value> {
        let partial = fields::first_object(&self.payload, fields::PARTIAL_MESSAGE)?;
        let index = usize::try_from(self.content_index()).ok()?;
        partial.get("content")?.as_array()?.get(index)
    }

    fn tool_call_sources(&self) -> impl Iterator<Item = &Value> {
        self.partial_item()
            .into_iter()
            .chain(fields::first_object(&self.payload, fields::TOOL_CALL_OBJECT))
            .chain(std::iter::once(&self.payload))
    }
}

/// 上游错误
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(String),

    #[error("upstream returned status {status}")]
    Status { status: u16, body: String },

    #[error("invalid upstream event: {0}")]
    InvalidEvent(String),

    #[error("upstream stream error: {0}")]
    Stream(String),

    #[error("upstream model error: {0}")]
    Model(String),

    #[error("upstream finished without a terminal message")]
    MissingTerminalMessage,

    #[error("upstream call cancelled")]
    Cancelled,

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// 上游事件流
pub type UpstreamEventStream = BoxStream<'static, Result<UpstreamEvent, UpstreamError>>;

/// 上游 Agent
///
/// `stream` 在返回事件流之前完成所有可能失败的握手（鉴权、HTTP 状态），
/// 这样调用方仍能以普通 HTTP 错误响应；返回之后的失败只能通过流内错误体现。
#[async_trait]
pub trait UpstreamAgent: Send + Sync {
    /// 适配器名称（用于日志和调试）
    fn name(&self) -> &'static str;

    async fn stream(
        &self,
        model: &str,
        context: UpstreamContext,
        options: CallOptions,
    ) -> Result<UpstreamEventStream, UpstreamError>;
}
