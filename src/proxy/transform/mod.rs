//! 协议转换
//!
//! - [`request`]: OpenAI 请求 → 上游上下文
//! - [`streaming`]: 上游事件 → OpenAI SSE chunk
//! - [`response`]: 上游终止消息 → OpenAI 非流式响应
//! - [`tool_calls`]: 工具调用规范化

pub mod request;
pub mod response;
pub mod streaming;
pub mod tool_calls;

pub use request::translate_request;
pub use response::{assemble_response, await_terminal_message};
pub use streaming::{into_sse_stream, StreamAdapter};
pub use tool_calls::{extract_tool_calls, ToolCall};

use crate::proxy::models::openai::FinishReason;

/// 上游 stop reason → OpenAI finish_reason
pub fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("tool_calls" | "tool_call" | "toolUse" | "tool_use") => FinishReason::ToolCalls,
        Some("max_tokens" | "length") => FinishReason::Length,
        Some("content_filter" | "error" | "aborted") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

/// `chatcmpl-` + 32 位十六进制
pub fn new_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
