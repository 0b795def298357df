//! 非流式响应组装
//!
//! 消费上游事件流直到终止消息，再转换为 OpenAI `chat.completion` 响应。

use super::{extract_tool_calls, map_stop_reason, now_secs};
use crate::proxy::models::openai::{
    ChatCompletionResponse, Choice, FinishReason, ResponseMessage, ResponseToolCall,
};
use crate::proxy::upstream::{fields, EventKind, UpstreamError, UpstreamEventStream};
use crate::proxy::usage::TokenUsage;
use futures::StreamExt;
use serde_json::Value;

/// 终止消息 → OpenAI 响应
pub fn assemble_response(message: &Value, model: &str, completion_id: &str) -> ChatCompletionResponse {
    let text = extract_text(message);
    let tool_calls: Vec<ResponseToolCall> = extract_tool_calls(message)
        .into_iter()
        .map(ResponseToolCall::from)
        .collect();

    let finish_reason = if tool_calls.is_empty() {
        map_stop_reason(fields::first_str(message, fields::STOP_REASON))
    } else {
        FinishReason::ToolCalls
    };

    let usage = TokenUsage::from_upstream_message(message)
        .unwrap_or_default()
        .to_openai();

    let content = if text.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(text)
    };

    ChatCompletionResponse {
        id: completion_id.to_string(),
        object: ChatCompletionResponse::OBJECT.to_string(),
        created: now_secs(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason,
            logprobs: None,
        }],
        usage,
    }
}

/// 按顺序拼接 `text` / `output_text` 内容项
pub fn extract_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter(|item| {
                item.get("type")
                    .and_then(|t| t.as_str())
                    .is_some_and(|t| fields::TEXT_ITEM_TYPES.contains(&t))
            })
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect(),
        _ => String::new(),
    }
}

/// 消费事件流直到 done，返回终止消息
///
/// done 事件上的 stop reason / usage 在消息缺失对应字段时合并进消息。
/// error 事件、流错误或没有终止消息都会使请求失败。
pub async fn await_terminal_message(mut events: UpstreamEventStream) -> Result<Value, UpstreamError> {
    while let Some(event) = events.next().await {
        let event = event?;
        match event.kind {
            EventKind::Error => return Err(UpstreamError::Model(event.error_message())),
            EventKind::Done => {
                let mut message = event
                    .terminal_message()
                    .cloned()
                    .ok_or(UpstreamError::MissingTerminalMessage)?;

                let has_reason = fields::first_str(&message, fields::STOP_REASON).is_some();
                let has_usage = fields::first_object(&message, fields::USAGE).is_some();
                if let Some(obj) = message.as_object_mut() {
                    if !has_reason {
                        if let Some(reason) = fields::first_str(&event.payload, fields::STOP_REASON) {
                            obj.insert("stopReason".to_string(), Value::String(reason.to_string()));
                        }
                    }
                    if !has_usage {
                        if let Some(usage) = fields::first_object(&event.payload, fields::USAGE) {
                            obj.insert("usage".to_string(), usage.clone());
                        }
                    }
                }
                return Ok(message);
            }
            _ => {}
        }
    }
    Err(UpstreamError::MissingTerminalMessage)
}
