//! 上游字段别名表
//!
//! 上游不同 provider 对同一逻辑字段的命名并不统一（`contentIndex` / `content_index`，
//! `toolCallId` / `id` ...）。每个逻辑字段在这里维护一张有序别名表，
//! 所有读取都经过 [`first`] 系列函数，按顺序取第一个存在的非空值。

use serde_json::Value;

/// 内容块序号
pub const CONTENT_INDEX: &[&str] = &["contentIndex", "content_index", "index"];

/// text_delta 事件中的增量文本
pub const TEXT_DELTA: &[&str] = &["delta", "text", "content"];

/// text_end 事件中的完整文本
pub const FULL_TEXT: &[&str] = &["content", "text"];

/// toolcall_delta 事件中的参数增量
pub const ARGUMENTS_DELTA: &[&str] = &["delta", "argumentsDelta", "arguments_delta", "partial_json"];

pub const TOOL_CALL_ID: &[&str] = &["id", "toolCallId", "tool_call_id", "callId", "call_id"];

pub const TOOL_CALL_NAME: &[&str] = &["name", "toolName", "tool_name"];

/// 工具调用参数（对象或 JSON 字符串）
pub const TOOL_ARGUMENTS: &[&str] = &["arguments", "args", "input", "parameters"];

/// 事件中直接内嵌的工具调用对象
pub const TOOL_CALL_OBJECT: &[&str] = &["toolCall", "tool_call"];

/// 消息上的结构化工具调用数组
pub const TOOL_CALL_ARRAYS: &[&str] = &["tool_calls", "toolCalls"];

/// 内容数组中表示工具调用的 type 取值
pub const TOOL_CALL_ITEM_TYPES: &[&str] = &["toolCall", "tool_call", "tool_use", "function_call"];

/// 内容数组中表示文本的 type 取值
pub const TEXT_ITEM_TYPES: &[&str] = &["text", "output_text"];

/// 事件携带的（部分）assistant 消息
pub const PARTIAL_MESSAGE: &[&str] = &["partial", "message"];

/// done 事件的完整消息
pub const TERMINAL_MESSAGE: &[&str] = &["message", "partial"];

pub const STOP_REASON: &[&str] = &["reason", "stopReason", "stop_reason", "finishReason", "finish_reason"];

pub const ERROR_MESSAGE: &[&str] = &["errorMessage", "error_message", "message"];

pub const USAGE: &[&str] = &["usage"];
pub const USAGE_INPUT: &[&str] = &["input", "inputTokens", "input_tokens", "prompt_tokens"];
pub const USAGE_OUTPUT: &[&str] = &["output", "outputTokens", "output_tokens", "completion_tokens"];
pub const USAGE_CACHE_READ: &[&str] = &[
    "cacheRead",
    "cache_read",
    "cacheReadTokens",
    "cache_read_tokens",
    "cache_read_input_tokens",
];
pub const USAGE_CACHE_WRITE: &[&str] = &[
    "cacheWrite",
    "cache_write",
    "cacheWriteTokens",
    "cache_creation_input_tokens",
];
pub const USAGE_REASONING: &[&str] = &["reasoning", "reasoningTokens", "reasoning_tokens"];
pub const USAGE_TOTAL: &[&str] = &["totalTokens", "total_tokens", "total"];

/// 按别名顺序返回第一个存在且非 null 的字段
pub fn first<'a>(value: &'a Value, aliases: &[&str]) -> Option<&'a Value> {
    let obj = value.as_object()?;
    aliases
        .iter()
        .filter_map(|key| obj.get(*key))
        .find(|v| !v.is_null())
}

/// 按别名顺序返回第一个字符串字段
pub fn first_str<'a>(value: &'a Value, aliases: &[&str]) -> Option<&'a str> {
    let obj = value.as_object()?;
    aliases
        .iter()
        .filter_map(|key| obj.get(*key))
        .find_map(|v| v.as_str())
}

/// 同 [`first_str`]，但跳过空字符串
pub fn first_non_empty_str<'a>(value: &'a Value, aliases: &[&str]) -> Option<&'a str> {
    let obj = value.as_object()?;
    aliases
        .iter()
        .filter_map(|key| obj.get(*key))
        .filter_map(|v| v.as_str())
        .find(|s| !s.is_empty())
}

/// 按别名顺序返回第一个数值字段（浮点会被截断，负数视为不存在）
pub fn first_u64(value: &Value, aliases: &[&str]) -> Option<u64> {
    let obj = value.as_object()?;
    aliases
        .iter()
        .filter_map(|key| obj.get(*key))
        .find_map(|v| {
            v.as_u64()
                .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
        })
}

/// 按别名顺序返回第一个对象字段
pub fn first_object<'a>(value: &'a Value, aliases: &[&str]) -> Option<&'a Value> {
    let obj = value.as_object()?;
    aliases
        .iter()
        .filter_map(|key| obj.get(*key))
        .find(|v| v.is_object())
}
