//! 工具调用规范化
//!
//! 上游消息中的工具调用可能出现在结构化数组（`tool_calls` / `toolCalls`）里，
//! 也可能内联在 content 数组中（`toolCall` / `tool_use` / `function_call` ...）。
//! 这里统一提取为 `(id, name, argumentsText)`。

use crate::proxy::models::openai::{ResponseFunction, ResponseToolCall};
use crate::proxy::upstream::fields;
use serde_json::Value;

/// 规范化后的工具调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON 文本
    pub arguments: String,
}

impl From<ToolCall> for ResponseToolCall {
    fn from(call: ToolCall) -> Self {
        ResponseToolCall {
            id: call.id,
            call_type: "function".to_string(),
            function: ResponseFunction {
                name: call.name,
                arguments: call.arguments,
            },
        }
    }
}

/// 从上游 assistant 消息中提取工具调用
pub fn extract_tool_calls(message: &Value) -> Vec<ToolCall> {
    let structured = fields::first(message, fields::TOOL_CALL_ARRAYS)
        .and_then(|v| v.as_array())
        .filter(|calls| !calls.is_empty());

    let items: Vec<&Value> = match structured {
        Some(calls) => calls.iter().collect(),
        None => message
            .get("content")
            .and_then(|c| c.as_array())
            .map(|content| {
                content
                    .iter()
                    .filter(|item| {
                        item.get("type")
                            .and_then(|t| t.as_str())
                            .is_some_and(|t| fields::TOOL_CALL_ITEM_TYPES.contains(&t))
                    })
                    .collect()
            })
            .unwrap_or_default(),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| normalize(item, index))
        .collect()
}

fn normalize(item: &Value, index: usize) -> ToolCall {
    let function = item.get("function").filter(|f| f.is_object());

    let id = fields::first_non_empty_str(item, fields::TOOL_CALL_ID)
        .or_else(|| function.and_then(|f| fields::first_non_empty_str(f, fields::TOOL_CALL_ID)))
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{index}"));

    let name = fields::first_non_empty_str(item, fields::TOOL_CALL_NAME)
        .or_else(|| function.and_then(|f| fields::first_non_empty_str(f, fields::TOOL_CALL_NAME)))
        .unwrap_or("tool")
        .to_string();

    let arguments = fields::first(item, fields::TOOL_ARGUMENTS)
        .or_else(|| function.and_then(|f| fields::first(f, fields::TOOL_ARGUMENTS)));

    ToolCall {
        id,
        name,
        arguments: arguments_to_text(arguments),
    }
}

/// 参数转为 JSON 文本：字符串原样透传，其余值序列化，缺失时为 `"{}"`
pub fn arguments_to_text(arguments: Option<&Value>) -> String {
    match arguments {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "{}".to_string(),
        Some(other) => serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inline_content_items() {
        let message = json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "checking"},
                {"type": "toolCall", "id": "call_abc", "name": "get_weather", "arguments": {"city": "Paris"}},
                {"type": "tool_use", "name": "lookup", "input": "{\"q\":1}"}
            ]
        });

        let calls = extract_tool_calls(&message);
        assert_eq!(
            calls,
            vec![
                ToolCall {
                    id: "call_abc".into(),
                    name: "get_weather".into(),
                    arguments: r#"{"city":"Paris"}"#.into(),
                },
                ToolCall {
                    id: "call_1".into(),
                    name: "lookup".into(),
                    arguments: r#"{"q":1}"#.into(),
                },
            ]
        );
    }

    #[test]
    fn test_structured_array_wins_over_content() {
        let message = json!({
            "tool_calls": [
                {"id": "call_1", "type": "function", "function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}}
            ],
            "content": [
                {"type": "toolCall", "id": "ignored", "name": "ignored", "arguments": {}}
            ]
        });

        let calls = extract_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments, r#"{"q":"rust"}"#);
    }

    #[test]
    fn test_empty_structured_array_falls_back_to_content() {
        let message = json!({
            "toolCalls": [],
            "content": [{"type": "function_call", "call_id": "call_z", "name": "f"}]
        });

        let calls = extract_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_z");
        assert_eq!(calls[0].arguments, "{}");
    }

    #[test]
    fn test_defaults_for_missing_id_and_name() {
        let message = json!({"toolCalls": [{"arguments": null}, {}]});

        let calls = extract_tool_calls(&message);
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[0].name, "tool");
        assert_eq!(calls[0].arguments, "{}");
        assert_eq!(calls[1].id, "call_1");
    }

    #[test]
    fn test_no_tool_calls() {
        assert!(extract_tool_calls(&json!({"content": [{"type": "text", "text": "hi"}]})).is_empty());
        assert!(extract_tool_calls(&json!({"content": "plain"})).is_empty());
    }

    #[test]
    fn test_response_tool_call_conversion() {
        let call: ResponseToolCall = ToolCall {
            id: "call_1".into(),
            name: "f".into(),
            arguments: "{}".into(),
        }
        .into();
        assert_eq!(call.call_type, "function");
        assert_eq!(call.function.name, "f");
    }
}
