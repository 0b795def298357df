//! 请求转换：OpenAI Chat Completions → 上游上下文
//!
//! - system / developer 消息按顺序以空行拼接为 `systemPrompt`
//! - user 多模态内容展开为文本项和图片项（图片经 [`ImageIngestor`] 内联）
//! - assistant 的 `tool_calls` 转为 toolCall 内容项，参数尽量解析为 JSON
//! - tool 消息转为 toolResult
//!
//! 任何一张图片失败都会使整个请求失败，此时尚未调用上游。

use crate::proxy::image::{ImageIngestor, ImageNotSupportedError};
use crate::proxy::models::openai::{
    ChatCompletionRequest, ChatMessage, ContentPart, MessageContent, Role, ToolDefinition,
};
use crate::proxy::upstream::{ContentItem, UpstreamContext, UpstreamMessage, UpstreamTool, UserContent};
use serde_json::{json, Value};

pub async fn translate_request(
    request: &ChatCompletionRequest,
    ingestor: &ImageIngestor,
) -> Result<UpstreamContext, ImageNotSupportedError> {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages = Vec::with_capacity(request.messages.len());

    for message in &request.messages {
        match message.role {
            Role::System | Role::Developer => {
                let text = message.text();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            Role::User => messages.push(UpstreamMessage::User {
                content: user_content(message, ingestor).await?,
                timestamp,
            }),
            Role::Assistant => messages.push(UpstreamMessage::Assistant {
                content: assistant_content(message),
                timestamp,
            }),
            Role::Tool => messages.push(UpstreamMessage::ToolResult {
                tool_call_id: message.tool_call_id.clone().unwrap_or_default(),
                tool_name: message.name.clone().unwrap_or_default(),
                content: vec![ContentItem::Text {
                    text: message.text(),
                }],
                is_error: false,
                timestamp,
            }),
        }
    }

    let tools = request
        .tools
        .as_ref()
        .filter(|tools| !tools.is_empty())
        .map(|tools| tools.iter().map(map_tool).collect());

    Ok(UpstreamContext {
        system_prompt: system_parts.join("\n\n"),
        messages,
        tools,
        tool_choice: request.tool_choice.clone(),
    })
}

async fn user_content(
    message: &ChatMessage,
    ingestor: &ImageIngestor,
) -> Result<UserContent, ImageNotSupportedError> {
    let parts = match &message.content {
        Some(MessageContent::Parts(parts)) => parts,
        Some(MessageContent::Text(text)) => return Ok(UserContent::Text(text.clone())),
        None => return Ok(UserContent::Text(String::new())),
    };

    let mut items = Vec::with_capacity(parts.len());
    // 逐张抓取，保持内容顺序
    for part in parts {
        match part {
            ContentPart::Text { text } => items.push(ContentItem::Text { text: text.clone() }),
            ContentPart::ImageUrl { image_url } => {
                let image = ingestor.ingest(image_url.url()).await?;
                items.push(ContentItem::Image {
                    data: image.data,
                    mime_type: image.mime_type,
                });
            }
            ContentPart::Unsupported => {
                log::debug!("[Transform] 忽略不支持的内容类型");
            }
        }
    }
    Ok(UserContent::Items(items))
}

fn assistant_content(message: &ChatMessage) -> Vec<ContentItem> {
    let mut content = Vec::new();

    let text = message.text();
    if !text.is_empty() {
        content.push(ContentItem::Text { text });
    }

    for call in message.tool_calls.iter().flatten() {
        content.push(ContentItem::ToolCall {
            id: call.id.clone(),
            name: call.function.name.clone(),
            arguments: parse_arguments(&call.function.arguments),
        });
    }

    content
}

/// 工具参数：JSON 字符串尽量解析，失败时保留为 `{"raw": ...}`
fn parse_arguments(arguments: &Value) -> Value {
    match arguments {
        Value::String(s) if s.trim().is_empty() => json!({}),
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| json!({ "raw": s })),
        Value::Null => json!({}),
        other => other.clone(),
    }
}

fn map_tool(tool: &ToolDefinition) -> UpstreamTool {
    UpstreamTool {
        name: tool.function.name.clone(),
        description: tool.function.description.clone().unwrap_or_default(),
        parameters: tool
            .function
            .parameters
            .clone()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    }
}
