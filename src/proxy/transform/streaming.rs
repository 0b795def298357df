//! 流式响应转换模块
//!
//! 实现上游 Agent 事件 → OpenAI Chat Completions SSE 的转换。
//!
//! 每个流式请求持有一个 [`StreamAdapter`]，事件按到达顺序逐个送入 [`StreamAdapter::step`]，
//! 每个事件产出零个或多个 `data: <json>\n\n` 帧。状态机：`Init → Streaming → Done → Finished`，
//! 其中 `Finished` 表示 `[DONE]` 已写出。

use super::{map_stop_reason, now_secs, tool_calls::arguments_to_text, ToolCall};
use crate::proxy::log_codes::sse as log_sse;
use crate::proxy::models::openai::{
    ChatCompletionChunk, ChunkChoice, Delta, DeltaFunction, DeltaToolCall, ErrorBody, FinishReason,
};
use crate::proxy::upstream::{fields, EventKind, UpstreamEvent, UpstreamEventStream};
use crate::proxy::usage::{CompletionRecord, TokenUsage};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const DONE_FRAME: &str = "data: [DONE]\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Streaming,
    /// 已收到 done 事件
    Done,
    /// 已写出 `[DONE]`
    Finished,
}

/// 一个 OpenAI tool call 槽位
#[derive(Debug, Clone, Default)]
struct ToolCallSlot {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// 单个流式响应的状态
#[derive(Debug)]
pub struct StreamState {
    completion_id: String,
    model: String,
    /// 首次使用时固定
    created: Option<i64>,
    /// 上游 contentIndex → OpenAI tool call 槽位，只追加
    tool_call_index_map: IndexMap<u64, usize>,
    next_tool_call_index: usize,
    tool_call_slots: Vec<ToolCallSlot>,
    /// 已经收到过 text_delta 的 contentIndex
    text_delta_seen: HashSet<u64>,
    accumulated_text: String,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
    final_message: Option<Value>,
    error_message: Option<String>,
    role_sent: bool,
}

impl StreamState {
    fn new(model: String, completion_id: String) -> Self {
        Self {
            completion_id,
            model,
            created: None,
            tool_call_index_map: IndexMap::new(),
            next_tool_call_index: 0,
            tool_call_slots: Vec::new(),
            text_delta_seen: HashSet::new(),
            accumulated_text: String::new(),
            finish_reason: None,
            usage: None,
            final_message: None,
            error_message: None,
            role_sent: false,
        }
    }

    fn created(&mut self) -> i64 {
        *self.created.get_or_insert_with(now_secs)
    }

    /// 查找或分配槽位；已有的映射不会被改写
    fn resolve_slot(&mut self, content_index: u64) -> usize {
        if let Some(slot) = self.tool_call_index_map.get(&content_index) {
            return *slot;
        }
        let slot = self.next_tool_call_index;
        self.next_tool_call_index += 1;
        self.tool_call_index_map.insert(content_index, slot);
        self.tool_call_slots.push(ToolCallSlot::default());
        slot
    }
}

/// 上游事件 → OpenAI SSE 帧
pub struct StreamAdapter {
    state: StreamState,
    include_usage: bool,
    phase: Phase,
}

impl StreamAdapter {
    pub fn new(model: impl Into<String>, completion_id: impl Into<String>, include_usage: bool) -> Self {
        Self {
            state: StreamState::new(model.into(), completion_id.into()),
            include_usage,
            phase: Phase::Init,
        }
    }

    pub fn completion_id(&self) -> &str {
        &self.state.completion_id
    }

    pub fn accumulated_text(&self) -> &str {
        &self.state.accumulated_text
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.state.finish_reason
    }

    pub fn usage(&self) -> Option<&TokenUsage> {
        self.state.usage.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// 处理一个上游事件
    pub fn step(&mut self, event: &UpstreamEvent) -> Vec<String> {
        match self.phase {
            Phase::Finished => {
                log::debug!("[Stream] [DONE] 之后收到事件 {:?}，忽略", event.kind);
                return Vec::new();
            }
            Phase::Done => {
                if event.kind != EventKind::Error {
                    log::debug!("[Stream] done 之后收到事件 {:?}，忽略", event.kind);
                    return Vec::new();
                }
            }
            Phase::Init => self.phase = Phase::Streaming,
            Phase::Streaming => {}
        }

        match &event.kind {
            EventKind::Start => self.on_start(),
            EventKind::TextDelta => self.on_text_delta(event),
            EventKind::TextEnd => self.on_text_end(event),
            EventKind::ToolCallStart => self.on_tool_call_start(event),
            EventKind::ToolCallDelta => self.on_tool_call_delta(event),
            EventKind::ToolCallEnd => self.on_tool_call_end(event),
            EventKind::Error => {
                let message = event.error_message();
                log::warn!("[Stream] [{}] 上游错误事件: {message}", log_sse::UPSTREAM_ERROR);
                self.error_frames(message)
            }
            EventKind::Done => self.on_done(event),
            EventKind::TextStart | EventKind::Other(_) => Vec::new(),
        }
    }

    /// 事件迭代失败：写出流内错误，未设置结束原因时记为 content_filter
    pub fn fail(&mut self, message: &str) -> Vec<String> {
        if self.phase == Phase::Finished {
            return Vec::new();
        }
        log::error!("[Stream] [{}] 流中断: {message}", log_sse::ITERATION_FAILED);
        if self.state.finish_reason.is_none() {
            self.state.finish_reason = Some(FinishReason::ContentFilter);
        }
        self.error_frames(message.to_string())
    }

    /// 结束流：可选的 usage chunk 加上唯一一次 `[DONE]`
    pub fn finish(&mut self) -> Vec<String> {
        if self.phase == Phase::Finished {
            return Vec::new();
        }
        if self.phase != Phase::Done && self.state.error_message.is_none() {
            log::warn!("[Stream] [{}] 上游未发送 done 事件即结束", log_sse::MISSING_DONE);
        }
        self.phase = Phase::Finished;

        let mut frames = Vec::with_capacity(2);
        if self.include_usage {
            if let Some(usage) = self.state.usage.clone() {
                let mut chunk = self.chunk(Vec::new());
                chunk.usage = Some(usage.to_openai());
                frames.push(encode(&chunk));
            }
        }
        frames.push(DONE_FRAME.to_string());
        frames
    }

    /// 本次补全的工具调用：优先使用终止消息，否则使用流中收集到的槽位
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        if let Some(message) = &self.state.final_message {
            let calls = super::extract_tool_calls(message);
            if !calls.is_empty() {
                return calls;
            }
        }
        self.state
            .tool_call_slots
            .iter()
            .enumerate()
            .map(|(slot, call)| ToolCall {
                id: call.id.clone().unwrap_or_else(|| format!("call_{slot}")),
                name: call.name.clone().unwrap_or_else(|| "tool".to_string()),
                arguments: if call.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments.clone()
                },
            })
            .collect()
    }

    pub fn to_record(&self, latency_ms: u64) -> CompletionRecord {
        CompletionRecord {
            completion_id: self.state.completion_id.clone(),
            model: self.state.model.clone(),
            is_streaming: true,
            text: self.state.accumulated_text.clone(),
            usage: self.state.usage.clone(),
            finish_reason: self.state.finish_reason,
            tool_calls: self.tool_calls(),
            latency_ms,
            error_message: self.state.error_message.clone(),
        }
    }

    fn on_start(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        self.ensure_role(&mut frames);
        frames
    }

    fn on_text_delta(&mut self, event: &UpstreamEvent) -> Vec<String> {
        let Some(text) = event.text_delta().filter(|t| !t.is_empty()) else {
            return Vec::new();
        };
        self.state.text_delta_seen.insert(event.content_index());
        self.emit_text(text.to_string())
    }

    fn on_text_end(&mut self, event: &UpstreamEvent) -> Vec<String> {
        let index = event.content_index();
        if self.state.text_delta_seen.contains(&index) {
            return Vec::new();
        }
        let Some(text) = event.full_text().filter(|t| !t.is_empty()) else {
            return Vec::new();
        };
        self.state.text_delta_seen.insert(index);
        self.emit_text(text.to_string())
    }

    fn emit_text(&mut self, text: String) -> Vec<String> {
        self.state.accumulated_text.push_str(&text);
        let mut frames = Vec::new();
        self.ensure_role(&mut frames);
        frames.push(encode(&self.chunk(vec![choice(
            Delta {
                content: Some(text),
                ..Default::default()
            },
            None,
        )])));
        frames
    }

    fn on_tool_call_start(&mut self, event: &UpstreamEvent) -> Vec<String> {
        let slot = self.state.resolve_slot(event.content_index());
        let record = &mut self.state.tool_call_slots[slot];
        if record.id.is_some() {
            // 重复的 start，或 delta 先到已分配槽位：只补发不同的 id / name
            return match self.tool_call_delta(slot, event, String::new()) {
                Some(delta) => self.emit_tool_call(delta),
                None => Vec::new(),
            };
        }

        let id = event
            .tool_call_id()
            .map(str::to_string)
            .unwrap_or_else(|| format!("call_{slot}"));
        let name = event.tool_call_name().unwrap_or("tool").to_string();
        record.id = Some(id.clone());
        record.name = Some(name.clone());

        self.emit_tool_call(DeltaToolCall {
            index: slot,
            id: Some(id),
            call_type: Some("function".to_string()),
            function: Some(DeltaFunction {
                name: Some(name),
                arguments: Some(String::new()),
            }),
        })
    }

    fn on_tool_call_delta(&mut self, event: &UpstreamEvent) -> Vec<String> {
        let slot = self.state.resolve_slot(event.content_index());
        let arguments = event.arguments_delta().unwrap_or_default().to_string();
        let delta = self.tool_call_delta(slot, event, arguments);
        match delta {
            Some(delta) => self.emit_tool_call(delta),
            None => Vec::new(),
        }
    }

    /// toolcall_end 只在该槽位没有收到任何参数增量时补发完整参数
    fn on_tool_call_end(&mut self, event: &UpstreamEvent) -> Vec<String> {
        let slot = self.state.resolve_slot(event.content_index());
        if !self.state.tool_call_slots[slot].arguments.is_empty() {
            return Vec::new();
        }

        let full_arguments = fields::first_object(&event.payload, fields::TOOL_CALL_OBJECT)
            .and_then(|call| fields::first(call, fields::TOOL_ARGUMENTS))
            .map(|args| arguments_to_text(Some(args)))
            .filter(|args| args != "{}")
            .unwrap_or_default();

        match self.tool_call_delta(slot, event, full_arguments) {
            Some(delta) => self.emit_tool_call(delta),
            None => Vec::new(),
        }
    }

    /// 构造参数增量，同时带上此前未发送过的 id / name
    fn tool_call_delta(
        &mut self,
        slot: usize,
        event: &UpstreamEvent,
        arguments: String,
    ) -> Option<DeltaToolCall> {
        let record = &mut self.state.tool_call_slots[slot];

        let id = event
            .tool_call_id()
            .filter(|id| record.id.as_deref() != Some(*id))
            .map(str::to_string);
        let name = event
            .tool_call_name()
            .filter(|name| record.name.as_deref() != Some(*name))
            .map(str::to_string);

        // 槽位由 delta 首次分配时，补齐 OpenAI 客户端需要的 id / name
        let id = id.or_else(|| record.id.is_none().then(|| format!("call_{slot}")));
        let name = name.or_else(|| record.name.is_none().then(|| "tool".to_string()));

        if arguments.is_empty() && id.is_none() && name.is_none() {
            return None;
        }

        if let Some(id) = &id {
            record.id = Some(id.clone());
        }
        if let Some(name) = &name {
            record.name = Some(name.clone());
        }
        record.arguments.push_str(&arguments);

        Some(DeltaToolCall {
            index: slot,
            call_type: id.as_ref().map(|_| "function".to_string()),
            id,
            function: Some(DeltaFunction {
                name,
                arguments: Some(arguments),
            }),
        })
    }

    fn emit_tool_call(&mut self, tool_call: DeltaToolCall) -> Vec<String> {
        let mut frames = Vec::new();
        self.ensure_role(&mut frames);
        frames.push(encode(&self.chunk(vec![choice(
            Delta {
                tool_calls: Some(vec![tool_call]),
                ..Default::default()
            },
            None,
        )])));
        frames
    }

    fn on_done(&mut self, event: &UpstreamEvent) -> Vec<String> {
        self.phase = Phase::Done;

        let finish_reason = *self
            .state
            .finish_reason
            .get_or_insert_with(|| map_stop_reason(event.stop_reason()));

        let message = event.terminal_message().cloned();
        self.state.usage = fields::first_object(&event.payload, fields::USAGE)
            .and_then(TokenUsage::from_value)
            .or_else(|| message.as_ref().and_then(TokenUsage::from_upstream_message));
        self.state.final_message = message;

        let mut frames = Vec::new();
        self.ensure_role(&mut frames);
        frames.push(encode(&self.chunk(vec![choice(Delta::default(), Some(finish_reason))])));
        frames
    }

    fn error_frames(&mut self, message: String) -> Vec<String> {
        self.state.error_message = Some(message.clone());
        let body = ErrorBody::new(message, "server_error", Some("upstream_model_error"));
        vec![format!(
            "data: {}\n\n",
            serde_json::to_string(&body).unwrap_or_default()
        )]
    }

    /// 任何 chat chunk 之前保证先发送过 role
    fn ensure_role(&mut self, frames: &mut Vec<String>) {
        if self.state.role_sent {
            return;
        }
        self.state.role_sent = true;
        frames.push(encode(&self.chunk(vec![choice(
            Delta {
                role: Some("assistant".to_string()),
                ..Default::default()
            },
            None,
        )])));
    }

    fn chunk(&mut self, choices: Vec<ChunkChoice>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.state.completion_id.clone(),
            object: ChatCompletionChunk::OBJECT.to_string(),
            created: self.state.created(),
            model: self.state.model.clone(),
            choices,
            usage: None,
        }
    }
}

fn choice(delta: Delta, finish_reason: Option<FinishReason>) -> ChunkChoice {
    ChunkChoice {
        index: 0,
        delta,
        finish_reason,
    }
}

fn encode(chunk: &ChatCompletionChunk) -> String {
    format!("data: {}\n\n", serde_json::to_string(chunk).unwrap_or_default())
}

/// 响应流被丢弃（客户端断开）时取消上游调用
struct DisconnectGuard {
    cancel: CancellationToken,
    tag: String,
    armed: bool,
}

impl DisconnectGuard {
    fn new(cancel: CancellationToken, tag: String) -> Self {
        Self {
            cancel,
            tag,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            log::info!(
                "[Stream] [{}] {} 客户端断开，取消上游调用",
                log_sse::CLIENT_DISCONNECTED,
                self.tag
            );
            self.cancel.cancel();
        }
    }
}

/// 驱动上游事件流，输出 SSE 字节流
///
/// 正常结束、上游出错或取消令牌触发时都会写出结尾；流在完成前被丢弃时取消 `cancel`，
/// 此后不会再有任何写出。`on_complete` 只在流完整结束后调用一次。
pub fn into_sse_stream<F>(
    mut adapter: StreamAdapter,
    mut events: UpstreamEventStream,
    cancel: CancellationToken,
    started: Instant,
    on_complete: F,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    F: FnOnce(CompletionRecord) + Send + 'static,
{
    // 在首次 poll 之前就持有守卫，响应体未被读取即丢弃时同样取消上游
    let mut guard = DisconnectGuard::new(cancel.clone(), adapter.completion_id().to_string());

    async_stream::stream! {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = events.next() => Some(next),
            };

            match next {
                None => {
                    for frame in adapter.fail("Request cancelled") {
                        yield Ok(Bytes::from(frame));
                    }
                    break;
                }
                Some(Some(Ok(event))) => {
                    for frame in adapter.step(&event) {
                        yield Ok(Bytes::from(frame));
                    }
                }
                Some(Some(Err(e))) => {
                    for frame in adapter.fail(&e.to_string()) {
                        yield Ok(Bytes::from(frame));
                    }
                    break;
                }
                Some(None) => break,
            }
        }

        for frame in adapter.finish() {
            yield Ok(Bytes::from(frame));
        }
        guard.disarm();

        log::info!("[Stream] ====== 流结束 {} ======", adapter.completion_id());
        on_complete(adapter.to_record(started.elapsed().as_millis() as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::upstream::UpstreamError;
    use futures::stream;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn event(value: Value) -> UpstreamEvent {
        UpstreamEvent::from_value(value).unwrap()
    }

    fn adapter() -> StreamAdapter {
        StreamAdapter::new("model-x", "chatcmpl-test", false)
    }

    fn run(adapter: &mut StreamAdapter, events: Vec<Value>) -> Vec<String> {
        let mut frames = Vec::new();
        for e in events {
            frames.extend(adapter.step(&event(e)));
        }
        frames.extend(adapter.finish());
        frames
    }

    fn parse(frame: &str) -> Value {
        let data = frame
            .strip_prefix("data: ")
            .and_then(|f| f.strip_suffix("\n\n"))
            .unwrap();
        serde_json::from_str(data).unwrap()
    }

    fn delta(frame: &str) -> Value {
        parse(frame)["choices"][0]["delta"].clone()
    }

    #[test]
    fn test_hello_stream_exact_frames() {
        let mut adapter = adapter();
        let frames = run(
            &mut adapter,
            vec![
                json!({"type": "text_delta", "contentIndex": 0, "delta": "hello"}),
                json!({"type": "done", "reason": "stop"}),
            ],
        );

        assert_eq!(frames.len(), 4);
        assert_eq!(delta(&frames[0]), json!({"role": "assistant"}));
        assert_eq!(delta(&frames[1]), json!({"content": "hello"}));
        let finish = parse(&frames[2]);
        assert_eq!(finish["choices"][0]["delta"], json!({}));
        assert_eq!(finish["choices"][0]["finish_reason"], json!("stop"));
        assert_eq!(frames[3], "data: [DONE]\n\n");

        let first = parse(&frames[0]);
        assert_eq!(first["id"], json!("chatcmpl-test"));
        assert_eq!(first["object"], json!("chat.completion.chunk"));
        assert_eq!(first["model"], json!("model-x"));
        assert_eq!(first["created"], finish["created"]);
    }

    #[test]
    fn test_start_event_emits_role_once() {
        let mut adapter = adapter();
        let frames = run(
            &mut adapter,
            vec![
                json!({"type": "start", "partial": {"content": []}}),
                json!({"type": "text_start", "contentIndex": 0}),
                json!({"type": "text_delta", "contentIndex": 0, "delta": "hello"}),
                json!({"type": "done", "reason": "stop"}),
            ],
        );

        assert_eq!(frames.len(), 4);
        assert_eq!(delta(&frames[0]), json!({"role": "assistant"}));
        assert_eq!(delta(&frames[1]), json!({"content": "hello"}));
    }

    #[test]
    fn test_text_end_without_delta_emits_once() {
        let mut adapter = adapter();
        let frames = run(
            &mut adapter,
            vec![
                json!({"type": "start"}),
                json!({"type": "text_end", "contentIndex": 0, "content": "hi"}),
                json!({"type": "done", "reason": "stop"}),
            ],
        );

        let contents: Vec<Value> = frames
            .iter()
            .filter(|f| !f.contains("[DONE]"))
            .map(|f| delta(f))
            .filter(|d| d.get("content").is_some())
            .collect();
        assert_eq!(contents, vec![json!({"content": "hi"})]);
        assert_eq!(adapter.accumulated_text(), "hi");
    }

    #[test]
    fn test_text_end_after_delta_is_suppressed() {
        let mut adapter = adapter();
        let frames = run(
            &mut adapter,
            vec![
                json!({"type": "text_delta", "contentIndex": 0, "delta": "he"}),
                json!({"type": "text_delta", "contentIndex": 0, "text": "llo"}),
                json!({"type": "text_end", "contentIndex": 0, "content": "hello"}),
                json!({"type": "text_end", "contentIndex": 1, "content": " world"}),
                json!({"type": "done", "reason": "stop"}),
            ],
        );

        assert_eq!(adapter.accumulated_text(), "hello world");
        // role + he + llo + " world" + finish + [DONE]
        assert_eq!(frames.len(), 6);
    }

    #[test]
    fn test_empty_text_delta_is_ignored() {
        let mut adapter = adapter();
        let frames = adapter.step(&event(json!({"type": "text_delta", "contentIndex": 0, "delta": ""})));
        assert!(frames.is_empty());
        // 空 delta 不算“已见”，后续 text_end 仍可输出
        let frames = adapter.step(&event(json!({"type": "text_end", "contentIndex": 0, "content": "x"})));
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_tool_call_slots_are_distinct_and_stable() {
        let mut adapter = adapter();
        let frames = run(
            &mut adapter,
            vec![
                json!({"type": "text_delta", "contentIndex": 0, "delta": "Let me check."}),
                json!({"type": "toolcall_start", "contentIndex": 1, "partial": {"content": [
                    {"type": "text", "text": "Let me check."},
                    {"type": "toolCall", "id": "call_a", "name": "get_weather", "arguments": {}}
                ]}}),
                json!({"type": "toolcall_start", "contentIndex": 3, "toolCallId": "call_b", "toolName": "get_time"}),
                json!({"type": "toolcall_delta", "contentIndex": 1, "delta": "{\"city\":"}),
                json!({"type": "toolcall_delta", "contentIndex": 3, "delta": "{}"}),
                json!({"type": "toolcall_delta", "contentIndex": 1, "delta": "\"Paris\"}"}),
                json!({"type": "done", "reason": "toolUse"}),
            ],
        );

        let tool_deltas: Vec<Value> = frames
            .iter()
            .filter(|f| !f.contains("[DONE]"))
            .map(|f| delta(f))
            .filter_map(|d| d.get("tool_calls").map(|t| t[0].clone()))
            .collect();

        assert_eq!(tool_deltas.len(), 5);
        assert_eq!(
            tool_deltas[0],
            json!({"index": 0, "id": "call_a", "type": "function", "function": {"name": "get_weather", "arguments": ""}})
        );
        assert_eq!(
            tool_deltas[1],
            json!({"index": 1, "id": "call_b", "type": "function", "function": {"name": "get_time", "arguments": ""}})
        );
        assert_eq!(tool_deltas[2], json!({"index": 0, "function": {"arguments": "{\"city\":"}}));
        assert_eq!(tool_deltas[3], json!({"index": 1, "function": {"arguments": "{}"}}));
        assert_eq!(tool_deltas[4], json!({"index": 0, "function": {"arguments": "\"Paris\"}"}}));

        assert_eq!(adapter.finish_reason(), Some(FinishReason::ToolCalls));
        let calls = adapter.tool_calls();
        assert_eq!(calls[0].arguments, r#"{"city":"Paris"}"#);
        assert_eq!(calls[1].id, "call_b");
    }

    #[test]
    fn test_tool_call_without_ids_gets_synthesized_defaults() {
        let mut adapter = adapter();
        let frames = adapter.step(&event(json!({"type": "toolcall_start", "contentIndex": 2})));
        let tool = delta(&frames[1])["tool_calls"][0].clone();
        assert_eq!(tool["id"], json!("call_0"));
        assert_eq!(tool["function"]["name"], json!("tool"));
    }

    #[test]
    fn test_delta_before_start_allocates_slot() {
        let mut adapter = adapter();
        let frames = adapter.step(&event(json!({
            "type": "toolcall_delta", "contentIndex": 5, "delta": "{\"a\"",
            "partial": {"content": [{}, {}, {}, {}, {}, {"type": "toolCall", "id": "call_late", "name": "late"}]}
        })));
        let tool = delta(&frames[1])["tool_calls"][0].clone();
        assert_eq!(
            tool,
            json!({"index": 0, "id": "call_late", "type": "function", "function": {"name": "late", "arguments": "{\"a\""}})
        );

        // 随后的 start 不再重复介绍该槽位
        let frames = adapter.step(&event(json!({"type": "toolcall_start", "contentIndex": 5})));
        assert!(frames.is_empty());

        let frames = adapter.step(&event(json!({"type": "toolcall_start", "contentIndex": 6})));
        assert_eq!(delta(&frames[0])["tool_calls"][0]["index"], json!(1));
    }

    #[test]
    fn test_start_after_delta_replaces_synthesized_id_and_name() {
        let mut adapter = adapter();
        let frames = adapter.step(&event(json!({"type": "toolcall_delta", "contentIndex": 0, "delta": "{\"city\":"})));
        let first = delta(&frames[1])["tool_calls"][0].clone();
        assert_eq!(first["id"], json!("call_0"));
        assert_eq!(first["function"]["name"], json!("tool"));

        let frames = adapter.step(&event(json!({
            "type": "toolcall_start", "contentIndex": 0,
            "toolCallId": "call_real", "toolName": "get_weather"
        })));
        assert_eq!(frames.len(), 1);
        assert_eq!(
            delta(&frames[0])["tool_calls"][0],
            json!({"index": 0, "id": "call_real", "type": "function", "function": {"name": "get_weather", "arguments": ""}})
        );

        // 相同 id / name 的重复 start 不再输出
        let frames = adapter.step(&event(json!({
            "type": "toolcall_start", "contentIndex": 0,
            "toolCallId": "call_real", "toolName": "get_weather"
        })));
        assert!(frames.is_empty());

        adapter.step(&event(json!({"type": "toolcall_delta", "contentIndex": 0, "delta": "\"Paris\"}"})));
        let calls = adapter.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_real");
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments, r#"{"city":"Paris"}"#);
    }

    #[test]
    fn test_late_id_is_propagated() {
        let mut adapter = adapter();
        adapter.step(&event(json!({"type": "toolcall_start", "contentIndex": 0})));
        let frames = adapter.step(&event(json!({
            "type": "toolcall_delta", "contentIndex": 0, "delta": "{}",
            "partial": {"content": [{"type": "toolCall", "id": "call_real", "name": "tool"}]}
        })));
        assert_eq!(
            delta(&frames[0])["tool_calls"][0],
            json!({"index": 0, "id": "call_real", "type": "function", "function": {"arguments": "{}"}})
        );
    }

    #[test]
    fn test_tool_call_end_backfills_arguments() {
        let mut adapter = adapter();
        adapter.step(&event(json!({"type": "toolcall_start", "contentIndex": 0, "id": "call_1", "name": "f"})));
        let frames = adapter.step(&event(json!({
            "type": "toolcall_end", "contentIndex": 0,
            "toolCall": {"type": "toolCall", "id": "call_1", "name": "f", "arguments": {"x": 1}}
        })));
        assert_eq!(
            delta(&frames[0])["tool_calls"][0],
            json!({"index": 0, "function": {"arguments": "{\"x\":1}"}})
        );

        let frames = adapter.step(&event(json!({
            "type": "toolcall_end", "contentIndex": 0,
            "toolCall": {"id": "call_1", "name": "f", "arguments": {"x": 1}}
        })));
        assert!(frames.is_empty());
    }

    #[test]
    fn test_stop_reason_mapping_on_done() {
        for (reason, expected) in [
            ("tool_use", "tool_calls"),
            ("max_tokens", "length"),
            ("aborted", "content_filter"),
            ("end_turn", "stop"),
        ] {
            let mut adapter = adapter();
            let frames = adapter.step(&event(json!({"type": "done", "reason": reason})));
            let last = parse(frames.last().unwrap());
            assert_eq!(last["choices"][0]["finish_reason"], json!(expected), "{reason}");
        }
    }

    #[test]
    fn test_usage_chunk_only_when_requested() {
        let done = json!({
            "type": "done",
            "reason": "stop",
            "message": {
                "role": "assistant",
                "content": [{"type": "text", "text": "ok"}],
                "usage": {"input": 10, "output": 2, "cacheRead": 4, "cacheWrite": 0, "totalTokens": 16}
            }
        });

        let mut with_usage = StreamAdapter::new("m", "chatcmpl-1", true);
        let frames = run(&mut with_usage, vec![done.clone()]);
        assert_eq!(frames.len(), 4);
        let usage_chunk = parse(&frames[2]);
        assert_eq!(usage_chunk["choices"], json!([]));
        assert_eq!(usage_chunk["usage"]["prompt_tokens"], json!(14));
        assert_eq!(usage_chunk["usage"]["completion_tokens"], json!(2));
        assert_eq!(usage_chunk["usage"]["total_tokens"], json!(16));
        assert_eq!(frames[3], DONE_FRAME);

        let mut without = StreamAdapter::new("m", "chatcmpl-2", false);
        let frames = run(&mut without, vec![done]);
        assert_eq!(frames.len(), 3);
        assert!(without.usage().is_some());
    }

    #[test]
    fn test_no_usage_chunk_without_captured_usage() {
        let mut adapter = StreamAdapter::new("m", "chatcmpl-1", true);
        let frames = run(&mut adapter, vec![json!({"type": "done", "reason": "stop"})]);
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn test_error_event_is_in_band_and_not_terminal() {
        let mut adapter = adapter();
        let frames = run(
            &mut adapter,
            vec![
                json!({"type": "text_delta", "contentIndex": 0, "delta": "par"}),
                json!({"type": "error", "reason": "error", "error": {"errorMessage": "overloaded"}}),
                json!({"type": "text_delta", "contentIndex": 0, "delta": "tial"}),
                json!({"type": "done", "reason": "error"}),
            ],
        );

        let error = parse(&frames[2]);
        assert_eq!(
            error,
            json!({"error": {"message": "overloaded", "type": "server_error", "code": "upstream_model_error"}})
        );
        assert_eq!(adapter.accumulated_text(), "partial");
        assert_eq!(adapter.finish_reason(), Some(FinishReason::ContentFilter));
        assert_eq!(frames.last().unwrap(), DONE_FRAME);
    }

    #[test]
    fn test_fail_sets_content_filter_and_finish_is_once() {
        let mut adapter = adapter();
        adapter.step(&event(json!({"type": "text_delta", "delta": "x"})));
        let frames = adapter.fail("connection reset");
        assert_eq!(parse(&frames[0])["error"]["message"], json!("connection reset"));
        assert_eq!(adapter.finish_reason(), Some(FinishReason::ContentFilter));

        assert_eq!(adapter.finish(), vec![DONE_FRAME.to_string()]);
        assert!(adapter.finish().is_empty());
        assert!(adapter.fail("again").is_empty());
        assert!(adapter.is_finished());
    }

    #[test]
    fn test_fail_keeps_existing_finish_reason() {
        let mut adapter = adapter();
        adapter.step(&event(json!({"type": "done", "reason": "length"})));
        adapter.fail("late failure");
        assert_eq!(adapter.finish_reason(), Some(FinishReason::Length));
    }

    #[test]
    fn test_events_after_done_are_dropped() {
        let mut adapter = adapter();
        adapter.step(&event(json!({"type": "done", "reason": "stop"})));
        assert!(adapter
            .step(&event(json!({"type": "text_delta", "delta": "late"})))
            .is_empty());
        assert!(adapter
            .step(&event(json!({"type": "done", "reason": "length"})))
            .is_empty());
        assert_eq!(adapter.finish_reason(), Some(FinishReason::Stop));
        assert_eq!(adapter.accumulated_text(), "");
    }

    #[test]
    fn test_unknown_events_are_ignored() {
        let mut adapter = adapter();
        assert!(adapter
            .step(&event(json!({"type": "thinking_delta", "delta": "hmm"})))
            .is_empty());
        assert!(adapter
            .step(&event(json!({"type": "text_start", "contentIndex": 0})))
            .is_empty());
    }

    fn boxed(events: Vec<Result<UpstreamEvent, UpstreamError>>) -> UpstreamEventStream {
        stream::iter(events).boxed()
    }

    async fn collect_frames(
        s: impl Stream<Item = Result<Bytes, std::io::Error>>,
    ) -> Vec<String> {
        s.map(|b| String::from_utf8(b.unwrap().to_vec()).unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_sse_stream_reports_completion() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = records.clone();
        let events = boxed(vec![
            Ok(event(json!({"type": "start"}))),
            Ok(event(json!({"type": "text_delta", "delta": "hello"}))),
            Ok(event(json!({"type": "done", "reason": "stop"}))),
        ]);
        let cancel = CancellationToken::new();

        let frames = collect_frames(into_sse_stream(
            adapter(),
            events,
            cancel.clone(),
            Instant::now(),
            move |record| sink.lock().unwrap().push(record),
        ))
        .await;

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[3], DONE_FRAME);
        assert!(!cancel.is_cancelled());

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "hello");
        assert!(records[0].is_streaming);
        assert_eq!(records[0].finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn test_sse_stream_iteration_error_is_in_band() {
        let events = boxed(vec![
            Ok(event(json!({"type": "text_delta", "delta": "he"}))),
            Err(UpstreamError::Stream("connection reset".into())),
            Ok(event(json!({"type": "text_delta", "delta": "never"}))),
        ]);

        let frames = collect_frames(into_sse_stream(
            adapter(),
            events,
            CancellationToken::new(),
            Instant::now(),
            |_| {},
        ))
        .await;

        assert_eq!(frames.len(), 4);
        assert!(frames[2].contains("upstream_model_error"));
        assert!(frames[2].contains("connection reset"));
        assert_eq!(frames[3], DONE_FRAME);
        assert_eq!(frames.iter().filter(|f| f.as_str() == DONE_FRAME).count(), 1);
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_upstream() {
        let cancel = CancellationToken::new();
        let completed = Arc::new(Mutex::new(false));
        let flag = completed.clone();
        let events: UpstreamEventStream =
            stream::iter(vec![Ok(event(json!({"type": "text_delta", "delta": "a"})))])
                .chain(stream::pending())
                .boxed();

        let sse = into_sse_stream(adapter(), events, cancel.clone(), Instant::now(), move |_| {
            *flag.lock().unwrap() = true;
        });
        let mut sse = Box::pin(sse);

        // role + content
        assert!(sse.next().await.is_some());
        assert!(sse.next().await.is_some());
        assert!(!cancel.is_cancelled());

        drop(sse);
        assert!(cancel.is_cancelled());
        assert!(!*completed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_dropping_unpolled_stream_cancels_upstream() {
        let cancel = CancellationToken::new();
        let events: UpstreamEventStream = stream::pending().boxed();

        let sse = into_sse_stream(adapter(), events, cancel.clone(), Instant::now(), |_| {});
        assert!(!cancel.is_cancelled());

        drop(sse);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellation_finishes_stream() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let events: UpstreamEventStream = stream::pending().boxed();
        let frames = collect_frames(into_sse_stream(
            adapter(),
            events,
            cancel,
            Instant::now(),
            |_| {},
        ))
        .await;

        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("Request cancelled"));
        assert_eq!(frames[1], DONE_FRAME);
    }
}
