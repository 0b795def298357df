//! Usage Logger - 记录每次补全的结果

use super::parser::TokenUsage;
use crate::proxy::models::openai::FinishReason;
use crate::proxy::transform::ToolCall;

/// 单次补全记录
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub completion_id: String,
    pub model: String,
    pub is_streaming: bool,
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<FinishReason>,
    pub tool_calls: Vec<ToolCall>,
    pub latency_ms: u64,
    /// 流内错误或上游错误信息
    pub error_message: Option<String>,
}

/// 补全结果观察者
pub trait RequestObserver: Send + Sync {
    fn on_completion(&self, record: &CompletionRecord);
}

/// 输出到日志的观察者
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RequestObserver for LogObserver {
    fn on_completion(&self, record: &CompletionRecord) {
        let usage = record.usage.clone().unwrap_or_default().to_openai();
        let finish_reason = record
            .finish_reason
            .map(|r| r.as_str())
            .unwrap_or("none");

        log::info!(
            "[Usage] id={} model={} stream={} finish={} prompt={} completion={} total={} tools={} chars={} latency={}ms",
            record.completion_id,
            record.model,
            record.is_streaming,
            finish_reason,
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.total_tokens,
            record.tool_calls.len(),
            record.text.chars().count(),
            record.latency_ms,
        );

        if let Some(error) = &record.error_message {
            log::warn!("[Usage] id={} 上游错误: {error}", record.completion_id);
        }
    }
}
