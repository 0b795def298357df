//! 请求上下文模块
//!
//! 贯穿一次补全请求的计时、补全 ID 与日志标签

use super::models::openai::ChatCompletionRequest;
use super::transform::new_completion_id;
use std::time::Instant;

/// 请求上下文
pub struct RequestContext {
    /// 请求开始时间
    pub start_time: Instant,
    /// 本次补全的 ID（流式 chunk 与非流式响应共用）
    pub completion_id: String,
    /// 请求中的模型名称，原样回显给客户端
    pub request_model: String,
    pub is_streaming: bool,
    /// 日志标签
    pub tag: &'static str,
}

impl RequestContext {
    pub fn new(request: &ChatCompletionRequest, tag: &'static str) -> Self {
        let context = Self {
            start_time: Instant::now(),
            completion_id: new_completion_id(),
            request_model: request.model.clone(),
            is_streaming: request.is_stream(),
            tag,
        };

        log::info!(
            "[{}] {} model: {}, stream: {}, messages: {}",
            tag,
            context.completion_id,
            context.request_model,
            context.is_streaming,
            request.messages.len()
        );
        context
    }

    /// 计算请求延迟（毫秒）
    #[inline]
    pub fn latency_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}
