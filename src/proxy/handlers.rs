//! 请求处理器
//!
//! 处理各种API端点的HTTP请求

use super::{
    handler_context::RequestContext,
    log_codes::{req as log_req, ups as log_ups},
    models::openai::{ChatCompletionRequest, ModelCard, ModelList},
    server::ProxyState,
    transform::{
        assemble_response, await_terminal_message, extract_tool_calls, into_sse_stream,
        now_secs, response::extract_text, translate_request, StreamAdapter,
    },
    types::*,
    upstream::{CallOptions, UpstreamError},
    usage::{CompletionRecord, TokenUsage},
    ProxyError,
};
use axum::{
    extract::{rejection::BytesRejection, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde_json::{json, Value};

const TAG: &str = "Chat";

/// 健康检查
pub async fn health_check() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

/// 获取服务状态
pub async fn get_status(State(state): State<ProxyState>) -> Json<ProxyStatus> {
    Json(snapshot_status(&state).await)
}

pub(crate) async fn snapshot_status(state: &ProxyState) -> ProxyStatus {
    let mut status = state.status.read().await.clone();
    if let Some(start) = *state.start_time.read().await {
        status.uptime_seconds = start.elapsed().as_secs();
    }
    status
}

/// 列出配置中允许的模型
pub async fn list_models(State(state): State<ProxyState>) -> Json<ModelList> {
    let created = now_secs();
    let owned_by = state.agent.name().to_string();
    let data = state
        .config
        .models
        .iter()
        .map(|id| ModelCard {
            id: id.clone(),
            object: "model".to_string(),
            created,
            owned_by: owned_by.clone(),
        })
        .collect();

    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}

/// 处理 /v1/chat/completions 请求
///
/// 流式响应的成功/失败在流结束时计入状态，其余情况在这里计入。
pub async fn handle_chat_completions(
    State(state): State<ProxyState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ProxyError> {
    state.status.write().await.record_request();

    let result = match body {
        Ok(body) => dispatch(&state, &body).await,
        Err(rejection) => Err(body_rejection(&state, rejection)),
    };

    match result {
        Ok(Dispatched::Streaming(response)) => Ok(response),
        Ok(Dispatched::Complete(response)) => {
            state.status.write().await.record_result(None);
            Ok(response)
        }
        Err(e) => {
            log::warn!("[{TAG}] 请求失败: {e}");
            state.status.write().await.record_result(Some(e.to_string()));
            Err(e)
        }
    }
}

enum Dispatched {
    Streaming(Response),
    Complete(Response),
}

async fn dispatch(state: &ProxyState, body: &[u8]) -> Result<Dispatched, ProxyError> {
    let request = parse_request(state, body)?;
    let ctx = RequestContext::new(&request, TAG);

    // 凭证与图片都在调用上游之前解决，失败时仍能返回普通 HTTP 错误
    let api_key = state.token_provider.token().await.map_err(|e| {
        log::warn!("[{}] {e}", log_ups::AUTH_MISSING);
        ProxyError::from(e)
    })?;

    let context = translate_request(&request, &state.ingestor)
        .await
        .map_err(|e| {
            log::warn!("[{}] 请求转换失败: {e}", log_req::TRANSLATE_FAILED);
            ProxyError::from(e)
        })?;

    let cancel = state.shutdown.child_token();
    let options = CallOptions {
        api_key,
        temperature: request.temperature,
        max_tokens: request.effective_max_tokens(),
        cancel: cancel.clone(),
    };

    let events = state
        .agent
        .stream(&ctx.request_model, context, options)
        .await
        .map_err(|e| {
            log::error!(
                "[{}] 上游 {} 调用失败: {e}",
                log_ups::CALL_FAILED,
                state.agent.name()
            );
            ProxyError::from(e)
        })?;

    if ctx.is_streaming {
        let adapter = StreamAdapter::new(
            ctx.request_model.clone(),
            ctx.completion_id.clone(),
            request.include_usage(),
        );

        let observer = state.observer.clone();
        let status = state.status.clone();
        let on_complete = move |record: CompletionRecord| {
            observer.on_completion(&record);
            let error = record.error_message;
            tokio::spawn(async move {
                status.write().await.record_result(error);
            });
        };

        let stream = into_sse_stream(adapter, events, cancel, ctx.start_time, on_complete);

        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("text/event-stream"));
        headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
        headers.insert("Connection", HeaderValue::from_static("keep-alive"));

        let body = axum::body::Body::from_stream(stream);
        return Ok(Dispatched::Streaming((headers, body).into_response()));
    }

    let message = match await_terminal_message(events).await {
        Ok(message) => message,
        Err(e) => {
            if matches!(e, UpstreamError::MissingTerminalMessage) {
                log::error!("[{}] {e}", log_ups::NO_TERMINAL_MESSAGE);
            }
            state.observer.on_completion(&CompletionRecord {
                completion_id: ctx.completion_id.clone(),
                model: ctx.request_model.clone(),
                is_streaming: false,
                text: String::new(),
                usage: None,
                finish_reason: None,
                tool_calls: Vec::new(),
                latency_ms: ctx.latency_ms(),
                error_message: Some(e.to_string()),
            });
            return Err(e.into());
        }
    };

    let response = assemble_response(&message, &ctx.request_model, &ctx.completion_id);
    state.observer.on_completion(&CompletionRecord {
        completion_id: ctx.completion_id.clone(),
        model: ctx.request_model.clone(),
        is_streaming: false,
        text: extract_text(&message),
        usage: TokenUsage::from_upstream_message(&message),
        finish_reason: response.choices.first().map(|c| c.finish_reason),
        tool_calls: extract_tool_calls(&message),
        latency_ms: ctx.latency_ms(),
        error_message: None,
    });

    Ok(Dispatched::Complete(Json(response).into_response()))
}

/// 请求体读取失败：超过上限时返回 413，其余按无效请求处理
fn body_rejection(state: &ProxyState, rejection: BytesRejection) -> ProxyError {
    log::warn!("[{}] 读取请求体失败: {rejection}", log_req::INVALID_BODY);
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ProxyError::PayloadTooLarge(state.config.max_body_bytes)
    } else {
        ProxyError::InvalidRequest(format!(
            "Failed to read request body: {}",
            rejection.body_text()
        ))
    }
}

/// 解析并校验请求体
fn parse_request(state: &ProxyState, body: &[u8]) -> Result<ChatCompletionRequest, ProxyError> {
    let request: ChatCompletionRequest = serde_json::from_slice(body).map_err(|e| {
        log::warn!("[{}] 请求体解析失败: {e}", log_req::INVALID_BODY);
        ProxyError::InvalidRequest(format!("Invalid request body: {e}"))
    })?;

    if request.model.trim().is_empty() {
        return Err(ProxyError::InvalidRequest(
            "`model` must be a non-empty string".to_string(),
        ));
    }
    if request.messages.is_empty() {
        return Err(ProxyError::InvalidRequest(
            "`messages` must be a non-empty array".to_string(),
        ));
    }
    if !state.config.allows_model(&request.model) {
        log::warn!(
            "[{}] 模型不在允许列表中: {}",
            log_req::MODEL_NOT_FOUND,
            request.model
        );
        return Err(ProxyError::ModelNotFound(request.model));
    }

    Ok(request)
}
