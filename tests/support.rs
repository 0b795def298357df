#![allow(dead_code)]

use agent_bridge_lib::proxy::image::ImageIngestor;
use agent_bridge_lib::proxy::upstream::{
    CallOptions, StaticTokenProvider, UpstreamAgent, UpstreamContext, UpstreamError, UpstreamEvent,
    UpstreamEventStream,
};
use agent_bridge_lib::proxy::usage::{CompletionRecord, RequestObserver};
use agent_bridge_lib::{BridgeConfig, ImageConfig, ProxyState};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// 一次上游调用的记录
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub context: UpstreamContext,
    pub api_key: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// 按脚本回放事件的上游
pub struct ScriptedAgent {
    events: Vec<Value>,
    /// 回放完后不结束，直到取消令牌触发
    hang: bool,
    /// `stream` 直接返回的 HTTP 错误
    fail_status: Option<(u16, String)>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedAgent {
    pub fn new(events: Vec<Value>) -> Self {
        Self {
            events,
            hang: false,
            fail_status: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn hanging(events: Vec<Value>) -> Self {
        Self {
            hang: true,
            ..Self::new(events)
        }
    }

    pub fn failing(status: u16, body: &str) -> Self {
        Self {
            fail_status: Some((status, body.to_string())),
            ..Self::new(Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_call(&self) -> RecordedCall {
        self.calls.lock().unwrap().last().cloned().expect("no upstream call")
    }
}

#[async_trait]
impl UpstreamAgent for ScriptedAgent {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream(
        &self,
        model: &str,
        context: UpstreamContext,
        options: CallOptions,
    ) -> Result<UpstreamEventStream, UpstreamError> {
        self.calls.lock().unwrap().push(RecordedCall {
            model: model.to_string(),
            context,
            api_key: options.api_key.clone(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        });

        if let Some((status, body)) = &self.fail_status {
            return Err(UpstreamError::Status {
                status: *status,
                body: body.clone(),
            });
        }

        let events: Vec<Result<UpstreamEvent, UpstreamError>> = self
            .events
            .iter()
            .cloned()
            .map(UpstreamEvent::from_value)
            .collect();
        let replay = stream::iter(events);

        if self.hang {
            let cancel = options.cancel.clone();
            let tail = stream::once(async move {
                cancel.cancelled().await;
                Err(UpstreamError::Cancelled)
            });
            Ok(replay.chain(tail).boxed())
        } else {
            Ok(replay.boxed())
        }
    }
}

/// 收集所有补全记录
#[derive(Default)]
pub struct CollectingObserver {
    pub records: Mutex<Vec<CompletionRecord>>,
}

impl RequestObserver for CollectingObserver {
    fn on_completion(&self, record: &CompletionRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        listen_address: "127.0.0.1".to_string(),
        listen_port: 0,
        upstream_url: "http://127.0.0.1:9/agent".to_string(),
        api_key: Some("sk-test-token-123456".to_string()),
        api_key_env: None,
        models: vec!["agent-large".to_string()],
        image: ImageConfig {
            max_bytes: 1024 * 1024,
            fetch_timeout_secs: 2,
        },
        ..BridgeConfig::default()
    }
}

pub fn create_test_state(
    config: BridgeConfig,
    agent: Arc<ScriptedAgent>,
    observer: Arc<CollectingObserver>,
) -> ProxyState {
    let token = StaticTokenProvider::new(config.api_key.clone());
    let ingestor = ImageIngestor::from_config(&config.image).expect("build image client");
    ProxyState::new(config, agent, Arc::new(token), ingestor, observer)
}

/// 解析 SSE 正文中的 data 帧
pub fn sse_frames(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(|data| data.to_string())
        .collect()
}
