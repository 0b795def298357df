//! HTTP代理服务器
//!
//! 基于Axum的HTTP服务器，对外提供 OpenAI Chat Completions 兼容接口

use super::{
    handlers,
    http_client,
    image::ImageIngestor,
    log_codes::srv as log_srv,
    types::*,
    upstream::{HttpAgent, StaticTokenProvider, TokenProvider, UpstreamAgent},
    usage::{LogObserver, RequestObserver},
    ProxyError,
};
use crate::config::BridgeConfig;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// 代理服务器状态（共享）
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<BridgeConfig>,
    pub agent: Arc<dyn UpstreamAgent>,
    pub token_provider: Arc<dyn TokenProvider>,
    pub ingestor: ImageIngestor,
    pub observer: Arc<dyn RequestObserver>,
    pub status: Arc<RwLock<ProxyStatus>>,
    pub start_time: Arc<RwLock<Option<Instant>>>,
    /// 服务关闭时取消，所有进行中的流都派生自它
    pub shutdown: CancellationToken,
}

impl ProxyState {
    pub fn new(
        config: BridgeConfig,
        agent: Arc<dyn UpstreamAgent>,
        token_provider: Arc<dyn TokenProvider>,
        ingestor: ImageIngestor,
        observer: Arc<dyn RequestObserver>,
    ) -> Self {
        let status = ProxyStatus {
            address: config.listen_address.clone(),
            port: config.listen_port,
            upstream: agent.name().to_string(),
            ..ProxyStatus::default()
        };

        Self {
            config: Arc::new(config),
            agent,
            token_provider,
            ingestor,
            observer,
            status: Arc::new(RwLock::new(status)),
            start_time: Arc::new(RwLock::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    /// 按配置组装默认组件：HTTP 上游、静态凭证、日志观察者
    pub fn from_config(config: BridgeConfig) -> Result<Self, ProxyError> {
        let upstream_client =
            http_client::build_upstream_client(Duration::from_secs(config.request_timeout_secs))
                .map_err(|e| ProxyError::Internal(format!("Failed to build HTTP client: {e}")))?;
        let ingestor = ImageIngestor::from_config(&config.image)
            .map_err(|e| ProxyError::Internal(format!("Failed to build image client: {e}")))?;

        let agent = Arc::new(HttpAgent::new(upstream_client, config.upstream_url.clone()));
        let token_provider = Arc::new(StaticTokenProvider::from_config(&config));

        Ok(Self::new(
            config,
            agent,
            token_provider,
            ingestor,
            Arc::new(LogObserver),
        ))
    }
}

/// 构建路由
pub fn build_router(state: ProxyState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let max_body_bytes = state.config.max_body_bytes;

    Router::new()
        // 健康检查
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::get_status))
        // OpenAI Chat Completions API
        .route("/v1/chat/completions", post(handlers::handle_chat_completions))
        .route("/v1/models", get(handlers::list_models))
        // 以配置的上限替代 axum 默认的 2MB 限制，超限由处理器转换为 OpenAI 错误体
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .with_state(state)
}

struct RunningServer {
    shutdown_tx: oneshot::Sender<()>,
    streams: CancellationToken,
    task: JoinHandle<()>,
}

/// 代理HTTP服务器
pub struct ProxyServer {
    state: ProxyState,
    running: Arc<RwLock<Option<RunningServer>>>,
}

impl ProxyServer {
    pub fn new(state: ProxyState) -> Self {
        Self {
            state,
            running: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn start(&self) -> Result<ProxyServerInfo, ProxyError> {
        let mut running = self.running.write().await;
        if running.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }

        let config = &self.state.config;
        let addr: SocketAddr = format!("{}:{}", config.listen_address, config.listen_port)
            .parse()
            .map_err(|e| ProxyError::BindFailed(format!("无效的地址: {e}")))?;

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::BindFailed(e.to_string()))?;
        // 端口为 0 时以实际分配的端口为准
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::BindFailed(e.to_string()))?;

        // 每次启动使用新的取消令牌，停止后旧令牌保持已取消状态
        let mut state = self.state.clone();
        state.shutdown = CancellationToken::new();
        let streams = state.shutdown.clone();
        let app = build_router(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        {
            let mut status = self.state.status.write().await;
            status.running = true;
            status.address = local_addr.ip().to_string();
            status.port = local_addr.port();
        }
        *self.state.start_time.write().await = Some(Instant::now());

        log::info!("[{}] 代理服务器启动于 {local_addr}", log_srv::STARTED);

        let state = self.state.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
            {
                log::error!("[{}] 代理服务器异常退出: {e}", log_srv::TASK_ERROR);
            }

            state.status.write().await.running = false;
            *state.start_time.write().await = None;
        });

        *running = Some(RunningServer {
            shutdown_tx,
            streams,
            task,
        });

        Ok(ProxyServerInfo {
            address: local_addr.ip().to_string(),
            port: local_addr.port(),
            started_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// 停止服务
    ///
    /// 先取消所有进行中的流（它们会写出错误与 `[DONE]` 后结束），再等待连接排空。
    pub async fn stop(&self) -> Result<(), ProxyError> {
        let Some(server) = self.running.write().await.take() else {
            return Err(ProxyError::NotRunning);
        };

        server.streams.cancel();
        let _ = server.shutdown_tx.send(());

        match tokio::time::timeout(STOP_TIMEOUT, server.task).await {
            Ok(Ok(())) => {
                log::info!("[{}] 代理服务器已停止", log_srv::STOPPED);
                Ok(())
            }
            Ok(Err(e)) => {
                log::error!("[{}] 代理服务器任务失败: {e}", log_srv::TASK_ERROR);
                Err(ProxyError::Internal(e.to_string()))
            }
            Err(_) => {
                log::warn!("[{}] 等待代理服务器停止超时", log_srv::STOP_TIMEOUT);
                Err(ProxyError::StopTimeout)
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.read().await.is_some()
    }

    pub async fn get_status(&self) -> ProxyStatus {
        handlers::snapshot_status(&self.state).await
    }
}
