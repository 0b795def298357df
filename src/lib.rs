//! agent-bridge
//!
//! 在上游 Agent 事件流接口之前提供 OpenAI Chat Completions 兼容的 HTTP 服务。

pub mod config;
pub mod logging;
pub mod panic_hook;
pub mod proxy;

pub use config::{BridgeConfig, ConfigError, ImageConfig};
pub use proxy::{build_router, ProxyError, ProxyServer, ProxyServerInfo, ProxyState, ProxyStatus};
