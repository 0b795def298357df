//! 代理服务器模块
//!
//! 提供本地 HTTP 服务，把 OpenAI Chat Completions 请求转换为上游 Agent 调用，
//! 再把上游事件流转换回 OpenAI 响应

pub mod error;
pub mod handler_context;
mod handlers;
pub mod http_client;
pub mod image;
pub mod log_codes;
pub mod models;
pub mod server;
pub mod transform;
pub mod types;
pub mod upstream;
pub mod usage;

pub use error::ProxyError;
pub use server::{build_router, ProxyServer, ProxyState};
pub use types::{ProxyServerInfo, ProxyStatus};
