use serde::{Deserialize, Serialize};

/// 代理服务器状态
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyStatus {
    /// 是否运行中
    pub running: bool,
    /// 监听地址
    pub address: String,
    /// 监听端口
    pub port: u16,
    /// 活跃连接数（包括仍在输出的流式响应）
    pub active_connections: usize,
    /// 总请求数
    pub total_requests: u64,
    /// 成功请求数
    pub success_requests: u64,
    /// 失败请求数
    pub failed_requests: u64,
    /// 成功率 (0-100)
    pub success_rate: f32,
    /// 运行时间（秒）
    pub uptime_seconds: u64,
    /// 上游适配器名称
    pub upstream: String,
    /// 最后一次请求时间
    pub last_request_at: Option<String>,
    /// 最后一次错误信息
    pub last_error: Option<String>,
}

impl ProxyStatus {
    pub(crate) fn record_request(&mut self) {
        self.total_requests += 1;
        self.active_connections += 1;
        self.last_request_at = Some(chrono::Utc::now().to_rfc3339());
    }

    pub(crate) fn record_result(&mut self, error: Option<String>) {
        self.active_connections = self.active_connections.saturating_sub(1);
        match error {
            None => self.success_requests += 1,
            Some(message) => {
                self.failed_requests += 1;
                self.last_error = Some(message);
            }
        }
        let finished = self.success_requests + self.failed_requests;
        if finished > 0 {
            self.success_rate = (self.success_requests as f32 / finished as f32) * 100.0;
        }
    }
}

/// 代理服务器信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyServerInfo {
    pub address: String,
    pub port: u16,
    pub started_at: String,
}
