//! 代理模块日志错误码定义
//!
//! 格式: [模块-编号] 消息
//! - SRV: Server (服务器)
//! - REQ: Request (请求校验与转换)
//! - IMG: Image (图片摄取)
//! - UPS: Upstream (上游调用)
//! - SSE: Stream (流式输出)

/// 服务器日志码
pub mod srv {
    pub const STARTED: &str = "SRV-001";
    pub const STOPPED: &str = "SRV-002";
    pub const STOP_TIMEOUT: &str = "SRV-003";
    pub const TASK_ERROR: &str = "SRV-004";
}

/// 请求日志码
pub mod req {
    pub const INVALID_BODY: &str = "REQ-001";
    pub const MODEL_NOT_FOUND: &str = "REQ-002";
    pub const TRANSLATE_FAILED: &str = "REQ-003";
}

/// 图片日志码
pub mod img {
    pub const REJECTED: &str = "IMG-001";
}

/// 上游日志码
pub mod ups {
    pub const AUTH_MISSING: &str = "UPS-001";
    pub const CALL_FAILED: &str = "UPS-002";
    pub const NO_TERMINAL_MESSAGE: &str = "UPS-003";
}

/// 流式输出日志码
pub mod sse {
    pub const UPSTREAM_ERROR: &str = "SSE-001";
    pub const ITERATION_FAILED: &str = "SSE-002";
    pub const MISSING_DONE: &str = "SSE-003";
    pub const CLIENT_DISCONNECTED: &str = "SSE-004";
}
