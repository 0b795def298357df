//! 日志初始化
//!
//! 代码中统一使用 `log` 宏；这里安装 tracing-subscriber 作为输出端，
//! 它会同时桥接 `log` 记录。级别由 `RUST_LOG` 控制，默认 `info`。

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info,hyper_util=off";

/// `RUST_LOG` 优先，否则使用 `default_level`（为空时用内置默认值）
pub fn build_filter(default_level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            default_level
                .filter(|level| !level.trim().is_empty())
                .unwrap_or(DEFAULT_FILTER),
        )
    })
}

/// 安装全局日志输出（stderr），重复调用时返回错误而不 panic
pub fn init(default_level: Option<&str>) -> anyhow::Result<()> {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(build_filter(default_level));

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("日志初始化失败: {e}"))
}
