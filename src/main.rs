use agent_bridge_lib::{logging, panic_hook, BridgeConfig, ProxyServer, ProxyState};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

/// OpenAI Chat Completions 兼容桥接服务
#[derive(Debug, Parser)]
#[command(name = "agent-bridge", version, about)]
struct Cli {
    /// 配置文件路径（默认 ~/.agent-bridge/config.toml）
    #[arg(short, long, env = "AGENT_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// 监听地址
    #[arg(long, env = "AGENT_BRIDGE_HOST")]
    host: Option<String>,

    /// 监听端口
    #[arg(short, long, env = "AGENT_BRIDGE_PORT")]
    port: Option<u16>,

    /// 上游 Agent 事件流端点
    #[arg(long, env = "AGENT_BRIDGE_UPSTREAM_URL")]
    upstream_url: Option<String>,

    /// 允许的模型（可重复），覆盖配置文件中的列表
    #[arg(long = "model")]
    models: Vec<String>,

    /// 默认日志级别（RUST_LOG 优先）
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(host) = &self.host {
            config.listen_address = host.clone();
        }
        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if let Some(url) = &self.upstream_url {
            config.upstream_url = url.clone();
        }
        if !self.models.is_empty() {
            config.models = self.models.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(cli.log_level.as_deref())?;
    panic_hook::setup_panic_hook();

    let mut config = BridgeConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    cli.apply(&mut config);
    config.validate()?;

    let state = ProxyState::from_config(config)?;
    let server = ProxyServer::new(state);
    let info = server.start().await?;
    log::info!("agent-bridge 已启动: http://{}:{}", info.address, info.port);

    tokio::signal::ctrl_c()
        .await
        .context("监听退出信号失败")?;
    log::info!("收到退出信号，正在停止...");

    server.stop().await?;
    Ok(())
}
