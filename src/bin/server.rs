//! Hive 工具服务端
//!
//! 把本地工具注册表通过 pipe / socket / http 之一暴露出去：
//! ```bash
//! cargo run --bin hive-server              # 使用 [server].transport
//! cargo run --bin hive-server -- pipe      # 覆盖传输类型
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::config::{load_config, TransportKind};
use hive::core::{SessionCleanup, ShutdownCoordinator, ShutdownManager};
use hive::mcp::server::{serve_http, serve_socket, serve_stdio};
use hive::mcp::{SessionTable, ToolServer};
use hive::tools::{EchoTool, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("HIVE_CONFIG").ok().map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let transport = match std::env::args().nth(1) {
        Some(arg) => serde_json::from_value::<TransportKind>(serde_json::Value::String(arg.clone()))
            .with_context(|| format!("Unknown transport: {arg}"))?,
        None => cfg.server.transport,
    };

    // pipe 模式下 stdout 只输出协议帧
    if transport == TransportKind::Pipe {
        hive::observability::init_stderr();
    } else {
        hive::observability::init();
    }

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    let server = ToolServer::new(Arc::new(registry))
        .with_name(cfg.app.name.clone().unwrap_or_else(|| "hive".to_string()));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let sessions = Arc::new(SessionTable::from_config(&cfg.server));

    match transport {
        TransportKind::Pipe => {
            tokio::select! {
                result = serve_stdio(server) => result.context("pipe server failed")?,
                _ = shutdown.wait_for_shutdown() => {}
            }
        }
        TransportKind::Socket => {
            let listener = tokio::net::TcpListener::bind(&cfg.server.bind_addr)
                .await
                .with_context(|| format!("Failed to bind {}", cfg.server.bind_addr))?;
            serve_socket(server, listener, shutdown.token()).await;
        }
        TransportKind::Http => {
            serve_http(server, Arc::clone(&sessions), &cfg.server, shutdown.token())
                .await
                .context("http server failed")?;
        }
    }

    let mut coordinator = ShutdownCoordinator::new(shutdown);
    coordinator.register(SessionCleanup::new(sessions));
    coordinator.run_cleanup().await;
    Ok(())
}
