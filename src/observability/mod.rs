//! 可观测性：tracing 订阅器初始化（默认 info，可通过 RUST_LOG 覆盖）

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init() {
    tracing_subscriber::registry()
        .with(default_filter())
        .with(fmt::layer())
        .init();
}

/// 日志写到 stderr：pipe 模式的服务端需要保持 stdout 只输出协议帧
pub fn init_stderr() {
    tracing_subscriber::registry()
        .with(default_filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
