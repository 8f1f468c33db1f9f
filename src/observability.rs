//! 可观测性

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化结构化日志；RUST_LOG 可覆盖默认的 info 级别
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
