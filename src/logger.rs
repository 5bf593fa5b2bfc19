//! 日志初始化

use tracing_subscriber::EnvFilter;

/// 初始化全局日志（只需调用一次）
///
/// `RUST_LOG` 优先，否则使用传入的默认级别。日志写到 stderr，
/// stdout 只输出事件流。
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mongene={}", default_level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
