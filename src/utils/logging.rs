//! 日志工具模块
//!
//! 提供日志格式化和输出的辅助函数

use tracing::info;

use crate::config::Config;

/// 记录程序启动信息
pub fn log_startup(config: &Config, providers: &[&str]) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 环境: {}", config.env);
    info!("🤖 可用提供方: {}", providers.join(", "));
    info!(
        "📌 默认模型: {} / {}",
        config.default_ai_provider, config.default_ai_model
    );
    info!("{}", "=".repeat(60));
}

/// 记录生成开始
///
/// # 参数
/// - `label`: 运行标识（单题 / 三题）
/// - `user_id`: 用户 ID
/// - `total_stages`: 阶段总数
pub fn log_run_start(label: &str, user_id: &str, total_stages: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始{} (用户: {}, 共 {} 个阶段)", label, user_id, total_stages);
    info!("{}", "=".repeat(60));
}

/// 记录生成结束
pub fn log_run_complete(label: &str, saved: usize, failed_patterns: usize) {
    info!("\n{}", "─".repeat(60));
    info!(
        "✓ {}结束: 保存 {} 道题目, 失败 {} 个模式",
        label, saved, failed_patterns
    );
    info!("{}", "─".repeat(60));
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度（按字符计）
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

/// 按字符截取前缀（不加省略号），用于事件中的摘录
pub fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
