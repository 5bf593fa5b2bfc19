//! 渲染 - 基础设施层
//!
//! - `sketch` - 声明式图形描述（JSON）的光栅化，默认渲染器
//! - `sandbox` - 在受限子进程中执行绘图代码（内置函数白名单、资源上限、超时）
//! - `pdf` - 题目导出为 PDF（嵌入 TrueType 字体）
//!
//! 图形渲染器从不返回错误，失败通过 `RenderOutcome::Failed` 表达，
//! 由调用方决定是否继续。

pub mod pdf;
pub mod sandbox;
pub mod sketch;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::RenderError;

pub use pdf::{export_problem_pdf, load_font, EmbeddedFont, ExportDocument, PdfFont};
pub use sandbox::SandboxRenderer;
pub use sketch::SketchRenderer;

/// 渲染时可参考的上下文
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderContext {
    /// 日志中使用的标识，例如 "単題" 或 "パターンA"
    pub label: String,
    /// 对应的问题文（可能为空）
    pub problem_text: String,
}

impl RenderContext {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            problem_text: String::new(),
        }
    }

    pub fn with_problem_text(mut self, problem_text: impl Into<String>) -> Self {
        self.problem_text = problem_text.into();
        self
    }
}

/// 渲染结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// PNG 图片（base64）
    Rendered { image_base64: String },
    Failed { error: String },
}

impl RenderOutcome {
    pub fn image(&self) -> Option<&str> {
        match self {
            RenderOutcome::Rendered { image_base64 } => Some(image_base64),
            RenderOutcome::Failed { .. } => None,
        }
    }

    pub fn into_image(self) -> Option<String> {
        match self {
            RenderOutcome::Rendered { image_base64 } => Some(image_base64),
            RenderOutcome::Failed { .. } => None,
        }
    }
}

impl From<Result<String, RenderError>> for RenderOutcome {
    fn from(result: Result<String, RenderError>) -> Self {
        match result {
            Ok(image_base64) => RenderOutcome::Rendered { image_base64 },
            Err(e) => RenderOutcome::Failed {
                error: e.to_string(),
            },
        }
    }
}

/// 图形渲染器
#[async_trait]
pub trait FigureRenderer: Send + Sync {
    fn name(&self) -> &'static str;

    /// 根据提取出的代码渲染图片，失败时返回 `Failed`
    async fn render_from_code(&self, code: &str, context: &RenderContext) -> RenderOutcome;
}

/// 根据配置选择渲染器
pub fn from_config(config: &Config) -> Arc<dyn FigureRenderer> {
    match config.renderer.as_str() {
        "sandbox" => {
            info!(
                "🖼️  使用子进程渲染器: {} (超时 {} 秒)",
                config.sandbox_command, config.sandbox_timeout_secs
            );
            Arc::new(
                SandboxRenderer::new(
                    &config.sandbox_command,
                    Duration::from_secs(config.sandbox_timeout_secs),
                )
                .with_memory_limit(config.sandbox_memory_mb),
            )
        }
        "sketch" => Arc::new(SketchRenderer::default()),
        other => {
            warn!("⚠️  未知的渲染器 '{}'，使用 sketch", other);
            Arc::new(SketchRenderer::default())
        }
    }
}

/// PNG 字节编码为 base64
pub(crate) fn encode_png_base64(png: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(png)
}
