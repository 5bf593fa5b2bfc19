//! 模型提供方 - 基础设施层
//!
//! 每个提供方只负责"把一次请求发给自己的后端并返回文本"，
//! 不关心对话历史的来源，也不吞掉错误；错误转换由 `LlmService` 负责。
//!
//! - `openai` - OpenAI 兼容接口（`async-openai`）
//! - `anthropic` - Anthropic Messages API（`reqwest`）
//! - `gemini` - Google Gemini generateContent（`reqwest`）

pub mod aliases;
pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod registry;

use async_trait::async_trait;

use crate::models::Role;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use registry::ProviderRegistry;

/// 提供方种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Claude,
    Gemini,
}

impl ProviderKind {
    /// 注册顺序，也是兜底选择的顺序
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::OpenAi,
        ProviderKind::Claude,
        ProviderKind::Gemini,
    ];

    /// 解析提供方名称
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "openai" | "gpt" => Some(ProviderKind::OpenAi),
            "claude" | "anthropic" => Some(ProviderKind::Claude),
            "gemini" | "google" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Claude => "claude",
            ProviderKind::Gemini => "gemini",
        }
    }

    /// 未指定模型时使用的模型
    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o",
            ProviderKind::Claude => "claude-sonnet-4-20250514",
            ProviderKind::Gemini => "gemini-2.5-flash",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// 随消息发送的附件（图片或 PDF），数据为 base64
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub mime_type: String,
    pub data_base64: String,
}

impl Attachment {
    pub fn png(data_base64: impl Into<String>) -> Self {
        Self {
            mime_type: "image/png".to_string(),
            data_base64: data_base64.into(),
        }
    }

    pub fn pdf(data_base64: impl Into<String>) -> Self {
        Self {
            mime_type: "application/pdf".to_string(),
            data_base64: data_base64.into(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// 发往提供方的一条消息（角色只会是 User 或 Assistant）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: Role,
    pub text: String,
    pub attachment: Option<Attachment>,
}

impl PromptMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            attachment: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// 一次补全请求，`model` 已经过别名解析
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<PromptMessage>,
}

/// 模型提供方
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// 发送请求并返回文本，失败时返回错误
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String>;
}
