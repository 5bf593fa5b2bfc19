//! LLM 服务 - 业务能力层
//!
//! 在提供方之上统一"单轮 / 带历史 / 图片 / 文档"四种调用方式，
//! 负责别名解析、角色过滤和错误转换，不关心流程。
//!
//! ## 两类接口
//! - `generate_*`：失败时记录日志并返回空字符串，供一次性调用使用
//! - `try_*`：失败时返回 `ProviderError`，供编排层中止流程

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::models::{ChatTurn, Role};
use crate::providers::{
    aliases, Attachment, CompletionRequest, LlmProvider, PromptMessage, ProviderKind,
};

/// LLM 服务
///
/// 职责：
/// - 绑定一个提供方和一个模型
/// - 把对话历史转换为提供方能接受的消息
/// - 把后端失败转换为空结果或类型化错误
#[derive(Clone)]
pub struct LlmService {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl LlmService {
    /// 创建新的 LLM 服务
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// 调用方给出的模型名（可能是别名）
    pub fn model(&self) -> &str {
        &self.model
    }

    /// 发往后端的真实模型 ID
    pub fn backend_model(&self) -> &str {
        aliases::resolve_model(self.provider.kind(), &self.model)
    }

    /// 单轮调用
    ///
    /// # 参数
    /// - `prompt`: 用户消息
    /// - `system`: 系统提示词（可选）
    ///
    /// # 返回
    /// 模型的回复；失败时返回空字符串
    pub async fn generate_content(&self, prompt: &str, system: Option<&str>) -> String {
        let request = self.request(system.map(str::to_string), vec![PromptMessage::user(prompt)]);
        self.swallow(self.try_complete(request).await)
    }

    /// 带历史的调用，失败时返回空字符串
    pub async fn generate_with_history(&self, turns: &[ChatTurn], system: Option<&str>) -> String {
        self.swallow(self.try_generate_with_history(turns, system).await)
    }

    /// 带历史的调用，失败时返回错误
    ///
    /// 未知角色的轮次会被丢弃，`system` 角色的轮次并入系统提示词；
    /// 过滤后没有用户消息时直接返回 `NoUserTurns`，不访问后端。
    ///
    /// # 参数
    /// - `turns`: 按时间顺序的对话历史，最后一轮通常是本次的用户消息
    /// - `system`: 系统提示词（可选）
    pub async fn try_generate_with_history(
        &self,
        turns: &[ChatTurn],
        system: Option<&str>,
    ) -> Result<String, ProviderError> {
        let (system, messages) = prepare_history(turns, system);
        if !messages.iter().any(|m| m.role == Role::User) {
            debug!("对话中没有用户消息，跳过调用");
            return Err(ProviderError::NoUserTurns);
        }
        self.try_complete(self.request(system, messages)).await
    }

    /// 图片 + 文本的单轮调用，失败时返回空字符串
    ///
    /// # 参数
    /// - `prompt`: 用户消息
    /// - `image_base64`: PNG 图片（base64）
    pub async fn generate_multimodal(&self, prompt: &str, image_base64: &str) -> String {
        let message = PromptMessage::user(prompt).with_attachment(Attachment::png(image_base64));
        self.swallow(self.try_complete(self.request(None, vec![message])).await)
    }

    /// PDF + 文本的单轮调用，失败时返回空字符串
    pub async fn generate_with_document(&self, prompt: &str, pdf_base64: &str) -> String {
        self.swallow(self.try_generate_with_document(prompt, pdf_base64).await)
    }

    /// PDF + 文本的单轮调用，失败时返回错误
    ///
    /// OpenAI 兼容接口不接受 PDF，直接返回 `Unsupported`。
    pub async fn try_generate_with_document(
        &self,
        prompt: &str,
        pdf_base64: &str,
    ) -> Result<String, ProviderError> {
        if self.provider.kind() == ProviderKind::OpenAi {
            return Err(ProviderError::Unsupported {
                provider: self.provider.kind().to_string(),
                capability: "PDF 文档输入",
            });
        }
        let message = PromptMessage::user(prompt).with_attachment(Attachment::pdf(pdf_base64));
        self.try_complete(self.request(None, vec![message])).await
    }

    fn request(&self, system: Option<String>, messages: Vec<PromptMessage>) -> CompletionRequest {
        CompletionRequest {
            model: self.backend_model().to_string(),
            system,
            messages,
        }
    }

    async fn try_complete(&self, request: CompletionRequest) -> Result<String, ProviderError> {
        let provider = self.provider.kind().to_string();
        let content = self
            .provider
            .complete(&request)
            .await
            .map_err(|source| ProviderError::api_call_failed(&provider, &request.model, source))?;

        let content = content.trim();
        if content.is_empty() {
            return Err(ProviderError::EmptyContent {
                provider,
                model: request.model,
            });
        }
        Ok(content.to_string())
    }

    fn swallow(&self, result: Result<String, ProviderError>) -> String {
        match result {
            Ok(content) => content,
            Err(ProviderError::NoUserTurns) => String::new(),
            Err(e) => {
                warn!("⚠️  {} 调用失败，返回空结果: {}", self.provider.kind(), e);
                String::new()
            }
        }
    }
}

/// 过滤历史：丢弃未知角色，system 轮次并入系统提示词
fn prepare_history(
    turns: &[ChatTurn],
    system: Option<&str>,
) -> (Option<String>, Vec<PromptMessage>) {
    let mut system_parts: Vec<String> = system
        .filter(|s| !s.trim().is_empty())
        .map(|s| vec![s.to_string()])
        .unwrap_or_default();
    let mut messages = Vec::with_capacity(turns.len());

    for turn in turns {
        match turn.role() {
            Some(Role::User) => messages.push(PromptMessage::user(turn.content.as_str())),
            Some(Role::Assistant) => messages.push(PromptMessage::assistant(turn.content.as_str())),
            Some(Role::System) => system_parts.push(turn.content.clone()),
            None => debug!("丢弃未知角色的消息: {}", turn.role),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, messages)
}
