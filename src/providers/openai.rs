//! OpenAI 兼容接口
//!
//! 使用 `async-openai` 调用 Chat Completions，
//! 也可以通过 `openai_api_base_url` 指向任何兼容的服务。

use anyhow::{bail, Result};
use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestMessageContentPartImage, ChatCompletionRequestMessageContentPartText,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, ImageDetail, ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{CompletionRequest, LlmProvider, PromptMessage, ProviderKind};
use crate::models::Role;

/// OpenAI 提供方
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, api_base_url: &str) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base_url);

        Self {
            client: Client::with_config(openai_config),
        }
    }

    /// 把一条消息转换为 Chat Completions 的消息
    fn convert_message(message: &PromptMessage) -> Result<ChatCompletionRequestMessage> {
        match message.role {
            Role::Assistant => {
                let msg = ChatCompletionRequestAssistantMessageArgs::default()
                    .content(message.text.as_str())
                    .build()?;
                Ok(ChatCompletionRequestMessage::Assistant(msg))
            }
            Role::User => {
                let user_msg = match &message.attachment {
                    Some(attachment) if attachment.is_image() => {
                        let content_parts = vec![
                            ChatCompletionRequestUserMessageContentPart::Text(
                                ChatCompletionRequestMessageContentPartText {
                                    text: message.text.clone(),
                                },
                            ),
                            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                                ChatCompletionRequestMessageContentPartImage {
                                    image_url: ImageUrl {
                                        url: format!(
                                            "data:{};base64,{}",
                                            attachment.mime_type, attachment.data_base64
                                        ),
                                        detail: Some(ImageDetail::Auto),
                                    },
                                },
                            ),
                        ];
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
                            .build()?
                    }
                    Some(attachment) => {
                        bail!("OpenAI 接口不支持附件类型 {}", attachment.mime_type)
                    }
                    None => ChatCompletionRequestUserMessageArgs::default()
                        .content(message.text.as_str())
                        .build()?,
                };
                Ok(ChatCompletionRequestMessage::User(user_msg))
            }
            Role::System => {
                let msg = ChatCompletionRequestSystemMessageArgs::default()
                    .content(message.text.as_str())
                    .build()?;
                Ok(ChatCompletionRequestMessage::System(msg))
            }
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        debug!("调用 OpenAI，模型: {}，消息数: {}", request.model, request.messages.len());

        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if let Some(system) = &request.system {
            let system_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(system.as_str())
                .build()?;
            messages.push(ChatCompletionRequestMessage::System(system_msg));
        }

        for message in &request.messages {
            messages.push(Self::convert_message(message)?);
        }

        let api_request = CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .messages(messages)
            .build()?;

        let response = self.client.chat().create(api_request).await.map_err(|e| {
            warn!("OpenAI API 调用失败: {}", e);
            anyhow::anyhow!("OpenAI API 调用失败: {}", e)
        })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        debug!("OpenAI 返回 {} 字符", content.len());
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Attachment;

    #[test]
    fn test_pdf_attachment_is_rejected() {
        let message =
            PromptMessage::user("読んでください").with_attachment(Attachment::pdf("JVBERi0="));
        assert!(OpenAiProvider::convert_message(&message).is_err());
    }

    #[test]
    fn test_image_attachment_becomes_content_parts() {
        let message = PromptMessage::user("図を見て").with_attachment(Attachment::png("iVBORw0="));
        let converted = OpenAiProvider::convert_message(&message).unwrap();
        match converted {
            ChatCompletionRequestMessage::User(user) => {
                assert!(matches!(
                    user.content,
                    ChatCompletionRequestUserMessageContent::Array(ref parts) if parts.len() == 2
                ));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
