//! Anthropic Messages API

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CompletionRequest, LlmProvider, PromptMessage, ProviderKind};
use crate::models::Role;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<InputMessage>,
}

#[derive(Debug, Serialize)]
struct InputMessage {
    role: &'static str,
    content: Vec<Content>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Content {
    Text { text: String },
    Image { source: Base64Source },
    Document { source: Base64Source },
}

#[derive(Debug, Serialize)]
struct Base64Source {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// Anthropic 提供方
pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: String,
    api_base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, api_base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn convert_message(message: &PromptMessage) -> InputMessage {
        let mut content = Vec::with_capacity(2);

        // 附件放在文本之前
        if let Some(attachment) = &message.attachment {
            let source = Base64Source {
                kind: "base64",
                media_type: attachment.mime_type.clone(),
                data: attachment.data_base64.clone(),
            };
            content.push(if attachment.is_image() {
                Content::Image { source }
            } else {
                Content::Document { source }
            });
        }
        content.push(Content::Text {
            text: message.text.clone(),
        });

        InputMessage {
            role: match message.role {
                Role::Assistant => "assistant",
                _ => "user",
            },
            content,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        debug!("调用 Claude，模型: {}，消息数: {}", request.model, request.messages.len());

        let body = MessagesRequest {
            model: &request.model,
            max_tokens: MAX_TOKENS,
            system: request.system.as_deref(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
        };

        let response = self
            .http
            .post(format!("{}/v1/messages", self.api_base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!("Claude API 请求失败: {}", e);
                anyhow!("Claude API 请求失败: {}", e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Claude API 返回错误状态 {}: {}", status, text);
            return Err(anyhow!("Claude API 返回错误状态 {}: {}", status, text));
        }

        let parsed: MessagesResponse = response.json().await?;
        let content: String = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(text),
                ResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        debug!("Claude 返回 {} 字符", content.len());
        Ok(content)
    }
}
