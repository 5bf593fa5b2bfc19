//! Google Gemini generateContent API

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CompletionRequest, LlmProvider, PromptMessage, ProviderKind};
use crate::models::Role;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum Part {
    Text(String),
    InlineData(InlineData),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

/// Gemini 提供方
pub struct GeminiProvider {
    http: reqwest::Client,
    api_key: String,
    api_base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: &str, api_base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn convert_message(message: &PromptMessage) -> Content {
        let mut parts = Vec::with_capacity(2);
        if let Some(attachment) = &message.attachment {
            parts.push(Part::InlineData(InlineData {
                mime_type: attachment.mime_type.clone(),
                data: attachment.data_base64.clone(),
            }));
        }
        parts.push(Part::Text(message.text.clone()));

        Content {
            role: match message.role {
                Role::Assistant => "model",
                _ => "user",
            },
            parts,
        }
    }

    fn build_request(request: &CompletionRequest) -> GenerateRequest {
        GenerateRequest {
            contents: request.messages.iter().map(Self::convert_message).collect(),
            system_instruction: request.system.as_ref().map(|system| SystemInstruction {
                parts: vec![Part::Text(system.clone())],
            }),
        }
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        debug!("调用 Gemini，模型: {}，消息数: {}", request.model, request.messages.len());

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.api_base_url, request.model
        );

        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::build_request(request))
            .send()
            .await
            .map_err(|e| {
                warn!("Gemini API 请求失败: {}", e);
                anyhow!("Gemini API 请求失败: {}", e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Gemini API 返回错误状态 {}: {}", status, text);
            return Err(anyhow!("Gemini API 返回错误状态 {}: {}", status, text));
        }

        let parsed: GenerateResponse = response.json().await?;
        let content = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter(|part| !part.thought)
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        debug!("Gemini 返回 {} 字符", content.len());
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Attachment;

    #[test]
    fn test_request_wire_format() {
        let request = CompletionRequest {
            model: "gemini-2.5-flash".to_string(),
            system: Some("数学の先生".to_string()),
            messages: vec![
                PromptMessage::user("問題を作って").with_attachment(Attachment::pdf("JVBERi0=")),
                PromptMessage::assistant("はい"),
            ],
        };
        let value = serde_json::to_value(GeminiProvider::build_request(&request)).unwrap();
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "数学の先生");
        assert_eq!(value["contents"][0]["role"], "user");
        assert_eq!(value["contents"][0]["parts"][0]["inlineData"]["mimeType"], "application/pdf");
        assert_eq!(value["contents"][0]["parts"][1]["text"], "問題を作って");
        assert_eq!(value["contents"][1]["role"], "model");
    }

    #[test]
    fn test_thought_parts_are_skipped() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"考え中","thought":true},{"text":"答え"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let parts = &parsed.candidates[0].content.as_ref().unwrap().parts;
        assert!(parts[0].thought);
        assert!(!parts[1].thought);
    }
}
