//! 提供方注册表
//!
//! 根据调用方的 `ModelChoice` 选出提供方和模型，
//! 选择顺序：指定的提供方 → 默认提供方 → 按 openai、claude、gemini 顺序第一个可用的。

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{AnthropicProvider, GeminiProvider, LlmProvider, OpenAiProvider, ProviderKind};
use crate::config::Config;
use crate::error::ProviderError;
use crate::models::ModelChoice;
use crate::services::LlmService;

/// 提供方注册表
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn LlmProvider>>,
    default_provider: String,
    default_model: String,
}

impl ProviderRegistry {
    /// 创建空注册表
    pub fn new(default_provider: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            providers: Vec::new(),
            default_provider: default_provider.into(),
            default_model: default_model.into(),
        }
    }

    /// 根据配置注册所有填写了 API Key 的提供方
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new(&config.default_ai_provider, &config.default_ai_model);

        if !config.openai_api_key.is_empty() {
            registry = registry.register(Arc::new(OpenAiProvider::new(
                &config.openai_api_key,
                &config.openai_api_base_url,
            )));
        }
        if !config.anthropic_api_key.is_empty() {
            registry = registry.register(Arc::new(AnthropicProvider::new(
                &config.anthropic_api_key,
                &config.anthropic_api_base_url,
            )));
        }
        if !config.google_api_key.is_empty() {
            registry = registry.register(Arc::new(GeminiProvider::new(
                &config.google_api_key,
                &config.gemini_api_base_url,
            )));
        }

        if registry.providers.is_empty() {
            warn!("⚠️  未配置任何 AI 提供方的 API Key，生成类命令将无法使用");
        } else {
            info!("🔌 已注册提供方: {}", registry.available().join(", "));
        }
        registry
    }

    /// 注册提供方，同种类的会被替换
    pub fn register(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.retain(|p| p.kind() != provider.kind());
        self.providers.push(provider);
        self
    }

    /// 已注册的提供方名称（按兜底顺序）
    pub fn available(&self) -> Vec<&'static str> {
        ProviderKind::ALL
            .iter()
            .filter(|kind| self.find(**kind).is_some())
            .map(|kind| kind.name())
            .collect()
    }

    fn find(&self, kind: ProviderKind) -> Option<&Arc<dyn LlmProvider>> {
        self.providers.iter().find(|p| p.kind() == kind)
    }

    /// 选出提供方并返回绑定了模型的 `LlmService`
    ///
    /// # 参数
    /// - `choice`: 调用方指定的提供方与模型（均可省略）
    ///
    /// # 返回
    /// 没有任何可用提供方时返回 `ProviderError::NoProviderConfigured`
    pub fn resolve(&self, choice: &ModelChoice) -> Result<LlmService, ProviderError> {
        let requested = choice
            .api
            .as_deref()
            .and_then(ProviderKind::parse)
            .and_then(|kind| self.find(kind));
        let default = ProviderKind::parse(&self.default_provider).and_then(|kind| self.find(kind));

        let provider = requested
            .or(default)
            .or_else(|| ProviderKind::ALL.iter().find_map(|kind| self.find(*kind)))
            .ok_or(ProviderError::NoProviderConfigured)?;

        let kind = provider.kind();
        if let Some(api) = &choice.api {
            if ProviderKind::parse(api) != Some(kind) {
                warn!("⚠️  提供方 {} 不可用，改用 {}", api, kind);
            }
        }

        // 只有落在默认提供方上时才使用默认模型
        let requested_kind = ProviderKind::parse(choice.api.as_deref().unwrap_or(kind.name()));
        let model = match &choice.model {
            Some(model) if requested_kind == Some(kind) => model.clone(),
            _ if ProviderKind::parse(&self.default_provider) == Some(kind) => {
                self.default_model.clone()
            }
            _ => kind.default_model().to_string(),
        };

        debug!("选择提供方 {}，模型 {}", kind, model);
        Ok(LlmService::new(Arc::clone(provider), model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::CompletionRequest;
    use async_trait::async_trait;

    struct Fixed(ProviderKind);

    #[async_trait]
    impl LlmProvider for Fixed {
        fn kind(&self) -> ProviderKind {
            self.0
        }

        async fn complete(&self, _request: &CompletionRequest) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    fn choice(api: Option<&str>, model: Option<&str>) -> ModelChoice {
        ModelChoice {
            api: api.map(str::to_string),
            model: model.map(str::to_string),
        }
    }

    #[test]
    fn test_empty_registry_has_no_provider() {
        let registry = ProviderRegistry::new("gemini", "gemini-2.5-flash");
        assert!(matches!(
            registry.resolve(&ModelChoice::default()),
            Err(ProviderError::NoProviderConfigured)
        ));
    }

    #[test]
    fn test_requested_provider_and_model_win() {
        let registry = ProviderRegistry::new("gemini", "gemini-2.5-pro")
            .register(Arc::new(Fixed(ProviderKind::Gemini)))
            .register(Arc::new(Fixed(ProviderKind::Claude)));

        let service = registry.resolve(&choice(Some("claude"), Some("claude-opus"))).unwrap();
        assert_eq!(service.provider_kind(), ProviderKind::Claude);
        assert_eq!(service.model(), "claude-opus");
    }

    #[test]
    fn test_default_model_only_for_default_provider() {
        let registry = ProviderRegistry::new("gemini", "gemini-2.5-pro")
            .register(Arc::new(Fixed(ProviderKind::Gemini)))
            .register(Arc::new(Fixed(ProviderKind::OpenAi)));

        let service = registry.resolve(&ModelChoice::default()).unwrap();
        assert_eq!(service.provider_kind(), ProviderKind::Gemini);
        assert_eq!(service.model(), "gemini-2.5-pro");

        let service = registry.resolve(&choice(Some("openai"), None)).unwrap();
        assert_eq!(service.model(), "gpt-4o");
    }

    #[test]
    fn test_unavailable_provider_falls_back_in_order() {
        let registry = ProviderRegistry::new("gemini", "gemini-2.5-pro")
            .register(Arc::new(Fixed(ProviderKind::Claude)))
            .register(Arc::new(Fixed(ProviderKind::OpenAi)));

        assert_eq!(registry.available(), vec!["openai", "claude"]);

        // 请求的模型属于不可用的提供方，不能原样带过去
        let service = registry.resolve(&choice(Some("gemini"), Some("gemini-flash"))).unwrap();
        assert_eq!(service.provider_kind(), ProviderKind::OpenAi);
        assert_eq!(service.model(), "gpt-4o");
    }
}
