use serde::{Deserialize, Serialize};

/// 模型选择（未指定时使用配置中的默认值）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelChoice {
    /// 提供方名称：openai / claude / gemini
    pub api: Option<String>,
    /// 模型名称，可以是别名
    pub model: Option<String>,
}

/// 五阶段单题生成请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// 用户的自由描述
    pub prompt: String,
    pub subject: String,
    #[serde(default)]
    pub units: Vec<String>,
    #[serde(default)]
    pub excluded_units: Vec<String>,
    #[serde(default)]
    pub choice: ModelChoice,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            subject: "math".to_string(),
            units: Vec::new(),
            excluded_units: Vec::new(),
            choice: ModelChoice::default(),
        }
    }
}

/// 三题（A/B/C 三种模式）生成请求
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripleRequest {
    /// 原题 PDF（base64），先转写为文字再作为出题依据
    #[serde(default)]
    pub problem_documents: Vec<String>,
    #[serde(default)]
    pub excluded_units: Vec<String>,
    #[serde(default)]
    pub choice: ModelChoice,
}

/// 一次性生成请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickRequest {
    pub prompt: String,
    pub subject: String,
    #[serde(default)]
    pub units: Vec<String>,
    #[serde(default)]
    pub excluded_units: Vec<String>,
    pub difficulty: Option<String>,
    #[serde(default)]
    pub choice: ModelChoice,
}
