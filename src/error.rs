use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 模型提供方错误
    #[error("模型错误: {0}")]
    Provider(#[from] ProviderError),
    /// 图形渲染错误
    #[error("渲染错误: {0}")]
    Render(#[from] RenderError),
    /// 持久化错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 模板错误
    #[error("模板错误: {0}")]
    Template(#[from] TemplateError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 文档导出错误
    #[error("导出错误: {0}")]
    Export(#[from] ExportError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 模型提供方错误
#[derive(Debug, Error)]
pub enum ProviderError {
    /// 没有任何可用的提供方
    #[error("没有配置任何 AI 提供方")]
    NoProviderConfigured,
    /// API 调用失败
    #[error("API 调用失败 (提供方: {provider}, 模型: {model}): {source}")]
    ApiCallFailed {
        provider: String,
        model: String,
        #[source]
        source: anyhow::Error,
    },
    /// 返回内容为空
    #[error("返回内容为空 (提供方: {provider}, 模型: {model})")]
    EmptyContent { provider: String, model: String },
    /// 过滤后没有用户消息
    #[error("对话中没有有效的用户消息")]
    NoUserTurns,
    /// 提供方不支持该输入
    #[error("提供方 {provider} 不支持 {capability}")]
    Unsupported {
        provider: String,
        capability: &'static str,
    },
}

/// 图形渲染错误
#[derive(Debug, Error)]
pub enum RenderError {
    /// 图形描述解析失败
    #[error("图形描述解析失败: {0}")]
    InvalidSketch(String),
    /// 图形为空
    #[error("图形中没有可绘制的元素")]
    EmptyFigure,
    /// 引用了未定义的点
    #[error("未定义的点: {0}")]
    UnknownPoint(String),
    /// 代码中出现了不允许的名称
    #[error("绘图代码包含不允许的名称: {0}")]
    ForbiddenName(String),
    /// 子进程执行失败
    #[error("渲染进程失败: {0}")]
    SandboxFailed(String),
    /// 执行超时
    #[error("渲染超时 ({0} 秒)")]
    Timeout(u64),
    /// 图片编码失败
    #[error("图片编码失败: {0}")]
    Encode(String),
}

/// 持久化错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 读取存储文件失败
    #[error("读取存储失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 写入存储文件失败
    #[error("写入存储失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 存储内容损坏
    #[error("存储内容解析失败 ({path}): {source}")]
    Corrupted {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// 模板错误
#[derive(Debug, Error)]
pub enum TemplateError {
    /// 模板文件不存在
    #[error("模板文件不存在: {0}")]
    NotFound(String),
    /// 读取模板失败
    #[error("读取模板失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置文件读取失败
    #[error("配置文件读取失败 ({path}): {source}")]
    FileReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 配置文件解析失败
    #[error("配置文件解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// 文档导出错误
#[derive(Debug, Error)]
pub enum ExportError {
    /// 图片解码失败
    #[error("图片解码失败: {0}")]
    ImageDecode(String),
    /// 字体无法使用
    #[error("字体无效: {0}")]
    Font(String),
    /// PDF 生成失败
    #[error("PDF 生成失败: {0}")]
    Pdf(String),
}

/// 生成流程中的失败原因
///
/// 只在编排层内部流转，最终转换为 `error` 事件
#[derive(Debug, Error)]
pub enum RunError {
    /// 某个阶段的模型调用失败
    #[error("阶段 {stage} 失败: {source}")]
    StageFailed {
        stage: usize,
        #[source]
        source: ProviderError,
    },
    /// 持久化失败
    #[error("保存失败: {0}")]
    PersistFailed(#[source] StoreError),
    /// 调用方取消
    #[error("生成已取消")]
    Cancelled,
}

// ========== 从常见错误类型转换 ==========

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Other(format!("JSON 解析失败: {}", err))
    }
}

// ========== 便捷构造函数 ==========

impl ProviderError {
    /// 创建 API 调用失败错误
    pub fn api_call_failed(
        provider: impl Into<String>,
        model: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        ProviderError::ApiCallFailed {
            provider: provider.into(),
            model: model.into(),
            source: source.into(),
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_nests_source_message() {
        let err = AppError::from(ProviderError::EmptyContent {
            provider: "gemini".to_string(),
            model: "gemini-2.5-flash".to_string(),
        });
        let text = err.to_string();
        assert!(text.starts_with("模型错误"));
        assert!(text.contains("gemini-2.5-flash"));
    }

    #[test]
    fn test_api_call_failed_keeps_source() {
        let err = ProviderError::api_call_failed(
            "claude",
            "claude-sonnet-4-20250514",
            anyhow::anyhow!("429"),
        );
        assert!(err.to_string().contains("429"));
        assert!(AppError::from(err).to_string().starts_with("模型错误"));
    }
}
