use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{AppResult, ConfigError};

/// 程序配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 运行环境（local / production）
    pub env: String,
    /// 默认日志级别（RUST_LOG 优先）
    pub log_level: String,
    // --- AI 提供方 ---
    pub openai_api_key: String,
    pub openai_api_base_url: String,
    pub anthropic_api_key: String,
    pub anthropic_api_base_url: String,
    pub google_api_key: String,
    pub gemini_api_base_url: String,
    /// 默认提供方：openai / claude / gemini
    pub default_ai_provider: String,
    /// 默认模型
    pub default_ai_model: String,
    // --- 模板与参考样题 ---
    pub prompts_dir: PathBuf,
    pub samples_dir: PathBuf,
    /// 注入到首轮提示词中的参考样题数量
    pub reference_sample_limit: usize,
    /// stage_complete 事件中回显的字符数
    pub excerpt_chars: usize,
    // --- 存储 ---
    /// JSON 存储文件，为空时使用内存存储
    pub store_file: Option<PathBuf>,
    // --- 图形渲染 ---
    /// sketch（声明式）或 sandbox（子进程）
    pub renderer: String,
    /// sandbox 模式下的解释器命令
    pub sandbox_command: String,
    pub sandbox_timeout_secs: u64,
    /// sandbox 子进程的地址空间上限（MB），CPU 时间上限与超时相同
    pub sandbox_memory_mb: u64,
    // --- PDF 导出 ---
    /// 嵌入 PDF 的 TrueType 字体（需要覆盖日文），都不可用时退回 Helvetica
    pub pdf_font_paths: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: "local".to_string(),
            log_level: "info".to_string(),
            openai_api_key: String::new(),
            openai_api_base_url: "https://api.openai.com/v1".to_string(),
            anthropic_api_key: String::new(),
            anthropic_api_base_url: "https://api.anthropic.com".to_string(),
            google_api_key: String::new(),
            gemini_api_base_url: "https://generativelanguage.googleapis.com".to_string(),
            default_ai_provider: "gemini".to_string(),
            default_ai_model: "gemini-2.5-flash".to_string(),
            prompts_dir: PathBuf::from("prompts"),
            samples_dir: PathBuf::from("data"),
            reference_sample_limit: 3,
            excerpt_chars: 500,
            store_file: Some(PathBuf::from("mongene_store.json")),
            renderer: "sketch".to_string(),
            sandbox_command: "python3".to_string(),
            sandbox_timeout_secs: 20,
            sandbox_memory_mb: 512,
            pdf_font_paths: vec![
                PathBuf::from("/usr/share/fonts/opentype/ipafont-gothic/ipag.ttf"),
                PathBuf::from("/usr/share/fonts/truetype/fonts-japanese-gothic.ttf"),
                PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"),
            ],
        }
    }
}

impl Config {
    /// 读取配置：可选的 TOML 文件，再叠加环境变量
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let base = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        base.with_env_overrides()
    }

    /// 从 TOML 文件读取，未出现的字段使用默认值
    pub fn from_toml_file(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::TomlParseFailed {
            path: path.display().to_string(),
            source,
        })?;
        Ok(config)
    }

    /// 只从环境变量读取
    pub fn from_env() -> AppResult<Self> {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(self) -> AppResult<Self> {
        let store_file = match std::env::var("STORE_FILE") {
            Ok(v) if v.is_empty() => None,
            Ok(v) => Some(PathBuf::from(v)),
            Err(_) => self.store_file,
        };
        // 逗号分隔的字体路径列表
        let pdf_font_paths = match std::env::var("PDF_FONT_PATHS") {
            Ok(v) => v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect(),
            Err(_) => self.pdf_font_paths,
        };

        Ok(Self {
            env: std::env::var("ENV").unwrap_or(self.env),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(self.log_level),
            openai_api_key: std::env::var("OPENAI_API_KEY").unwrap_or(self.openai_api_key),
            openai_api_base_url: std::env::var("OPENAI_API_BASE_URL")
                .unwrap_or(self.openai_api_base_url),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or(self.anthropic_api_key),
            anthropic_api_base_url: std::env::var("ANTHROPIC_API_BASE_URL")
                .unwrap_or(self.anthropic_api_base_url),
            google_api_key: std::env::var("GOOGLE_API_KEY").unwrap_or(self.google_api_key),
            gemini_api_base_url: std::env::var("GEMINI_API_BASE_URL")
                .unwrap_or(self.gemini_api_base_url),
            default_ai_provider: std::env::var("DEFAULT_AI_PROVIDER")
                .unwrap_or(self.default_ai_provider),
            default_ai_model: std::env::var("DEFAULT_AI_MODEL").unwrap_or(self.default_ai_model),
            prompts_dir: std::env::var("PROMPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(self.prompts_dir),
            samples_dir: std::env::var("SAMPLES_DIR")
                .map(PathBuf::from)
                .unwrap_or(self.samples_dir),
            reference_sample_limit: env_parse(
                "REFERENCE_SAMPLE_LIMIT",
                self.reference_sample_limit,
            )?,
            excerpt_chars: env_parse("EXCERPT_CHARS", self.excerpt_chars)?,
            store_file,
            renderer: std::env::var("RENDERER").unwrap_or(self.renderer),
            sandbox_command: std::env::var("SANDBOX_COMMAND").unwrap_or(self.sandbox_command),
            sandbox_timeout_secs: env_parse("SANDBOX_TIMEOUT_SECS", self.sandbox_timeout_secs)?,
            sandbox_memory_mb: env_parse("SANDBOX_MEMORY_MB", self.sandbox_memory_mb)?,
            pdf_font_paths,
        })
    }
}

/// 读取并解析数值型环境变量，不存在时返回默认值
fn env_parse<T: std::str::FromStr>(var_name: &str, default: T) -> AppResult<T> {
    match std::env::var(var_name) {
        Ok(value) => value.parse().map_err(|_| {
            ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value,
                expected_type: std::any::type_name::<T>().to_string(),
            }
            .into()
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_toml_file_overrides_only_given_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "default_ai_provider = \"claude\"\nreference_sample_limit = 1\nrenderer = \"sandbox\""
        )
        .unwrap();

        let config = Config::from_toml_file(file.path()).unwrap();
        assert_eq!(config.default_ai_provider, "claude");
        assert_eq!(config.reference_sample_limit, 1);
        assert_eq!(config.renderer, "sandbox");
        assert_eq!(config.excerpt_chars, 500);
    }

    #[test]
    fn test_broken_toml_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "reference_sample_limit = \"many\"").unwrap();
        let err = Config::from_toml_file(file.path()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::AppError::Config(ConfigError::TomlParseFailed { .. })
        ));
    }
}
