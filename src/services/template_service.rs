//! 提示词模板
//!
//! 模板是 `prompts/` 目录下的文本文件，占位符写作 `{KEY}`，
//! 替换是纯文本替换，没有给出的占位符原样保留。
//! 参考样题是 `data/` 目录下的 `.md` 文件。

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::{debug, error, warn};

use crate::error::TemplateError;

/// 五阶段生成的首轮模板
pub const FIVE_STAGE_INITIAL: &str = "five_stage_initial.txt";
/// 第 2～5 阶段的继续指令
pub const STAGE_TRIGGER: &str = "stage_trigger.txt";
/// 三题生成的首轮模板
pub const THREE_PROBLEM_GENERATION: &str = "three_problem_generation.txt";
/// 重新生成图形
pub const GEOMETRY_REGENERATION: &str = "geometry_regeneration.txt";

/// 一道参考样题
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSample {
    /// 文件名
    pub name: String,
    pub text: String,
}

/// 模板与样题的读取器
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    prompts_dir: PathBuf,
    samples_dir: PathBuf,
}

impl TemplateResolver {
    pub fn new(prompts_dir: impl Into<PathBuf>, samples_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompts_dir: prompts_dir.into(),
            samples_dir: samples_dir.into(),
        }
    }

    pub fn prompts_dir(&self) -> &Path {
        &self.prompts_dir
    }

    /// 读取模板原文
    pub async fn read_template(&self, name: &str) -> Result<String, TemplateError> {
        let path = self.prompts_dir.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TemplateError::NotFound(path.display().to_string()))
            }
            Err(source) => Err(TemplateError::ReadFailed {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// 读取模板并替换变量
    ///
    /// # 参数
    /// - `name`: 模板文件名
    /// - `variables`: `(KEY, 值)` 列表
    ///
    /// # 返回
    /// 替换后的文本；模板不存在或读取失败时记录错误并返回空字符串
    pub async fn load_template(&self, name: &str, variables: &[(&str, &str)]) -> String {
        match self.read_template(name).await {
            Ok(template) => render_template(&template, variables),
            Err(e) => {
                error!("❌ {}", e);
                String::new()
            }
        }
    }

    /// 读取全部参考样题，按文件名升序
    ///
    /// 读取失败的文件跳过并记录警告；目录不存在时返回空列表。
    pub async fn load_reference_samples(&self) -> Vec<ReferenceSample> {
        let mut entries = match tokio::fs::read_dir(&self.samples_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("⚠️  无法读取样题目录 {}: {}", self.samples_dir.display(), e);
                return Vec::new();
            }
        };

        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "md") {
                        paths.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("⚠️  遍历样题目录失败: {}", e);
                    break;
                }
            }
        }
        paths.sort();

        let mut samples = Vec::with_capacity(paths.len());
        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => samples.push(ReferenceSample { name, text }),
                Err(e) => warn!("⚠️  跳过无法读取的样题 {}: {}", name, e),
            }
        }

        debug!("读取参考样题 {} 道", samples.len());
        samples
    }
}

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").ok());

/// 替换 `{KEY}` 占位符
///
/// 只扫描模板原文一遍，替换进去的值不会再被展开。
pub fn render_template(template: &str, variables: &[(&str, &str)]) -> String {
    let Some(placeholder) = PLACEHOLDER.as_ref() else {
        return template.to_string();
    };
    placeholder
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            variables
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// 把前 `limit` 道样题拼接为一段文本
pub fn join_samples(samples: &[ReferenceSample], limit: usize) -> String {
    samples
        .iter()
        .take(limit)
        .map(|s| s.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_replaces_known_and_keeps_unknown() {
        let rendered = render_template(
            "Hello {NAME}, units: {UNITS}",
            &[("NAME", "Taro"), ("UNITS", "algebra")],
        );
        assert_eq!(rendered, "Hello Taro, units: algebra");

        let rendered = render_template("{MISSING} and {NAME}", &[("NAME", "Taro")]);
        assert_eq!(rendered, "{MISSING} and Taro");
    }

    #[test]
    fn test_injected_values_are_not_expanded_again() {
        let rendered = render_template(
            "req: {USER_PROMPT} / units: {UNITS}",
            &[("USER_PROMPT", "use the {UNITS} notation"), ("UNITS", "algebra")],
        );
        assert_eq!(rendered, "req: use the {UNITS} notation / units: algebra");

        // 原题里出现的花括号保持原样
        let rendered =
            render_template("{ORIGINAL_PROBLEM}", &[("ORIGINAL_PROBLEM", "集合 {x | x > 0}")]);
        assert_eq!(rendered, "集合 {x | x > 0}");
    }

    #[test]
    fn test_join_samples_respects_limit() {
        let samples: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|t| ReferenceSample {
                name: format!("{}.md", t),
                text: format!("{}\n", t),
            })
            .collect();
        assert_eq!(join_samples(&samples, 2), "a\n\n---\n\nb");
        assert_eq!(join_samples(&[], 3), "");
    }

    #[tokio::test]
    async fn test_missing_template_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = TemplateResolver::new(dir.path(), dir.path());
        assert_eq!(resolver.load_template("nope.txt", &[]).await, "");
        assert!(matches!(
            resolver.read_template("nope.txt").await,
            Err(TemplateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_samples_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.md"), "second").unwrap();
        std::fs::write(dir.path().join("a.md"), "first").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let resolver = TemplateResolver::new(dir.path(), dir.path());
        let samples = resolver.load_reference_samples().await;
        let names: Vec<_> = samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a.md", "b.md"]);
        assert_eq!(samples[0].text, "first");
    }

    #[tokio::test]
    async fn test_load_template_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t.txt"), "単元: {UNITS}").unwrap();
        let resolver = TemplateResolver::new(dir.path(), dir.path());
        assert_eq!(resolver.load_template("t.txt", &[("UNITS", "確率")]).await, "単元: 確率");
    }
}
