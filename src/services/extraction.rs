//! 产物提取
//!
//! 从模型的自由文本中取出问题文、解答和代码块。
//! 全部是纯函数，找不到标记不算错误。

use std::sync::LazyLock;

use regex::Regex;

/// 一个段落标记：起始标记之后到结束标记之前（没有结束标记则到文末）
struct Section {
    start: Regex,
    end: Option<Regex>,
}

impl Section {
    fn compile(start: &str, end: Option<&str>) -> Option<Self> {
        let start = Regex::new(start).ok()?;
        let end = match end {
            Some(end) => Some(Regex::new(end).ok()?),
            None => None,
        };
        Some(Self { start, end })
    }

    /// 返回去掉首尾空白后的段落，段落为空时返回 None
    fn capture<'a>(&self, text: &'a str) -> Option<&'a str> {
        let m = self.start.find(text)?;
        let rest = &text[m.end()..];
        let body = match &self.end {
            Some(end) => end.find(rest).map_or(rest, |e| &rest[..e.start()]),
            None => rest,
        };
        let body = body.trim();
        (!body.is_empty()).then_some(body)
    }
}

/// 问题文标记，按优先级排列
static PROBLEM_SECTIONS: LazyLock<Vec<Section>> = LazyLock::new(|| {
    [
        (r"【(?:問題文|(?i:problem))】\s*\n", Some(r"【")),
        (r"##\s*(?:問題文|(?i:problem))[^\n]*\n", Some(r"##")),
        (r"(?:問題|(?i:problem))[：:]\s*\n?", Some(r"解答|解説|(?i:solution)")),
    ]
    .into_iter()
    .filter_map(|(start, end)| Section::compile(start, end))
    .collect()
});

/// 解答标记，按优先级排列，都截取到文末
static SOLUTION_SECTIONS: LazyLock<Vec<Section>> = LazyLock::new(|| {
    [
        r"【(?:解答・解説|解答|(?i:solution))】\s*\n",
        r"##\s*(?:解答|(?i:solution))[^\n]*\n",
        r"(?:解答|(?i:solution))[：:]\s*\n?",
    ]
    .into_iter()
    .filter_map(|start| Section::compile(start, None))
    .collect()
});

/// python / py 或声明式 figure 代码块
static CODE_FENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:python|py|figure)[ \t]*\r?\n(.*?)```").ok());

/// 提取问题文
///
/// # 返回
/// 第一个非空的标记段落；没有任何标记时返回去掉首尾空白的原文
pub fn extract_problem_text(text: &str) -> String {
    PROBLEM_SECTIONS
        .iter()
        .find_map(|section| section.capture(text))
        .unwrap_or_else(|| text.trim())
        .to_string()
}

/// 提取解答与解说
///
/// # 返回
/// 第一个非空的标记段落；没有任何标记时返回空字符串
pub fn extract_solution_text(text: &str) -> String {
    SOLUTION_SECTIONS
        .iter()
        .find_map(|section| section.capture(text))
        .unwrap_or_default()
        .to_string()
}

/// 提取第一个代码块的内容（去掉首尾空白），没有时返回空字符串
pub fn extract_code(text: &str) -> String {
    CODE_FENCE
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// 删除 import / from 开头的行（渲染环境已提供这些模块）
pub fn strip_import_statements(code: &str) -> String {
    code.split('\n')
        .filter(|line| {
            let line = line.trim();
            !line.starts_with("import ") && !line.starts_with("from ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_marker_falls_back() {
        let text = "  ただの文章です。\n";
        assert_eq!(extract_problem_text(text), "ただの文章です。");
        assert_eq!(extract_solution_text(text), "");
        assert_eq!(extract_problem_text(""), "");
    }

    #[test]
    fn test_bracket_markers() {
        let text = "前置き\n【問題文】\n三角形ABCにおいて…\n【解答・解説】\n答えは 3 です。\n";
        assert_eq!(extract_problem_text(text), "三角形ABCにおいて…");
        assert_eq!(extract_solution_text(text), "答えは 3 です。");
    }

    #[test]
    fn test_heading_markers() {
        let text = "## 問題文\n円の面積を求めよ。\n## 解答\nπr^2\n";
        assert_eq!(extract_problem_text(text), "円の面積を求めよ。");
        assert_eq!(extract_solution_text(text), "πr^2");
    }

    #[test]
    fn test_english_markers() {
        let text = "Problem:\nFind x.\nSolution: x = 2";
        assert_eq!(extract_problem_text(text), "Find x.");
        assert_eq!(extract_solution_text(text), "x = 2");
    }

    #[test]
    fn test_empty_section_tries_next_marker() {
        let text = "【問題文】\n【解答・解説】\n## 問題文\n本当の問題\n";
        assert_eq!(extract_problem_text(text), "本当の問題");
    }

    #[test]
    fn test_extract_first_code_block() {
        let text = "説明\n```python\n  import numpy as np\nx = 1\n```\n```py\nsecond\n```";
        assert_eq!(extract_code(text), "import numpy as np\nx = 1");
        assert_eq!(extract_code("```figure\n{\"points\": {}}\n```"), "{\"points\": {}}");
        assert_eq!(extract_code("no fence here"), "");
        assert_eq!(extract_code("```rust\nfn main() {}\n```"), "");
    }

    #[test]
    fn test_strip_imports_is_idempotent() {
        let code = "import numpy as np\n  from math import pi\nx = pi\nimported = 1";
        let once = strip_import_statements(code);
        assert_eq!(once, "x = pi\nimported = 1");
        assert_eq!(strip_import_statements(&once), once);
    }
}
