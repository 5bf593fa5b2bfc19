//! 模型别名表
//!
//! 调用方可以使用友好名称，发送前替换为后端的真实模型 ID；
//! 表中没有的名称原样透传。

use phf::phf_map;

use super::ProviderKind;

static OPENAI_ALIASES: phf::Map<&'static str, &'static str> = phf_map! {
    "gpt-5" => "gpt-4o",
    "gpt-5-mini" => "gpt-4o-mini",
};

static CLAUDE_ALIASES: phf::Map<&'static str, &'static str> = phf_map! {
    "claude-sonnet" => "claude-sonnet-4-20250514",
    "claude-opus" => "claude-opus-4-20250514",
    "claude-haiku" => "claude-3-5-haiku-20241022",
};

static GEMINI_ALIASES: phf::Map<&'static str, &'static str> = phf_map! {
    "gemini-flash" => "gemini-2.5-flash",
    "gemini-pro" => "gemini-2.5-pro",
};

fn table(kind: ProviderKind) -> &'static phf::Map<&'static str, &'static str> {
    match kind {
        ProviderKind::OpenAi => &OPENAI_ALIASES,
        ProviderKind::Claude => &CLAUDE_ALIASES,
        ProviderKind::Gemini => &GEMINI_ALIASES,
    }
}

/// 解析模型名称
pub fn resolve_model(kind: ProviderKind, requested: &str) -> &str {
    table(kind).get(requested).copied().unwrap_or(requested)
}
