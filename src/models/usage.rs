use serde::{Deserialize, Serialize};

/// 用户使用量计数器种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageCounter {
    /// 题目生成次数
    ProblemGeneration,
    /// 图形重新生成次数
    FigureRegeneration,
    /// PDF 预览次数
    Preview,
}

impl UsageCounter {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageCounter::ProblemGeneration => "problem_generation_count",
            UsageCounter::FigureRegeneration => "figure_regeneration_count",
            UsageCounter::Preview => "preview_count",
        }
    }
}

impl std::fmt::Display for UsageCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个用户的全部计数器，只增不减
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    #[serde(default)]
    pub problem_generation_count: u64,
    #[serde(default)]
    pub figure_regeneration_count: u64,
    #[serde(default)]
    pub preview_count: u64,
}

impl UsageCounters {
    pub fn get(&self, counter: UsageCounter) -> u64 {
        match counter {
            UsageCounter::ProblemGeneration => self.problem_generation_count,
            UsageCounter::FigureRegeneration => self.figure_regeneration_count,
            UsageCounter::Preview => self.preview_count,
        }
    }

    /// 加一并返回新值
    pub fn bump(&mut self, counter: UsageCounter) -> u64 {
        let slot = match counter {
            UsageCounter::ProblemGeneration => &mut self.problem_generation_count,
            UsageCounter::FigureRegeneration => &mut self.figure_regeneration_count,
            UsageCounter::Preview => &mut self.preview_count,
        };
        *slot = slot.saturating_add(1);
        *slot
    }
}
