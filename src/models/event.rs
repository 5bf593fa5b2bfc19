//! 生成进度事件
//!
//! 线上格式为每行一个 JSON 对象：`{"event": "<tag>", "data": {...}}`。

use serde::{Deserialize, Serialize};

use crate::models::problem::Problem;

/// 完成事件携带的数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Completion {
    /// 单题生成
    Single { problem: Problem },
    /// 三题生成
    Multiple { problems: Vec<Problem> },
}

impl Completion {
    pub fn problems(&self) -> Vec<&Problem> {
        match self {
            Completion::Single { problem } => vec![problem],
            Completion::Multiple { problems } => problems.iter().collect(),
        }
    }
}

/// 流式输出的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StageEvent {
    /// 阶段开始
    Stage {
        stage: usize,
        total: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern_stage: Option<usize>,
        message: String,
    },
    /// 图形渲染成功
    Figure {
        image_base64: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
    /// 阶段完成
    StageComplete {
        stage: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern_stage: Option<usize>,
        excerpt: String,
    },
    /// 阶段失败
    Error {
        stage: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        message: String,
    },
    /// 全部完成并已保存
    Complete(Completion),
}

impl StageEvent {
    /// 事件标签
    pub fn tag(&self) -> &'static str {
        match self {
            StageEvent::Stage { .. } => "stage",
            StageEvent::Figure { .. } => "figure",
            StageEvent::StageComplete { .. } => "stage_complete",
            StageEvent::Error { .. } => "error",
            StageEvent::Complete(_) => "complete",
        }
    }

    /// 序列化为一行 NDJSON（含换行符）
    pub fn to_ndjson_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_event_wire_format() {
        let event = StageEvent::Stage {
            stage: 2,
            total: 5,
            pattern: None,
            pattern_stage: None,
            message: "パラメータ設定・動的検証中...".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "stage");
        assert_eq!(value["data"]["stage"], 2);
        assert_eq!(value["data"]["total"], 5);
        assert!(value["data"].get("pattern").is_none());
    }

    #[test]
    fn test_error_event_line_ends_with_newline() {
        let event = StageEvent::Error {
            stage: 3,
            pattern: Some("B".to_string()),
            message: "timeout".to_string(),
        };
        let line = event.to_ndjson_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let parsed: StageEvent = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.tag(), "error");
    }
}
