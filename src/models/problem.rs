use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::turn::ChatTurn;

/// 题目记录 ID
pub type ProblemId = i64;

/// 审核信息（由老师手动填写）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckInfo {
    #[serde(default)]
    pub problem_text_ok: bool,
    #[serde(default)]
    pub solution_ok: bool,
    #[serde(default)]
    pub figure_ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl CheckInfo {
    /// 题干、解答、图形三项全部确认
    pub fn is_fully_checked(&self) -> bool {
        self.problem_text_ok && self.solution_ok && self.figure_ok
    }
}

/// 已保存的题目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub id: ProblemId,
    pub user_id: String,
    pub subject: String,
    #[serde(default)]
    pub prompt: String,
    /// 提取出的题干，提取失败时为空串
    #[serde(default)]
    pub content: String,
    /// 提取出的解答，提取失败时为空串
    #[serde(default)]
    pub solution: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<ChatTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_info: Option<CheckInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 新建题目时提供的字段（ID 和时间戳由存储层设置）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewProblem {
    pub subject: String,
    pub prompt: String,
    pub content: String,
    pub solution: String,
    pub image_base64: Option<String>,
    pub conversation_history: Vec<ChatTurn>,
}

/// 部分更新，None 表示保持原值
///
/// 没有 `user_id` 字段：所有者创建后不可修改。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProblemPatch {
    pub subject: Option<String>,
    pub prompt: Option<String>,
    pub content: Option<String>,
    pub solution: Option<String>,
    pub image_base64: Option<String>,
    pub conversation_history: Option<Vec<ChatTurn>>,
    pub check_info: Option<CheckInfo>,
}

impl ProblemPatch {
    /// 把补丁应用到记录上
    pub fn apply(self, problem: &mut Problem, now: DateTime<Utc>) {
        if let Some(subject) = self.subject {
            problem.subject = subject;
        }
        if let Some(prompt) = self.prompt {
            problem.prompt = prompt;
        }
        if let Some(content) = self.content {
            problem.content = content;
        }
        if let Some(solution) = self.solution {
            problem.solution = solution;
        }
        if let Some(image) = self.image_base64 {
            problem.image_base64 = Some(image);
        }
        if let Some(history) = self.conversation_history {
            problem.conversation_history = history;
        }
        if let Some(check_info) = self.check_info {
            problem.check_info = Some(check_info);
        }
        problem.updated_at = now;
    }
}

/// 题目检索条件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProblemQuery {
    pub keyword: Option<String>,
    pub subject: Option<String>,
    pub units: Option<Vec<String>>,
    pub year: Option<String>,
    pub exam_session: Option<String>,
    pub is_checked: Option<bool>,
}

impl ProblemQuery {
    /// 判断题目是否满足全部条件
    pub fn matches(&self, problem: &Problem) -> bool {
        if let Some(keyword) = self.keyword.as_deref().filter(|k| !k.is_empty()) {
            if !problem.content.to_lowercase().contains(&keyword.to_lowercase()) {
                return false;
            }
        }
        if let Some(subject) = self.subject.as_deref().filter(|s| !s.is_empty()) {
            if problem.subject != subject {
                return false;
            }
        }

        let check_info = problem.check_info.clone().unwrap_or_default();

        if let Some(units) = self.units.as_ref().filter(|u| !u.is_empty()) {
            let problem_units = check_info.units.as_deref().unwrap_or(&[]);
            if !units.iter().any(|u| problem_units.contains(u)) {
                return false;
            }
        }
        if let Some(year) = self.year.as_deref().filter(|y| !y.is_empty()) {
            if check_info.year.as_deref() != Some(year) {
                return false;
            }
        }
        if let Some(session) = self.exam_session.as_deref().filter(|s| !s.is_empty()) {
            if check_info.exam_session.as_deref() != Some(session) {
                return false;
            }
        }
        if let Some(is_checked) = self.is_checked {
            if check_info.is_fully_checked() != is_checked {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_problem() -> Problem {
        let now = Utc::now();
        Problem {
            id: 1,
            user_id: "user-1".to_string(),
            subject: "math".to_string(),
            prompt: "立方体の問題".to_string(),
            content: "一辺が 6cm の立方体 ABCD-EFGH がある。".to_string(),
            solution: String::new(),
            image_base64: None,
            conversation_history: Vec::new(),
            check_info: Some(CheckInfo {
                problem_text_ok: true,
                solution_ok: true,
                figure_ok: true,
                units: Some(vec!["空間図形".to_string()]),
                year: Some("2024".to_string()),
                exam_session: None,
                tags: None,
            }),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_empty_query_matches_everything() {
        assert!(ProblemQuery::default().matches(&sample_problem()));
    }

    #[test]
    fn test_query_filters() {
        let problem = sample_problem();
        let by_keyword = ProblemQuery {
            keyword: Some("立方体".to_string()),
            ..Default::default()
        };
        assert!(by_keyword.matches(&problem));

        let wrong_unit = ProblemQuery {
            units: Some(vec!["確率".to_string()]),
            ..Default::default()
        };
        assert!(!wrong_unit.matches(&problem));

        let unchecked = ProblemQuery {
            is_checked: Some(false),
            ..Default::default()
        };
        assert!(!unchecked.matches(&problem));

        let year = ProblemQuery {
            year: Some("2024".to_string()),
            ..Default::default()
        };
        assert!(year.matches(&problem));
    }

    #[test]
    fn test_patch_keeps_untouched_fields() {
        let mut problem = sample_problem();
        let before = problem.clone();
        let patch = ProblemPatch {
            image_base64: Some("aW1n".to_string()),
            ..Default::default()
        };
        patch.apply(&mut problem, Utc::now());
        assert_eq!(problem.image_base64.as_deref(), Some("aW1n"));
        assert_eq!(problem.content, before.content);
        assert_eq!(problem.user_id, before.user_id);
    }
}
