//! 图形重新生成流程 - 流程层
//!
//! 流程顺序：
//! 1. 读取题目和对话历史
//! 2. 追加"重新生成图形"指令并调用模型
//! 3. 提取代码并渲染
//! 4. 成功时保存新图片和延长后的历史，计数器加一
//!
//! 提取或渲染失败时题目保持不变。

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::AppResult;
use crate::models::{ChatTurn, ProblemId, ProblemPatch, UsageCounter};
use crate::rendering::{FigureRenderer, RenderContext, RenderOutcome};
use crate::services::extraction::{extract_code, strip_import_statements};
use crate::services::template_service::{render_template, GEOMETRY_REGENERATION};
use crate::services::{LlmService, ProblemService, TemplateResolver};

/// 模板缺失时使用的指令
const DEFAULT_REGENERATION_PROMPT: &str = "\
以下の問題の図形をもう一度描き直してください。\
図形は ```figure ブロックの JSON で出力してください。\n\n{PROBLEM_TEXT}";

/// 重新生成的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegenerateOutcome {
    /// 新图片已保存
    Regenerated { image_base64: String },
    /// 题目不存在或不属于该用户
    NotFound,
    /// 未保存任何修改
    Failed { error: String },
}

/// 图形重新生成流程
pub struct RegenerateFlow {
    llm: LlmService,
    renderer: Arc<dyn FigureRenderer>,
    problems: ProblemService,
    templates: Arc<TemplateResolver>,
}

impl RegenerateFlow {
    pub fn new(
        llm: LlmService,
        renderer: Arc<dyn FigureRenderer>,
        problems: ProblemService,
        templates: Arc<TemplateResolver>,
    ) -> Self {
        Self {
            llm,
            renderer,
            problems,
            templates,
        }
    }

    /// 为已保存的题目重新生成图形
    ///
    /// # 参数
    /// - `problem_id`: 题目 ID
    /// - `user_id`: 用户 ID（必须是题目所有者）
    /// - `cancel`: 取消令牌
    ///
    /// # 返回
    /// 存储读取失败时返回错误，其余情况都通过 `RegenerateOutcome` 表达
    pub async fn run(
        &self,
        problem_id: ProblemId,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> AppResult<RegenerateOutcome> {
        let Some(problem) = self.problems.get(problem_id, user_id).await? else {
            warn!("⚠️  题目 #{} 不存在 (用户: {})", problem_id, user_id);
            return Ok(RegenerateOutcome::NotFound);
        };

        info!("🔁 重新生成题目 #{} 的图形，模型: {}", problem_id, self.llm.model());

        let variables = [("PROBLEM_TEXT", problem.content.as_str())];
        let prompt = self
            .templates
            .load_template(GEOMETRY_REGENERATION, &variables)
            .await;
        let prompt = if prompt.trim().is_empty() {
            warn!("⚠️  缺少 {}，使用内置指令", GEOMETRY_REGENERATION);
            render_template(DEFAULT_REGENERATION_PROMPT, &variables)
        } else {
            prompt
        };
        let mut history = problem.conversation_history.clone();
        history.push(ChatTurn::user(prompt));

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(failed("キャンセルされました")),
            result = self.llm.try_generate_with_history(&history, None) => result,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!("⚠️  题目 #{} 图形重新生成调用失败: {}", problem_id, e);
                return Ok(failed(e.to_string()));
            }
        };

        let code = extract_code(&response);
        if code.is_empty() {
            return Ok(failed("図形コードを抽出できませんでした"));
        }
        let code = strip_import_statements(&code);

        let context = RenderContext::new(format!("题目 #{}", problem_id))
            .with_problem_text(problem.content.as_str());
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(failed("キャンセルされました")),
            outcome = self.renderer.render_from_code(&code, &context) => outcome,
        };
        let image_base64 = match outcome {
            RenderOutcome::Rendered { image_base64 } => image_base64,
            RenderOutcome::Failed { error } => {
                warn!("⚠️  题目 #{} 图形渲染失败: {}", problem_id, error);
                return Ok(failed(error));
            }
        };

        history.push(ChatTurn::assistant(response));
        let patch = ProblemPatch {
            image_base64: Some(image_base64.clone()),
            conversation_history: Some(history),
            ..Default::default()
        };
        match self.problems.update(problem_id, user_id, patch).await {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(RegenerateOutcome::NotFound),
            Err(e) => return Ok(failed(format!("保存に失敗しました: {}", e))),
        }

        self.problems
            .record_usage(user_id, UsageCounter::FigureRegeneration)
            .await;
        info!("✓ 题目 #{} 图形已更新", problem_id);
        Ok(RegenerateOutcome::Regenerated { image_base64 })
    }
}

fn failed(error: impl Into<String>) -> RegenerateOutcome {
    RegenerateOutcome::Failed {
        error: error.into(),
    }
}
