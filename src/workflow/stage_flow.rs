//! 五阶段生成流程 - 流程层
//!
//! 核心职责：定义"一道题"的完整生成流程
//!
//! 流程顺序：
//! 1. 骨架 → 2. 参数 → 3. 图形（提取代码并渲染） → 4. 完整问题文 → 5. 解答
//! 6. 从全部回复中提取问题文和解答并保存
//!
//! 每个阶段都等待模型回复后再进入下一阶段；任一阶段调用失败则发送
//! `error` 事件并结束，不保存任何内容。渲染失败不影响流程。

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::RunError;
use crate::models::{ChatTurn, NewProblem, Problem, StageEvent};
use crate::rendering::{FigureRenderer, RenderContext, RenderOutcome};
use crate::services::extraction::{
    extract_code, extract_problem_text, extract_solution_text, strip_import_statements,
};
use crate::services::{LlmService, ProblemService};
use crate::utils::logging::{excerpt, truncate_text};
use crate::workflow::run_ctx::{RunCtx, STAGES_PER_RUN};

/// 需要渲染图形的阶段
pub const FIGURE_STAGE: usize = 3;

/// 各阶段显示给用户的进度消息
pub fn stage_message(stage: usize) -> &'static str {
    match stage {
        1 => "問題の骨格を設計中...",
        2 => "パラメータ設定・動的検証中...",
        3 => "図形を描画中...",
        4 => "完全な問題文を生成中...",
        5 => "解答・解説を作成中...",
        _ => "処理中...",
    }
}

/// 流程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// 正在执行第 k 阶段（1..=5）
    Staging(usize),
    /// 第 3 阶段回复后的图形渲染
    Rendering,
    /// 提取并保存
    Persisting,
    Done,
    Failed,
}

impl RunState {
    /// 第 k 阶段完成后的下一个状态（渲染之后也通过这里继续）
    fn after_stage(stage: usize) -> Self {
        if stage >= STAGES_PER_RUN {
            RunState::Persisting
        } else {
            RunState::Staging(stage + 1)
        }
    }
}

/// 子运行的输入
#[derive(Debug, Clone)]
pub struct StagePlan {
    /// 第 1 阶段发送的消息
    pub opening: String,
    /// 第 2～5 阶段发送的消息
    pub trigger: String,
    /// 保存时使用的学科
    pub subject: String,
    /// 保存时记录的提示词
    pub prompt: String,
}

/// 子运行累积的数据
#[derive(Debug, Default)]
struct Accumulated {
    history: Vec<ChatTurn>,
    full_text: String,
    image_base64: Option<String>,
    last_response: String,
}

/// 五阶段生成流程
///
/// - 持有模型、渲染器和题目服务
/// - 只负责一个子运行，不关心有几个模式
/// - 不增加计数器（由编排层按运行计数）
pub struct StageFlow {
    llm: LlmService,
    renderer: Arc<dyn FigureRenderer>,
    problems: ProblemService,
    excerpt_chars: usize,
}

impl StageFlow {
    pub fn new(
        llm: LlmService,
        renderer: Arc<dyn FigureRenderer>,
        problems: ProblemService,
        excerpt_chars: usize,
    ) -> Self {
        Self {
            llm,
            renderer,
            problems,
            excerpt_chars,
        }
    }

    /// 执行一个五阶段子运行
    ///
    /// # 参数
    /// - `ctx`: 运行上下文（用户、模式、事件通道、取消令牌）
    /// - `plan`: 首轮消息、继续指令和保存字段
    ///
    /// # 返回
    /// 保存后的题目；失败时已经发送过 `error` 事件
    pub async fn run(&self, ctx: &RunCtx, plan: &StagePlan) -> Result<Problem, RunError> {
        let mut acc = Accumulated::default();
        let mut state = RunState::Staging(1);
        let mut failure = None;
        let mut saved = None;

        info!("{} 🚀 开始五阶段生成，模型: {}", ctx, self.llm.model());

        loop {
            debug!("{} 状态: {:?}", ctx, state);
            state = match state {
                RunState::Staging(stage) => match self.run_stage(ctx, plan, stage, &mut acc).await {
                    Ok(()) if stage == FIGURE_STAGE => RunState::Rendering,
                    Ok(()) => {
                        self.emit_stage_complete(ctx, stage, &acc).await?;
                        RunState::after_stage(stage)
                    }
                    Err(RunError::Cancelled) => return Err(RunError::Cancelled),
                    Err(e) => {
                        failure = Some(e);
                        RunState::Failed
                    }
                },
                RunState::Rendering => {
                    self.render_figure(ctx, &mut acc).await?;
                    self.emit_stage_complete(ctx, FIGURE_STAGE, &acc).await?;
                    RunState::after_stage(FIGURE_STAGE)
                }
                RunState::Persisting => match self.persist(ctx, plan, &acc).await {
                    Ok(problem) => {
                        saved = Some(problem);
                        RunState::Done
                    }
                    Err(e) => {
                        failure = Some(e);
                        RunState::Failed
                    }
                },
                RunState::Done => match saved.take() {
                    Some(problem) => {
                        info!("{} ✓ 生成完成，题目 #{}", ctx, problem.id);
                        return Ok(problem);
                    }
                    None => RunState::Failed,
                },
                RunState::Failed => {
                    let error = failure.unwrap_or(RunError::Cancelled);
                    warn!("{} ❌ 生成失败: {}", ctx, error);
                    return Err(error);
                }
            };
        }
    }

    /// 发送第 k 阶段的消息并记录回复
    async fn run_stage(
        &self,
        ctx: &RunCtx,
        plan: &StagePlan,
        stage: usize,
        acc: &mut Accumulated,
    ) -> Result<(), RunError> {
        let global = ctx.global_stage(stage);
        let message = match &ctx.pattern {
            Some(pattern) => format!("パターン{} - {}", pattern, stage_message(stage)),
            None => stage_message(stage).to_string(),
        };
        ctx.emit(StageEvent::Stage {
            stage: global,
            total: ctx.total_stages,
            pattern: ctx.pattern.clone(),
            pattern_stage: ctx.pattern_stage(stage),
            message,
        })
        .await?;

        let turn = if stage == 1 { &plan.opening } else { &plan.trigger };
        acc.history.push(ChatTurn::user(turn.as_str()));

        let response = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => return Err(RunError::Cancelled),
            result = self.llm.try_generate_with_history(&acc.history, None) => result,
        };

        let response = match response {
            Ok(response) => response,
            Err(source) => {
                warn!("{} ⚠️  阶段 {} 调用失败: {}", ctx, stage, source);
                ctx.emit(StageEvent::Error {
                    stage: global,
                    pattern: ctx.pattern.clone(),
                    message: source.to_string(),
                })
                .await?;
                return Err(RunError::StageFailed { stage: global, source });
            }
        };

        debug!("{} 阶段 {} 回复: {}", ctx, stage, truncate_text(&response, 80));
        acc.full_text
            .push_str(&format!("\n\n--- Stage {} ---\n{}", stage, response));
        acc.history.push(ChatTurn::assistant(response.as_str()));
        acc.last_response = response;
        Ok(())
    }

    /// 从第 3 阶段的回复中提取代码并渲染，失败不中断流程
    async fn render_figure(&self, ctx: &RunCtx, acc: &mut Accumulated) -> Result<(), RunError> {
        let code = extract_code(&acc.last_response);
        if code.is_empty() {
            info!("{} 第 {} 阶段回复中没有图形代码", ctx, FIGURE_STAGE);
            return Ok(());
        }
        let code = strip_import_statements(&code);
        let label = ctx.to_string();
        let context = RenderContext::new(label);

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => return Err(RunError::Cancelled),
            outcome = self.renderer.render_from_code(&code, &context) => outcome,
        };

        match outcome {
            RenderOutcome::Rendered { image_base64 } => {
                info!("{} 🖼️  图形渲染成功", ctx);
                acc.image_base64 = Some(image_base64.clone());
                ctx.emit(StageEvent::Figure {
                    image_base64,
                    pattern: ctx.pattern.clone(),
                })
                .await?;
            }
            RenderOutcome::Failed { error } => {
                warn!("{} ⚠️  图形渲染失败，继续生成: {}", ctx, error);
            }
        }
        Ok(())
    }

    async fn emit_stage_complete(
        &self,
        ctx: &RunCtx,
        stage: usize,
        acc: &Accumulated,
    ) -> Result<(), RunError> {
        ctx.emit(StageEvent::StageComplete {
            stage: ctx.global_stage(stage),
            pattern: ctx.pattern.clone(),
            pattern_stage: ctx.pattern_stage(stage),
            excerpt: excerpt(&acc.last_response, self.excerpt_chars),
        })
        .await
    }

    async fn persist(
        &self,
        ctx: &RunCtx,
        plan: &StagePlan,
        acc: &Accumulated,
    ) -> Result<Problem, RunError> {
        if ctx.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let content = match extract_problem_text(&acc.full_text) {
            text if text.is_empty() => acc.full_text.clone(),
            text => text,
        };
        let fields = NewProblem {
            subject: plan.subject.clone(),
            prompt: plan.prompt.clone(),
            content,
            solution: extract_solution_text(&acc.full_text),
            image_base64: acc.image_base64.clone(),
            conversation_history: acc.history.clone(),
        };

        match self.problems.save(&ctx.user_id, fields).await {
            Ok(problem) => Ok(problem),
            Err(e) => {
                let stage = ctx.global_stage(STAGES_PER_RUN);
                ctx.emit(StageEvent::Error {
                    stage,
                    pattern: ctx.pattern.clone(),
                    message: format!("保存に失敗しました: {}", e),
                })
                .await?;
                Err(RunError::PersistFailed(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_after_stage() {
        assert_eq!(RunState::after_stage(1), RunState::Staging(2));
        assert_eq!(RunState::after_stage(FIGURE_STAGE), RunState::Staging(4));
        assert_eq!(RunState::after_stage(STAGES_PER_RUN), RunState::Persisting);
    }

    #[test]
    fn test_stage_messages() {
        assert_eq!(stage_message(1), "問題の骨格を設計中...");
        assert_eq!(stage_message(5), "解答・解説を作成中...");
        assert_eq!(stage_message(9), "処理中...");
    }
}
