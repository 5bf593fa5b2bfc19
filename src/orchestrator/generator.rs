//! 题目生成器 - 编排层
//!
//! ## 职责
//!
//! 1. **选择模型**：通过 `ProviderRegistry` 解析调用方的 `ModelChoice`
//! 2. **准备提示词**：读取模板和参考样题
//! 3. **调度子运行**：单题一个五阶段子运行，三题依次执行 A、B、C 三个
//! 4. **推送事件**：在后台任务中运行，通过有界通道把事件交给调用方
//! 5. **统计使用量**：每次成功的运行计数一次
//!
//! ## 部分失败
//!
//! 失败的子运行不保存任何内容。三题生成中某个模式失败后继续执行其余模式，
//! 至少保存了一道题时发送 `complete`，全部失败时以 `error` 事件结束。

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppResult, RunError};
use crate::models::{
    ChatTurn, Completion, GenerationRequest, ModelChoice, NewProblem, Problem, ProblemId,
    QuickRequest, StageEvent, TripleRequest, UsageCounter,
};
use crate::providers::{ProviderKind, ProviderRegistry};
use crate::rendering::{FigureRenderer, RenderContext};
use crate::services::extraction::{
    extract_code, extract_problem_text, extract_solution_text, strip_import_statements,
};
use crate::services::template_service::{
    join_samples, FIVE_STAGE_INITIAL, STAGE_TRIGGER, THREE_PROBLEM_GENERATION,
};
use crate::services::{LlmService, ProblemService, TemplateResolver};
use crate::utils::logging::{log_run_complete, log_run_start};
use crate::workflow::{RegenerateFlow, RegenerateOutcome, RunCtx, StageFlow, StagePlan};

/// 三题生成的模式
pub const PATTERNS: [&str; 3] = ["A", "B", "C"];

/// 事件通道容量
const EVENT_BUFFER: usize = 16;

/// 继续指令模板缺失时使用
const DEFAULT_TRIGGER: &str = "次のステージに進んでください。";

const TRANSCRIBE_PROMPT: &str = "この数学の問題を正確にテキストとして書き起こしてください。";
const PREVIEW_PROMPT: &str =
    "この数学の問題を正確にテキストとして書き起こしてください。数式はLaTeX形式で表現してください。";
const NO_ORIGINAL_PROBLEM: &str = "（問題テキスト未提供）";

/// 生成器的可调参数
#[derive(Debug, Clone, Copy)]
pub struct GeneratorSettings {
    /// 注入首轮提示词的参考样题数量
    pub reference_sample_limit: usize,
    /// `stage_complete` 中回显的字符数
    pub excerpt_chars: usize,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            reference_sample_limit: 3,
            excerpt_chars: 500,
        }
    }
}

/// 题目生成器
pub struct ProblemGenerator {
    registry: Arc<ProviderRegistry>,
    templates: Arc<TemplateResolver>,
    renderer: Arc<dyn FigureRenderer>,
    problems: ProblemService,
    settings: GeneratorSettings,
}

impl ProblemGenerator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        templates: Arc<TemplateResolver>,
        renderer: Arc<dyn FigureRenderer>,
        problems: ProblemService,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            registry,
            templates,
            renderer,
            problems,
            settings,
        }
    }

    /// 五阶段单题生成
    ///
    /// # 参数
    /// - `user_id`: 用户 ID
    /// - `request`: 生成请求
    /// - `cancel`: 取消令牌；丢弃返回的流也会取消运行
    ///
    /// # 返回
    /// 事件流，以 `complete` 或 `error` 结束（取消时直接结束）
    pub fn generate(
        self: &Arc<Self>,
        user_id: impl Into<String>,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> ReceiverStream<StageEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(self);
        let user_id = user_id.into();
        tokio::spawn(async move {
            this.run_single(user_id, request, tx, cancel).await;
        });
        ReceiverStream::new(rx)
    }

    /// 三题（A/B/C）生成，共 15 个阶段
    pub fn generate_three(
        self: &Arc<Self>,
        user_id: impl Into<String>,
        request: TripleRequest,
        cancel: CancellationToken,
    ) -> ReceiverStream<StageEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(self);
        let user_id = user_id.into();
        tokio::spawn(async move {
            this.run_triple(user_id, request, tx, cancel).await;
        });
        ReceiverStream::new(rx)
    }

    async fn run_single(
        &self,
        user_id: String,
        request: GenerationRequest,
        tx: mpsc::Sender<StageEvent>,
        cancel: CancellationToken,
    ) {
        let ctx = RunCtx::single(&user_id, tx, cancel);
        let Some(llm) = self.resolve_or_report(&ctx, &request.choice).await else {
            return;
        };

        log_run_start("单题生成", &user_id, ctx.total_stages);

        let samples = self.sample_text().await;
        let units = request.units.join(", ");
        let excluded = request.excluded_units.join(", ");
        let opening = self
            .templates
            .load_template(
                FIVE_STAGE_INITIAL,
                &[
                    ("SAMPLE_PROBLEMS", samples.as_str()),
                    ("USER_PROMPT", request.prompt.as_str()),
                    ("UNITS", units.as_str()),
                    ("EXCLUDED_UNITS", excluded.as_str()),
                ],
            )
            .await;
        let opening = if opening.trim().is_empty() {
            warn!("{} ⚠️  首轮模板为空，直接使用用户提示词", ctx);
            request.prompt.clone()
        } else {
            opening
        };

        let plan = StagePlan {
            opening,
            trigger: self.trigger().await,
            subject: request.subject.clone(),
            prompt: request.prompt.clone(),
        };

        let flow = self.stage_flow(llm);
        match flow.run(&ctx, &plan).await {
            Ok(problem) => {
                self.problems
                    .record_usage(&user_id, UsageCounter::ProblemGeneration)
                    .await;
                let _ = ctx
                    .emit(StageEvent::Complete(Completion::Single { problem }))
                    .await;
                log_run_complete("单题生成", 1, 0);
            }
            Err(RunError::Cancelled) => info!("{} 生成已取消", ctx),
            Err(_) => log_run_complete("单题生成", 0, 1),
        }
    }

    async fn run_triple(
        &self,
        user_id: String,
        request: TripleRequest,
        tx: mpsc::Sender<StageEvent>,
        cancel: CancellationToken,
    ) {
        let total = PATTERNS.len();
        let root = RunCtx::pattern(&user_id, PATTERNS[0], 0, total, tx.clone(), cancel.clone());
        let Some(llm) = self.resolve_or_report(&root, &request.choice).await else {
            return;
        };

        log_run_start("三题生成", &user_id, root.total_stages);

        let original = match self
            .transcribe_documents(&llm, &request.problem_documents, &cancel)
            .await
        {
            Some(text) => text,
            None => return,
        };
        let samples = self.sample_text().await;
        let excluded = request.excluded_units.join(", ");
        let trigger = self.trigger().await;
        let flow = self.stage_flow(llm);

        let mut saved: Vec<Problem> = Vec::with_capacity(total);
        let mut failed = 0;

        for (index, pattern) in PATTERNS.iter().enumerate() {
            let ctx = RunCtx::pattern(&user_id, *pattern, index, total, tx.clone(), cancel.clone());
            if ctx.is_cancelled() {
                info!("{} 生成已取消", ctx);
                return;
            }

            let opening = self
                .templates
                .load_template(
                    THREE_PROBLEM_GENERATION,
                    &[
                        ("SAMPLE_PROBLEMS", samples.as_str()),
                        ("ORIGINAL_PROBLEM", original.as_str()),
                        ("EXCLUDED_UNITS", excluded.as_str()),
                        ("PATTERN", *pattern),
                    ],
                )
                .await;
            let opening = if opening.trim().is_empty() {
                format!("パターン{}の問題を作成してください。\n\n{}", pattern, original)
            } else {
                opening
            };

            let plan = StagePlan {
                opening,
                trigger: trigger.clone(),
                subject: "math".to_string(),
                prompt: format!("3問題生成 パターン{}", pattern),
            };

            match flow.run(&ctx, &plan).await {
                Ok(problem) => saved.push(problem),
                Err(RunError::Cancelled) => {
                    info!("{} 生成已取消", ctx);
                    return;
                }
                Err(e) => {
                    warn!("{} ⚠️  该模式失败，继续下一个模式: {}", ctx, e);
                    failed += 1;
                }
            }
        }

        log_run_complete("三题生成", saved.len(), failed);

        if saved.is_empty() {
            let _ = root
                .emit(StageEvent::Error {
                    stage: root.total_stages,
                    pattern: None,
                    message: "すべてのパターンの生成に失敗しました".to_string(),
                })
                .await;
            return;
        }

        self.problems
            .record_usage(&user_id, UsageCounter::ProblemGeneration)
            .await;
        let _ = root
            .emit(StageEvent::Complete(Completion::Multiple { problems: saved }))
            .await;
    }

    /// 一次性生成：单次调用、提取、渲染、保存
    pub async fn quick(&self, user_id: &str, request: &QuickRequest) -> AppResult<Problem> {
        let llm = self.registry.resolve(&request.choice)?;
        let system = quick_system_prompt(request);
        info!("⚡ 一次性生成 (用户: {}, 模型: {})", user_id, llm.model());

        let turns = [ChatTurn::user(request.prompt.as_str())];
        let response = llm
            .try_generate_with_history(&turns, Some(system.as_str()))
            .await?;

        let content = extract_problem_text(&response);
        let code = extract_code(&response);
        let image_base64 = if code.is_empty() {
            None
        } else {
            let context = RenderContext::new("一次性生成").with_problem_text(content.as_str());
            let outcome = self
                .renderer
                .render_from_code(&strip_import_statements(&code), &context)
                .await;
            if outcome.image().is_none() {
                warn!("⚠️  一次性生成的图形渲染失败: {:?}", outcome);
            }
            outcome.into_image()
        };

        let fields = NewProblem {
            subject: request.subject.clone(),
            prompt: request.prompt.clone(),
            content: if content.is_empty() { response.clone() } else { content },
            solution: extract_solution_text(&response),
            image_base64,
            conversation_history: vec![
                ChatTurn::user(request.prompt.as_str()),
                ChatTurn::assistant(response),
            ],
        };
        let problem = self.problems.save(user_id, fields).await?;
        self.problems
            .record_usage(user_id, UsageCounter::ProblemGeneration)
            .await;
        Ok(problem)
    }

    /// 为已保存的题目重新生成图形
    pub async fn regenerate_figure(
        &self,
        problem_id: ProblemId,
        user_id: &str,
        choice: &ModelChoice,
        cancel: &CancellationToken,
    ) -> AppResult<RegenerateOutcome> {
        let llm = self.registry.resolve(choice)?;
        let flow = RegenerateFlow::new(
            llm,
            Arc::clone(&self.renderer),
            self.problems.clone(),
            Arc::clone(&self.templates),
        );
        flow.run(problem_id, user_id, cancel).await
    }

    /// 把上传的 PDF 转写为文字，预览计数器加一
    ///
    /// # 返回
    /// 与输入一一对应的文字；单个文件失败时对应位置为错误说明
    pub async fn preview(
        &self,
        user_id: &str,
        documents: &[String],
        choice: &ModelChoice,
    ) -> AppResult<Vec<String>> {
        self.problems.record_usage(user_id, UsageCounter::Preview).await;
        let llm = self.document_reader(self.registry.resolve(choice)?);

        let results = join_all(
            documents
                .iter()
                .map(|document| llm.try_generate_with_document(PREVIEW_PROMPT, document)),
        )
        .await;

        let texts = results
            .into_iter()
            .enumerate()
            .map(|(i, result)| match result {
                Ok(text) => text,
                Err(e) => {
                    warn!("⚠️  PDF #{} 转写失败: {}", i + 1, e);
                    format!("抽出エラー: {}", e)
                }
            })
            .collect();
        Ok(texts)
    }

    fn stage_flow(&self, llm: LlmService) -> StageFlow {
        StageFlow::new(
            llm,
            Arc::clone(&self.renderer),
            self.problems.clone(),
            self.settings.excerpt_chars,
        )
    }

    /// 解析模型，失败时发送 `error` 事件
    async fn resolve_or_report(&self, ctx: &RunCtx, choice: &ModelChoice) -> Option<LlmService> {
        match self.registry.resolve(choice) {
            Ok(llm) => Some(llm),
            Err(e) => {
                warn!("{} ❌ {}", ctx, e);
                let _ = ctx
                    .emit(StageEvent::Error {
                        stage: 0,
                        pattern: None,
                        message: e.to_string(),
                    })
                    .await;
                None
            }
        }
    }

    async fn sample_text(&self) -> String {
        let samples = self.templates.load_reference_samples().await;
        join_samples(&samples, self.settings.reference_sample_limit)
    }

    async fn trigger(&self) -> String {
        let trigger = self.templates.load_template(STAGE_TRIGGER, &[]).await;
        if trigger.trim().is_empty() {
            DEFAULT_TRIGGER.to_string()
        } else {
            trigger
        }
    }

    /// OpenAI 兼容接口不能读 PDF，改用其他已注册的提供方
    fn document_reader(&self, llm: LlmService) -> LlmService {
        if llm.provider_kind() != ProviderKind::OpenAi {
            return llm;
        }
        for kind in [ProviderKind::Gemini, ProviderKind::Claude] {
            let choice = ModelChoice {
                api: Some(kind.name().to_string()),
                model: None,
            };
            match self.registry.resolve(&choice) {
                Ok(candidate) if candidate.provider_kind() == kind => {
                    debug!("PDF 转写改用 {}", kind);
                    return candidate;
                }
                _ => {}
            }
        }
        llm
    }

    /// 转写原题 PDF；取消时返回 None
    async fn transcribe_documents(
        &self,
        llm: &LlmService,
        documents: &[String],
        cancel: &CancellationToken,
    ) -> Option<String> {
        if documents.is_empty() {
            return Some(NO_ORIGINAL_PROBLEM.to_string());
        }

        let reader = self.document_reader(llm.clone());
        let mut parts = Vec::with_capacity(documents.len());
        for (i, document) in documents.iter().enumerate() {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                result = reader.try_generate_with_document(TRANSCRIBE_PROMPT, document) => result,
            };
            match result {
                Ok(text) => parts.push(text),
                Err(e) => warn!("⚠️  原题 PDF #{} 转写失败: {}", i + 1, e),
            }
        }

        if parts.is_empty() {
            Some(NO_ORIGINAL_PROBLEM.to_string())
        } else {
            info!("📄 已转写 {} 份原题", parts.len());
            Some(parts.join("\n\n"))
        }
    }
}

/// 一次性生成的系统提示词
fn quick_system_prompt(request: &QuickRequest) -> String {
    let mut parts = vec![
        "あなたは数学教育の専門家です。指定された条件に基づいて数学の問題を生成してください。".to_string(),
    ];
    if let Some(difficulty) = request.difficulty.as_deref().filter(|d| !d.is_empty()) {
        parts.push(format!("難易度: {}", difficulty));
    }
    if !request.units.is_empty() {
        parts.push(format!("単元: {}", request.units.join(", ")));
    }
    if !request.excluded_units.is_empty() {
        parts.push(format!("使用禁止単元: {}", request.excluded_units.join(", ")));
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_system_prompt_lists_constraints() {
        let request = QuickRequest {
            prompt: "円の問題".to_string(),
            subject: "math".to_string(),
            units: vec!["平面図形".to_string(), "三角比".to_string()],
            excluded_units: vec!["微分".to_string()],
            difficulty: Some("標準".to_string()),
            choice: ModelChoice::default(),
        };
        let prompt = quick_system_prompt(&request);
        let lines: Vec<_> = prompt.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "難易度: 標準");
        assert_eq!(lines[2], "単元: 平面図形, 三角比");
        assert_eq!(lines[3], "使用禁止単元: 微分");
    }

    #[test]
    fn test_quick_system_prompt_without_constraints() {
        let request = QuickRequest {
            prompt: "x".to_string(),
            subject: "math".to_string(),
            units: Vec::new(),
            excluded_units: Vec::new(),
            difficulty: None,
            choice: ModelChoice::default(),
        };
        assert_eq!(quick_system_prompt(&request).lines().count(), 1);
    }
}
