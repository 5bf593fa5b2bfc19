use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use mongene::error::StoreError;
use mongene::models::{
    ChatTurn, Completion, GenerationRequest, ModelChoice, NewProblem, Problem, ProblemId,
    ProblemPatch, QuickRequest, Role, StageEvent, TripleRequest, UsageCounter, UsageCounters,
};
use mongene::orchestrator::{GeneratorSettings, ProblemGenerator};
use mongene::providers::{CompletionRequest, LlmProvider, ProviderKind, ProviderRegistry};
use mongene::rendering::{FigureRenderer, RenderContext, RenderOutcome};
use mongene::services::template_service::render_template;
use mongene::services::{ProblemService, TemplateResolver};
use mongene::store::{InMemoryStore, ProblemStore};
use mongene::workflow::RegenerateOutcome;

const USER: &str = "user-1";
const FIGURE_REPLY: &str = "図を描きます。\n```figure\n{\"points\": {\"A\": [0, 0], \"B\": [4, 0]}, \"segments\": [[\"A\", \"B\"]]}\n```";
const PROBLEM_REPLY: &str = "【問題文】\n三角形ABCにおいて AB = 4 のとき、面積を求めよ。";
const SOLUTION_REPLY: &str = "【解答・解説】\n面積は 6 である。";

/// 按阶段返回固定回复的提供方
///
/// 阶段号等于请求中的用户消息数，模式从首条消息中的"パターンX"判断。
struct Scripted {
    kind: ProviderKind,
    /// (模式, 阶段) 命中时返回错误；模式为 None 表示所有模式
    fail_at: Option<(Option<&'static str>, usize)>,
    with_figure: bool,
    fail_regeneration: bool,
}

impl Scripted {
    fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            fail_at: None,
            with_figure: true,
            fail_regeneration: false,
        }
    }

    fn failing_at(mut self, pattern: Option<&'static str>, stage: usize) -> Self {
        self.fail_at = Some((pattern, stage));
        self
    }

    fn without_figure(mut self) -> Self {
        self.with_figure = false;
        self
    }

    fn failing_regeneration(mut self) -> Self {
        self.fail_regeneration = true;
        self
    }
}

#[async_trait]
impl LlmProvider for Scripted {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String> {
        let last = request.messages.last().map(|m| m.text.as_str()).unwrap_or("");

        if last.contains("描き直") {
            if self.fail_regeneration {
                anyhow::bail!("429 Too Many Requests");
            }
            let reply = if self.with_figure { FIGURE_REPLY } else { "図形は不要です。" };
            return Ok(reply.to_string());
        }
        if request.messages.iter().any(|m| m.attachment.is_some()) {
            return Ok("転写: 半径 3 の円の面積を求めよ。".to_string());
        }
        if request.system.is_some() {
            return Ok(format!("{}\n\n{}\n\n{}", PROBLEM_REPLY, FIGURE_REPLY, SOLUTION_REPLY));
        }

        let stage = request.messages.iter().filter(|m| m.role == Role::User).count();
        let pattern = ["A", "B", "C"]
            .into_iter()
            .find(|p| request.messages[0].text.contains(&format!("パターン{}", p)));
        if let Some((fail_pattern, fail_stage)) = self.fail_at {
            if fail_stage == stage && (fail_pattern.is_none() || fail_pattern == pattern) {
                anyhow::bail!("503 Service Unavailable");
            }
        }

        let reply = match stage {
            1 => "骨格: 三角形の面積",
            2 => "パラメータ: AB = 4, 高さ 3",
            3 if self.with_figure => FIGURE_REPLY,
            3 => "図形は不要です。",
            4 => PROBLEM_REPLY,
            _ => SOLUTION_REPLY,
        };
        Ok(reply.to_string())
    }
}

/// 保存时总是失败的存储，其余操作交给内存存储
struct DiskFullStore {
    inner: InMemoryStore,
}

#[async_trait]
impl ProblemStore for DiskFullStore {
    async fn create(&self, _user_id: &str, _fields: NewProblem) -> Result<Problem, StoreError> {
        Err(StoreError::WriteFailed {
            path: "problems.json".to_string(),
            source: std::io::Error::other("disk full"),
        })
    }

    async fn get(&self, id: ProblemId, user_id: &str) -> Result<Option<Problem>, StoreError> {
        self.inner.get(id, user_id).await
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Problem>, StoreError> {
        self.inner.list(user_id).await
    }

    async fn update(
        &self,
        id: ProblemId,
        user_id: &str,
        patch: ProblemPatch,
    ) -> Result<Option<Problem>, StoreError> {
        self.inner.update(id, user_id, patch).await
    }

    async fn delete(&self, id: ProblemId, user_id: &str) -> Result<bool, StoreError> {
        self.inner.delete(id, user_id).await
    }

    async fn increment_counter(
        &self,
        user_id: &str,
        counter: UsageCounter,
    ) -> Result<u64, StoreError> {
        self.inner.increment_counter(user_id, counter).await
    }

    async fn counters(&self, user_id: &str) -> Result<UsageCounters, StoreError> {
        self.inner.counters(user_id).await
    }
}

/// 记录调用次数的渲染器
struct CountingRenderer {
    succeed: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl FigureRenderer for CountingRenderer {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn render_from_code(&self, _code: &str, _context: &RenderContext) -> RenderOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            RenderOutcome::Rendered {
                image_base64: "aW1hZ2U=".to_string(),
            }
        } else {
            RenderOutcome::Failed {
                error: "描画できません".to_string(),
            }
        }
    }
}

struct Harness {
    generator: Arc<ProblemGenerator>,
    problems: ProblemService,
    renderer: Arc<CountingRenderer>,
    dir: tempfile::TempDir,
}

fn write_templates(dir: &Path) {
    let prompts = dir.join("prompts");
    std::fs::create_dir_all(&prompts).unwrap();
    std::fs::create_dir_all(dir.join("data")).unwrap();
    std::fs::write(
        prompts.join("five_stage_initial.txt"),
        "生成: {USER_PROMPT}\n単元: {UNITS}",
    )
    .unwrap();
    std::fs::write(prompts.join("stage_trigger.txt"), "次へ").unwrap();
    std::fs::write(
        prompts.join("three_problem_generation.txt"),
        "パターン{PATTERN}: {ORIGINAL_PROBLEM}",
    )
    .unwrap();
    std::fs::write(
        prompts.join("geometry_regeneration.txt"),
        "図形を描き直す: {PROBLEM_TEXT}",
    )
    .unwrap();
    std::fs::write(dir.join("data").join("01.md"), "【問題文】\n参考").unwrap();
}

fn harness_with(providers: Vec<Arc<dyn LlmProvider>>, render_ok: bool) -> Harness {
    harness_with_store(providers, render_ok, Arc::new(InMemoryStore::new()))
}

fn harness_with_store(
    providers: Vec<Arc<dyn LlmProvider>>,
    render_ok: bool,
    store: Arc<dyn ProblemStore>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    write_templates(dir.path());

    let registry = providers
        .into_iter()
        .fold(ProviderRegistry::new("gemini", "gemini-2.5-flash"), |r, p| r.register(p));
    let templates = TemplateResolver::new(dir.path().join("prompts"), dir.path().join("data"));
    let renderer = Arc::new(CountingRenderer {
        succeed: render_ok,
        calls: AtomicUsize::new(0),
    });
    let problems = ProblemService::new(store);
    let generator = Arc::new(ProblemGenerator::new(
        Arc::new(registry),
        Arc::new(templates),
        renderer.clone(),
        problems.clone(),
        GeneratorSettings::default(),
    ));

    Harness {
        generator,
        problems,
        renderer,
        dir,
    }
}

fn harness(provider: Scripted) -> Harness {
    let provider: Arc<dyn LlmProvider> = Arc::new(provider);
    harness_with(vec![provider], true)
}

fn count(events: &[StageEvent], tag: &str) -> usize {
    events.iter().filter(|e| e.tag() == tag).count()
}

async fn run_single(h: &Harness) -> Vec<StageEvent> {
    h.generator
        .generate(USER, GenerationRequest::new("三角形の面積"), CancellationToken::new())
        .collect()
        .await
}

#[tokio::test]
async fn test_single_run_emits_five_stages_and_saves() {
    let h = harness(Scripted::new(ProviderKind::Gemini));
    let events = run_single(&h).await;

    assert_eq!(count(&events, "stage"), 5);
    assert_eq!(count(&events, "figure"), 1);
    assert_eq!(count(&events, "stage_complete"), 5);
    assert_eq!(count(&events, "complete"), 1);
    assert_eq!(count(&events, "error"), 0);

    // 第 3 阶段的 figure 在它的 stage_complete 之前
    let figure_at = events.iter().position(|e| e.tag() == "figure").unwrap();
    assert!(matches!(events[figure_at + 1], StageEvent::StageComplete { stage: 3, .. }));

    let Some(StageEvent::Complete(Completion::Single { problem })) = events.last() else {
        panic!("最后一个事件应为 complete: {:?}", events.last());
    };
    assert!(problem.content.contains("三角形ABC"));
    assert!(problem.solution.contains("面積は 6"));
    assert_eq!(problem.image_base64.as_deref(), Some("aW1hZ2U="));
    assert_eq!(problem.conversation_history.len(), 10);
    assert!(problem.conversation_history[0].content.starts_with("生成: 三角形の面積"));

    assert_eq!(h.problems.list(USER).await.unwrap().len(), 1);
    let usage = h.problems.usage(USER).await.unwrap();
    assert_eq!(usage.get(UsageCounter::ProblemGeneration), 1);
}

#[tokio::test]
async fn test_single_run_without_figure_code_skips_renderer() {
    let h = harness(Scripted::new(ProviderKind::Gemini).without_figure());
    let events = run_single(&h).await;

    assert_eq!(count(&events, "figure"), 0);
    assert_eq!(count(&events, "stage_complete"), 5);
    assert_eq!(count(&events, "complete"), 1);
    assert_eq!(h.renderer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_render_failure_does_not_stop_run() {
    let provider: Arc<dyn LlmProvider> = Arc::new(Scripted::new(ProviderKind::Gemini));
    let h = harness_with(vec![provider], false);
    let events = run_single(&h).await;

    assert_eq!(count(&events, "figure"), 0);
    assert_eq!(count(&events, "complete"), 1);
    assert_eq!(h.renderer.calls.load(Ordering::SeqCst), 1);
    let saved = h.problems.list(USER).await.unwrap();
    assert_eq!(saved[0].image_base64, None);
}

#[tokio::test]
async fn test_stage_three_failure_ends_run_without_saving() {
    let h = harness(Scripted::new(ProviderKind::Gemini).failing_at(None, 3));
    let events = run_single(&h).await;

    assert_eq!(count(&events, "stage"), 3);
    assert_eq!(count(&events, "stage_complete"), 2);
    assert_eq!(count(&events, "complete"), 0);
    assert!(matches!(
        events.last(),
        Some(StageEvent::Error { stage: 3, pattern: None, .. })
    ));

    assert!(h.problems.list(USER).await.unwrap().is_empty());
    assert_eq!(h.renderer.calls.load(Ordering::SeqCst), 0);
    let usage = h.problems.usage(USER).await.unwrap();
    assert_eq!(usage.get(UsageCounter::ProblemGeneration), 0);
}

#[tokio::test]
async fn test_save_failure_ends_run_with_error() {
    let provider: Arc<dyn LlmProvider> = Arc::new(Scripted::new(ProviderKind::Gemini));
    let store = Arc::new(DiskFullStore {
        inner: InMemoryStore::new(),
    });
    let h = harness_with_store(vec![provider], true, store);
    let events = run_single(&h).await;

    assert_eq!(count(&events, "stage_complete"), 5);
    assert_eq!(count(&events, "complete"), 0);
    let Some(StageEvent::Error { message, pattern, .. }) = events.last() else {
        panic!("最后一个事件应为 error: {:?}", events.last());
    };
    assert!(message.contains("保存に失敗しました"), "{}", message);
    assert!(message.contains("disk full"), "{}", message);
    assert_eq!(*pattern, None);

    let usage = h.problems.usage(USER).await.unwrap();
    assert_eq!(usage.get(UsageCounter::ProblemGeneration), 0);
}

#[tokio::test]
async fn test_no_provider_reports_stage_zero_error() {
    let h = harness_with(Vec::new(), true);
    let events = run_single(&h).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], StageEvent::Error { stage: 0, .. }));
}

#[tokio::test]
async fn test_cancelled_run_emits_nothing_and_saves_nothing() {
    let h = harness(Scripted::new(ProviderKind::Gemini));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let events: Vec<StageEvent> = h
        .generator
        .generate(USER, GenerationRequest::new("x"), cancel)
        .collect()
        .await;

    assert_eq!(count(&events, "complete"), 0);
    assert!(h.problems.list(USER).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_triple_run_continues_after_failed_pattern() {
    let h = harness(Scripted::new(ProviderKind::Gemini).failing_at(Some("B"), 2));
    let events: Vec<StageEvent> = h
        .generator
        .generate_three(USER, TripleRequest::default(), CancellationToken::new())
        .collect()
        .await;

    // A 5 个阶段 + B 2 个阶段 + C 5 个阶段
    assert_eq!(count(&events, "stage"), 12);
    assert!(events.iter().all(|e| match e {
        StageEvent::Stage { total, .. } => *total == 15,
        _ => true,
    }));
    assert!(events.iter().any(|e| matches!(
        e,
        StageEvent::Error { stage: 7, pattern: Some(p), .. } if p == "B"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        StageEvent::Stage { stage: 11, pattern_stage: Some(1), .. }
    )));

    let Some(StageEvent::Complete(Completion::Multiple { problems })) = events.last() else {
        panic!("最后一个事件应为 complete: {:?}", events.last());
    };
    let prompts: Vec<_> = problems.iter().map(|p| p.prompt.as_str()).collect();
    assert_eq!(prompts, ["3問題生成 パターンA", "3問題生成 パターンC"]);
    assert!(problems.iter().all(|p| p.subject == "math"));
    assert!(problems[0].conversation_history[0]
        .content
        .contains("（問題テキスト未提供）"));

    assert_eq!(h.problems.list(USER).await.unwrap().len(), 2);
    let usage = h.problems.usage(USER).await.unwrap();
    assert_eq!(usage.get(UsageCounter::ProblemGeneration), 1);
}

#[tokio::test]
async fn test_triple_run_all_patterns_failed() {
    let h = harness(Scripted::new(ProviderKind::Gemini).failing_at(None, 1));
    let events: Vec<StageEvent> = h
        .generator
        .generate_three(USER, TripleRequest::default(), CancellationToken::new())
        .collect()
        .await;

    assert_eq!(count(&events, "error"), 4);
    assert_eq!(count(&events, "complete"), 0);
    assert!(matches!(
        events.last(),
        Some(StageEvent::Error { stage: 15, pattern: None, .. })
    ));
    let usage = h.problems.usage(USER).await.unwrap();
    assert_eq!(usage.get(UsageCounter::ProblemGeneration), 0);
}

#[tokio::test]
async fn test_triple_run_uses_transcribed_documents() {
    let h = harness(Scripted::new(ProviderKind::Gemini));
    let request = TripleRequest {
        problem_documents: vec!["JVBERi0xLjQ=".to_string()],
        ..Default::default()
    };
    let events: Vec<StageEvent> = h
        .generator
        .generate_three(USER, request, CancellationToken::new())
        .collect()
        .await;

    let Some(StageEvent::Complete(Completion::Multiple { problems })) = events.last() else {
        panic!("最后一个事件应为 complete: {:?}", events.last());
    };
    assert_eq!(problems.len(), 3);
    assert!(problems[2].conversation_history[0]
        .content
        .starts_with("パターンC: 転写: 半径 3 の円"));
}

async fn saved_problem(h: &Harness) -> i64 {
    let fields = NewProblem {
        subject: "math".to_string(),
        prompt: "三角形".to_string(),
        content: "三角形ABCの面積を求めよ。".to_string(),
        conversation_history: vec![ChatTurn::user("作って"), ChatTurn::assistant("はい")],
        ..Default::default()
    };
    h.problems.save(USER, fields).await.unwrap().id
}

#[tokio::test]
async fn test_regenerate_figure_updates_image_and_history() {
    let h = harness(Scripted::new(ProviderKind::Gemini));
    let id = saved_problem(&h).await;

    let outcome = h
        .generator
        .regenerate_figure(id, USER, &ModelChoice::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RegenerateOutcome::Regenerated {
            image_base64: "aW1hZ2U=".to_string()
        }
    );

    let problem = h.problems.get(id, USER).await.unwrap().unwrap();
    assert_eq!(problem.image_base64.as_deref(), Some("aW1hZ2U="));
    assert_eq!(problem.conversation_history.len(), 4);
    let usage = h.problems.usage(USER).await.unwrap();
    assert_eq!(usage.get(UsageCounter::FigureRegeneration), 1);
}

#[tokio::test]
async fn test_regenerate_figure_without_code_leaves_problem_unchanged() {
    let h = harness(Scripted::new(ProviderKind::Gemini).without_figure());
    let id = saved_problem(&h).await;
    let before = h.problems.get(id, USER).await.unwrap().unwrap();

    let outcome = h
        .generator
        .regenerate_figure(id, USER, &ModelChoice::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, RegenerateOutcome::Failed { .. }));
    assert_eq!(h.problems.get(id, USER).await.unwrap().unwrap(), before);

    let other_user = h
        .generator
        .regenerate_figure(id, "someone-else", &ModelChoice::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(other_user, RegenerateOutcome::NotFound);
}

async fn assert_regeneration_failed_unchanged(h: &Harness) {
    let id = saved_problem(h).await;
    let before = h.problems.get(id, USER).await.unwrap().unwrap();

    let outcome = h
        .generator
        .regenerate_figure(id, USER, &ModelChoice::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, RegenerateOutcome::Failed { .. }), "{:?}", outcome);
    assert_eq!(h.problems.get(id, USER).await.unwrap().unwrap(), before);
    let usage = h.problems.usage(USER).await.unwrap();
    assert_eq!(usage.get(UsageCounter::FigureRegeneration), 0);
}

#[tokio::test]
async fn test_regenerate_figure_render_failure_leaves_problem_unchanged() {
    let provider: Arc<dyn LlmProvider> = Arc::new(Scripted::new(ProviderKind::Gemini));
    let h = harness_with(vec![provider], false);
    assert_regeneration_failed_unchanged(&h).await;
    assert_eq!(h.renderer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_regenerate_figure_provider_failure_leaves_problem_unchanged() {
    let h = harness(Scripted::new(ProviderKind::Gemini).failing_regeneration());
    assert_regeneration_failed_unchanged(&h).await;
    assert_eq!(h.renderer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_regenerate_figure_without_template_uses_builtin_prompt() {
    let h = harness(Scripted::new(ProviderKind::Gemini));
    let template = h.dir.path().join("prompts").join("geometry_regeneration.txt");
    std::fs::remove_file(template).unwrap();
    let id = saved_problem(&h).await;

    let outcome = h
        .generator
        .regenerate_figure(id, USER, &ModelChoice::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, RegenerateOutcome::Regenerated { .. }));

    let problem = h.problems.get(id, USER).await.unwrap().unwrap();
    let prompt = &problem.conversation_history[2].content;
    assert!(prompt.contains("描き直"), "{}", prompt);
    assert!(prompt.contains("三角形ABCの面積を求めよ。"), "{}", prompt);
}

#[tokio::test]
async fn test_quick_saves_two_turn_history() {
    let h = harness(Scripted::new(ProviderKind::Gemini));
    let request = QuickRequest {
        prompt: "三角形の面積の問題".to_string(),
        subject: "math".to_string(),
        units: vec!["図形と計量".to_string()],
        excluded_units: Vec::new(),
        difficulty: Some("標準".to_string()),
        choice: ModelChoice::default(),
    };

    let problem = h.generator.quick(USER, &request).await.unwrap();
    assert_eq!(problem.conversation_history.len(), 2);
    assert_eq!(problem.conversation_history[0].content, "三角形の面積の問題");
    assert!(problem.content.contains("三角形ABC"));
    assert_eq!(problem.image_base64.as_deref(), Some("aW1hZ2U="));
    let usage = h.problems.usage(USER).await.unwrap();
    assert_eq!(usage.get(UsageCounter::ProblemGeneration), 1);
}

#[tokio::test]
async fn test_preview_reads_documents_and_counts() {
    let h = harness(Scripted::new(ProviderKind::Gemini));
    let texts = h
        .generator
        .preview(USER, &["JVBERi0=".to_string()], &ModelChoice::default())
        .await
        .unwrap();
    assert_eq!(texts, ["転写: 半径 3 の円の面積を求めよ。"]);
    let usage = h.problems.usage(USER).await.unwrap();
    assert_eq!(usage.get(UsageCounter::Preview), 1);
}

#[tokio::test]
async fn test_preview_with_only_openai_reports_per_file_error() {
    let h = harness(Scripted::new(ProviderKind::OpenAi));
    let texts = h
        .generator
        .preview(USER, &["JVBERi0=".to_string(), "JVBERi0=".to_string()], &ModelChoice::default())
        .await
        .unwrap();
    assert_eq!(texts.len(), 2);
    assert!(texts.iter().all(|t| t.starts_with("抽出エラー: ")));
}

#[tokio::test]
async fn test_concurrent_counter_increments() {
    let problems = ProblemService::new(Arc::new(InMemoryStore::new()));
    let handles: Vec<_> = (0..20)
        .map(|_| {
            let problems = problems.clone();
            tokio::spawn(async move {
                problems.record_usage(USER, UsageCounter::ProblemGeneration).await;
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    let usage = problems.usage(USER).await.unwrap();
    assert_eq!(usage.get(UsageCounter::ProblemGeneration), 20);
}

#[test]
fn test_template_substitution() {
    let rendered = render_template(
        "Hello {NAME}, units: {UNITS} {MISSING}",
        &[("NAME", "Taro"), ("UNITS", "algebra")],
    );
    assert_eq!(rendered, "Hello Taro, units: algebra {MISSING}");

    // 注入的值里的占位符不再展开
    let rendered = render_template(
        "{USER_PROMPT} / {UNITS}",
        &[("USER_PROMPT", "{UNITS} を使う"), ("UNITS", "確率")],
    );
    assert_eq!(rendered, "{UNITS} を使う / 確率");
}

#[tokio::test]
#[ignore] // 需要真实的 API Key：cargo test -- --ignored
async fn test_live_single_generation() {
    let _ = dotenvy::dotenv();
    let config = mongene::Config::from_env().expect("读取配置失败");
    mongene::logger::init(&config.log_level);

    let app = mongene::App::initialize(config).await.expect("初始化失败");
    let events: Vec<StageEvent> = app
        .generator()
        .generate(USER, GenerationRequest::new("立方体の切断の問題"), CancellationToken::new())
        .collect()
        .await;

    assert!(matches!(events.last(), Some(StageEvent::Complete(_))));
}
