use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::Engine;
use clap::{Args, Parser, Subcommand};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mongene::config::Config;
use mongene::logger;
use mongene::models::{
    CheckInfo, GenerationRequest, ModelChoice, ProblemId, ProblemQuery, QuickRequest, StageEvent,
    TripleRequest,
};
use mongene::orchestrator::App;

/// 多阶段数学题生成
#[derive(Debug, Parser)]
#[command(name = "mongene", version)]
struct Cli {
    /// TOML 配置文件（环境变量优先）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 用户 ID
    #[arg(long, global = true, default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ModelArgs {
    /// 提供方：openai / claude / gemini
    #[arg(long)]
    api: Option<String>,
    /// 模型名称或别名
    #[arg(long)]
    model: Option<String>,
}

impl From<ModelArgs> for ModelChoice {
    fn from(args: ModelArgs) -> Self {
        ModelChoice {
            api: args.api,
            model: args.model,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 五阶段生成一道题，逐行输出事件
    Generate {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "math")]
        subject: String,
        #[arg(long = "unit")]
        units: Vec<String>,
        #[arg(long = "exclude")]
        excluded_units: Vec<String>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// 根据原题 PDF 生成 A/B/C 三道题，逐行输出事件
    GenerateThree {
        /// 原题 PDF 文件
        #[arg(long = "pdf")]
        pdfs: Vec<PathBuf>,
        #[arg(long = "exclude")]
        excluded_units: Vec<String>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// 一次调用生成一道题
    Quick {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "math")]
        subject: String,
        #[arg(long = "unit")]
        units: Vec<String>,
        #[arg(long = "exclude")]
        excluded_units: Vec<String>,
        #[arg(long)]
        difficulty: Option<String>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// 为已保存的题目重新生成图形
    RegenerateFigure {
        id: ProblemId,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// 列出自己的题目
    List,
    /// 查看一道题
    Show { id: ProblemId },
    /// 检索题目
    Search {
        #[arg(long)]
        keyword: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long = "unit")]
        units: Vec<String>,
        #[arg(long)]
        year: Option<String>,
        #[arg(long)]
        exam_session: Option<String>,
        /// true 只看已审核，false 只看未审核
        #[arg(long)]
        checked: Option<bool>,
    },
    /// 更新审核信息
    Check {
        id: ProblemId,
        #[arg(long)]
        problem_text_ok: bool,
        #[arg(long)]
        solution_ok: bool,
        #[arg(long)]
        figure_ok: bool,
        #[arg(long = "unit")]
        units: Vec<String>,
        #[arg(long)]
        year: Option<String>,
        #[arg(long)]
        exam_session: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// 删除一道题
    Delete { id: ProblemId },
    /// 导出为 PDF
    ExportPdf {
        id: ProblemId,
        #[arg(long, short)]
        output: PathBuf,
        /// 不包含解答
        #[arg(long)]
        no_solution: bool,
    },
    /// 把 PDF 转写为文字
    Preview {
        pdfs: Vec<PathBuf>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// 查看使用量
    Usage,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // 加载配置
    let config = Config::load(cli.config.as_deref())?;

    // 初始化日志
    logger::init(&config.log_level);

    let app = App::initialize(config).await?;
    run(&app, &cli.user, cli.command).await
}

async fn run(app: &App, user: &str, command: Command) -> Result<()> {
    match command {
        Command::Generate {
            prompt,
            subject,
            units,
            excluded_units,
            model,
        } => {
            let request = GenerationRequest {
                prompt,
                subject,
                units,
                excluded_units,
                choice: model.into(),
            };
            let cancel = cancel_on_ctrl_c();
            let events = app.generator().generate(user, request, cancel);
            stream_events(events).await
        }
        Command::GenerateThree {
            pdfs,
            excluded_units,
            model,
        } => {
            let request = TripleRequest {
                problem_documents: read_pdfs(&pdfs).await?,
                excluded_units,
                choice: model.into(),
            };
            let cancel = cancel_on_ctrl_c();
            let events = app.generator().generate_three(user, request, cancel);
            stream_events(events).await
        }
        Command::Quick {
            prompt,
            subject,
            units,
            excluded_units,
            difficulty,
            model,
        } => {
            let request = QuickRequest {
                prompt,
                subject,
                units,
                excluded_units,
                difficulty,
                choice: model.into(),
            };
            let problem = app.generator().quick(user, &request).await?;
            print_json(&problem)
        }
        Command::RegenerateFigure { id, model } => {
            let cancel = cancel_on_ctrl_c();
            let outcome = app
                .generator()
                .regenerate_figure(id, user, &model.into(), &cancel)
                .await?;
            print_json(&outcome)
        }
        Command::List => print_json(&app.problems().list(user).await?),
        Command::Show { id } => match app.problems().get(id, user).await? {
            Some(problem) => print_json(&problem),
            None => bail!("题目 #{} 不存在", id),
        },
        Command::Search {
            keyword,
            subject,
            units,
            year,
            exam_session,
            checked,
        } => {
            let query = ProblemQuery {
                keyword,
                subject,
                units: (!units.is_empty()).then_some(units),
                year,
                exam_session,
                is_checked: checked,
            };
            print_json(&app.problems().search(user, &query).await?)
        }
        Command::Check {
            id,
            problem_text_ok,
            solution_ok,
            figure_ok,
            units,
            year,
            exam_session,
            tags,
        } => {
            let check_info = CheckInfo {
                problem_text_ok,
                solution_ok,
                figure_ok,
                units: (!units.is_empty()).then_some(units),
                year,
                exam_session,
                tags: (!tags.is_empty()).then_some(tags),
            };
            match app.problems().update_check_info(id, user, check_info).await? {
                Some(problem) => print_json(&problem),
                None => bail!("题目 #{} 不存在", id),
            }
        }
        Command::Delete { id } => {
            if !app.problems().delete(id, user).await? {
                bail!("题目 #{} 不存在", id);
            }
            Ok(())
        }
        Command::ExportPdf {
            id,
            output,
            no_solution,
        } => {
            let Some(bytes) = app.problems().export_pdf(id, user, !no_solution).await? else {
                bail!("题目 #{} 不存在", id);
            };
            tokio::fs::write(&output, bytes)
                .await
                .with_context(|| format!("写入 PDF 失败: {}", output.display()))?;
            info!("📄 已导出: {}", output.display());
            Ok(())
        }
        Command::Preview { pdfs, model } => {
            let documents = read_pdfs(&pdfs).await?;
            let texts = app
                .generator()
                .preview(user, &documents, &model.into())
                .await?;
            print_json(&texts)
        }
        Command::Usage => print_json(&app.problems().usage(user).await?),
    }
}

/// Ctrl-C 时取消运行
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⏹️  收到中断信号，正在取消...");
            token.cancel();
        }
    });
    cancel
}

/// 逐行输出事件，以 error 结束时返回错误
async fn stream_events(mut events: impl Stream<Item = StageEvent> + Unpin) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut last = None;
    while let Some(event) = events.next().await {
        stdout.write_all(event.to_ndjson_line()?.as_bytes()).await?;
        stdout.flush().await?;
        last = Some(event);
    }
    match last {
        Some(StageEvent::Complete(_)) => Ok(()),
        Some(StageEvent::Error { message, .. }) => bail!("生成失败: {}", message),
        _ => bail!("生成未完成"),
    }
}

async fn read_pdfs(paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        documents.push(read_base64(path).await?);
    }
    Ok(documents)
}

async fn read_base64(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("读取文件失败: {}", path.display()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
