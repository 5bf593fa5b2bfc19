//! # Mongene
//!
//! 多阶段数学题生成服务：把一次出题拆成五个阶段与 AI 模型对话，
//! 在第 3 阶段渲染图形，最后提取问题文和解答并保存。
//!
//! ## 架构设计
//!
//! 本系统采用四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `providers/` - OpenAI / Claude / Gemini 三种后端与注册表
//! - `rendering/` - 图形渲染（声明式 sketch、子进程 sandbox）和 PDF 导出
//! - `store/` - 题目与使用量的持久化（内存 / JSON 文件）
//!
//! ### ② 业务能力层（Services）
//! - `LlmService` - 绑定了模型的对话能力
//! - `TemplateResolver` - 提示词模板与参考样题
//! - `ProblemService` - 题目管理、检索、计数器
//! - `extraction` - 从回复中提取问题文、解答和图形代码
//!
//! ### ③ 流程层（Workflow）
//! - `StageFlow` - 一个五阶段子运行
//! - `RegenerateFlow` - 已保存题目的图形重新生成
//!
//! ### ④ 编排层（Orchestration）
//! - `App` - 资源装配
//! - `ProblemGenerator` - 单题 / 三题 / 一次性生成与事件推送
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod logger;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod rendering;
pub mod services;
pub mod store;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use models::{GenerationRequest, ModelChoice, Problem, StageEvent, TripleRequest};
pub use orchestrator::{App, ProblemGenerator};
pub use workflow::{RegenerateOutcome, StageFlow};
