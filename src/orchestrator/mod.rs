//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责装配资源和调度生成运行，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 应用装配
//! - 根据配置创建提供方、模板、渲染器和存储
//! - 持有共享资源
//!
//! ### `generator` - 题目生成器
//! - 解析模型选择，准备提示词
//! - 单题运行一个 `StageFlow`，三题依次运行 A、B、C
//! - 通过有界通道推送事件，负责计数器
//!
//! ## 层次关系
//!
//! ```text
//! app (装配资源)
//!     ↓
//! generator (处理一次运行，1 或 3 个子运行)
//!     ↓
//! workflow::StageFlow (处理单个子运行的 5 个阶段)
//!     ↓
//! services (能力层：llm / template / problem / extraction)
//!     ↓
//! providers / rendering / store (基础设施)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一职责**：app 管资源，generator 管运行
//! 2. **向下依赖**：编排层 → workflow → services → 基础设施
//! 3. **按运行计数**：计数器只在编排层增加

pub mod app;
pub mod generator;

pub use app::App;
pub use generator::{GeneratorSettings, ProblemGenerator, PATTERNS};
