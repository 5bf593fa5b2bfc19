//! 应用装配 - 编排层
//!
//! ## 职责
//!
//! 1. **应用初始化**：根据配置创建提供方注册表、模板解析器、渲染器和存储
//! 2. **资源所有者**：唯一持有这些共享资源的模块
//! 3. **向下委托**：生成类操作交给 `ProblemGenerator`，题目管理交给 `ProblemService`

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::AppResult;
use crate::orchestrator::generator::{GeneratorSettings, ProblemGenerator};
use crate::providers::ProviderRegistry;
use crate::rendering;
use crate::services::{ProblemService, TemplateResolver};
use crate::store;
use crate::utils::logging::log_startup;

/// 应用主结构
pub struct App {
    config: Config,
    generator: Arc<ProblemGenerator>,
    problems: ProblemService,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> AppResult<Self> {
        let registry = Arc::new(ProviderRegistry::from_config(&config));
        log_startup(&config, &registry.available());

        let templates = Arc::new(TemplateResolver::new(
            config.prompts_dir.clone(),
            config.samples_dir.clone(),
        ));
        let renderer = rendering::from_config(&config);
        let problems = ProblemService::new(store::from_config(&config).await?)
            .with_font_paths(config.pdf_font_paths.clone());

        let settings = GeneratorSettings {
            reference_sample_limit: config.reference_sample_limit,
            excerpt_chars: config.excerpt_chars,
        };
        let generator = Arc::new(ProblemGenerator::new(
            registry,
            templates,
            renderer,
            problems.clone(),
            settings,
        ));

        info!("✓ 初始化完成 (模板目录: {})", config.prompts_dir.display());

        Ok(Self {
            config,
            generator,
            problems,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn generator(&self) -> &Arc<ProblemGenerator> {
        &self.generator
    }

    pub fn problems(&self) -> &ProblemService {
        &self.problems
    }
}
