//! 题目服务 - 业务能力层
//!
//! 在存储之上提供按用户的增删改查、检索、审核信息和使用量统计，
//! 以及 PDF 导出。

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{AppResult, StoreError};
use crate::models::{
    CheckInfo, NewProblem, Problem, ProblemId, ProblemPatch, ProblemQuery, UsageCounter,
    UsageCounters,
};
use crate::rendering::{export_problem_pdf, load_font, ExportDocument};
use crate::store::ProblemStore;

/// 题目服务
#[derive(Clone)]
pub struct ProblemService {
    store: Arc<dyn ProblemStore>,
    /// PDF 导出时按顺序尝试的字体
    font_paths: Arc<Vec<PathBuf>>,
}

impl ProblemService {
    pub fn new(store: Arc<dyn ProblemStore>) -> Self {
        Self {
            store,
            font_paths: Arc::new(Vec::new()),
        }
    }

    pub fn with_font_paths(mut self, font_paths: Vec<PathBuf>) -> Self {
        self.font_paths = Arc::new(font_paths);
        self
    }

    /// 保存生成结果
    pub async fn save(&self, user_id: &str, fields: NewProblem) -> Result<Problem, StoreError> {
        let problem = self.store.create(user_id, fields).await?;
        info!("💾 已保存题目 #{} (用户: {})", problem.id, user_id);
        Ok(problem)
    }

    pub async fn list(&self, user_id: &str) -> AppResult<Vec<Problem>> {
        Ok(self.store.list(user_id).await?)
    }

    pub async fn get(&self, id: ProblemId, user_id: &str) -> AppResult<Option<Problem>> {
        Ok(self.store.get(id, user_id).await?)
    }

    pub async fn update(
        &self,
        id: ProblemId,
        user_id: &str,
        patch: ProblemPatch,
    ) -> Result<Option<Problem>, StoreError> {
        self.store.update(id, user_id, patch).await
    }

    /// 替换审核信息
    pub async fn update_check_info(
        &self,
        id: ProblemId,
        user_id: &str,
        check_info: CheckInfo,
    ) -> AppResult<Option<Problem>> {
        let patch = ProblemPatch {
            check_info: Some(check_info),
            ..Default::default()
        };
        Ok(self.store.update(id, user_id, patch).await?)
    }

    pub async fn delete(&self, id: ProblemId, user_id: &str) -> AppResult<bool> {
        let deleted = self.store.delete(id, user_id).await?;
        if deleted {
            info!("🗑️  已删除题目 #{} (用户: {})", id, user_id);
        }
        Ok(deleted)
    }

    pub async fn search(&self, user_id: &str, query: &ProblemQuery) -> AppResult<Vec<Problem>> {
        let found = self.store.search(user_id, query).await?;
        debug!("检索到 {} 道题目 (用户: {})", found.len(), user_id);
        Ok(found)
    }

    /// 计数器加一，失败只记录警告
    pub async fn record_usage(&self, user_id: &str, counter: UsageCounter) {
        match self.store.increment_counter(user_id, counter).await {
            Ok(value) => debug!("{} → {} (用户: {})", counter, value, user_id),
            Err(e) => warn!("⚠️  计数器 {} 更新失败 (用户: {}): {}", counter, user_id, e),
        }
    }

    pub async fn usage(&self, user_id: &str) -> AppResult<UsageCounters> {
        Ok(self.store.counters(user_id).await?)
    }

    /// 把题目导出为 PDF，题目不存在时返回 None
    pub async fn export_pdf(
        &self,
        id: ProblemId,
        user_id: &str,
        include_solution: bool,
    ) -> AppResult<Option<Vec<u8>>> {
        let Some(problem) = self.store.get(id, user_id).await? else {
            return Ok(None);
        };
        let document = ExportDocument {
            content: problem.content,
            solution: include_solution.then_some(problem.solution),
            image_base64: problem.image_base64,
        };
        let font = load_font(&self.font_paths).await;
        Ok(Some(export_problem_pdf(&document, &font)?))
    }
}
