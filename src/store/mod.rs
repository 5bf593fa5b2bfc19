//! 持久化 - 基础设施层
//!
//! 题目记录和用户计数器的存取，所有操作都按用户隔离：
//! 记录不存在和不属于该用户的结果相同（`None` / `false`）。
//!
//! - `memory` - 进程内存储，用于测试和临时运行
//! - `json_file` - 单个 JSON 文件，每次修改后整体写回

pub mod json_file;
pub mod memory;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::error::StoreError;
use crate::models::{
    NewProblem, Problem, ProblemId, ProblemPatch, ProblemQuery, UsageCounter, UsageCounters,
};

pub use json_file::JsonFileStore;
pub use memory::InMemoryStore;

/// 题目存储
#[async_trait]
pub trait ProblemStore: Send + Sync {
    /// 新建记录，返回带 ID 和时间戳的完整记录
    async fn create(&self, user_id: &str, fields: NewProblem) -> Result<Problem, StoreError>;

    async fn get(&self, id: ProblemId, user_id: &str) -> Result<Option<Problem>, StoreError>;

    /// 该用户的全部记录，新的在前
    async fn list(&self, user_id: &str) -> Result<Vec<Problem>, StoreError>;

    /// 部分更新，返回更新后的记录
    async fn update(
        &self,
        id: ProblemId,
        user_id: &str,
        patch: ProblemPatch,
    ) -> Result<Option<Problem>, StoreError>;

    async fn delete(&self, id: ProblemId, user_id: &str) -> Result<bool, StoreError>;

    /// 计数器原子加一，返回新值
    async fn increment_counter(
        &self,
        user_id: &str,
        counter: UsageCounter,
    ) -> Result<u64, StoreError>;

    async fn counters(&self, user_id: &str) -> Result<UsageCounters, StoreError>;

    /// 按条件检索，新的在前
    async fn search(
        &self,
        user_id: &str,
        query: &ProblemQuery,
    ) -> Result<Vec<Problem>, StoreError> {
        Ok(self
            .list(user_id)
            .await?
            .into_iter()
            .filter(|p| query.matches(p))
            .collect())
    }
}

/// 根据配置创建存储：配置了文件路径用 JSON 文件，否则用内存
pub async fn from_config(config: &Config) -> Result<Arc<dyn ProblemStore>, StoreError> {
    match &config.store_file {
        Some(path) => {
            let store = JsonFileStore::open(path).await?;
            info!("💾 使用 JSON 文件存储: {}", path.display());
            Ok(Arc::new(store))
        }
        None => {
            info!("💾 使用内存存储（进程退出后数据丢失）");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

/// 两种存储共用的数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    #[serde(default)]
    next_id: ProblemId,
    #[serde(default)]
    problems: BTreeMap<ProblemId, Problem>,
    #[serde(default)]
    counters: HashMap<String, UsageCounters>,
}

impl StoreState {
    pub(crate) fn create(
        &mut self,
        user_id: &str,
        fields: NewProblem,
        now: DateTime<Utc>,
    ) -> Problem {
        self.next_id += 1;
        let problem = Problem {
            id: self.next_id,
            user_id: user_id.to_string(),
            subject: fields.subject,
            prompt: fields.prompt,
            content: fields.content,
            solution: fields.solution,
            image_base64: fields.image_base64,
            conversation_history: fields.conversation_history,
            check_info: None,
            created_at: now,
            updated_at: now,
        };
        self.problems.insert(problem.id, problem.clone());
        problem
    }

    pub(crate) fn get(&self, id: ProblemId, user_id: &str) -> Option<Problem> {
        self.problems
            .get(&id)
            .filter(|p| p.user_id == user_id)
            .cloned()
    }

    pub(crate) fn list(&self, user_id: &str) -> Vec<Problem> {
        let mut problems: Vec<Problem> = self
            .problems
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        problems.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        problems
    }

    pub(crate) fn update(
        &mut self,
        id: ProblemId,
        user_id: &str,
        patch: ProblemPatch,
        now: DateTime<Utc>,
    ) -> Option<Problem> {
        let problem = self
            .problems
            .get_mut(&id)
            .filter(|p| p.user_id == user_id)?;
        patch.apply(problem, now);
        Some(problem.clone())
    }

    pub(crate) fn delete(&mut self, id: ProblemId, user_id: &str) -> bool {
        let owned = self.problems.get(&id).is_some_and(|p| p.user_id == user_id);
        if owned {
            self.problems.remove(&id);
        }
        owned
    }

    pub(crate) fn increment(&mut self, user_id: &str, counter: UsageCounter) -> u64 {
        self.counters.entry(user_id.to_string()).or_default().bump(counter)
    }

    pub(crate) fn counters(&self, user_id: &str) -> UsageCounters {
        self.counters.get(user_id).copied().unwrap_or_default()
    }
}
