use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{ProblemStore, StoreState};
use crate::error::StoreError;
use crate::models::{NewProblem, Problem, ProblemId, ProblemPatch, UsageCounter, UsageCounters};

/// 进程内存储
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProblemStore for InMemoryStore {
    async fn create(&self, user_id: &str, fields: NewProblem) -> Result<Problem, StoreError> {
        Ok(self.state.lock().await.create(user_id, fields, Utc::now()))
    }

    async fn get(&self, id: ProblemId, user_id: &str) -> Result<Option<Problem>, StoreError> {
        Ok(self.state.lock().await.get(id, user_id))
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Problem>, StoreError> {
        Ok(self.state.lock().await.list(user_id))
    }

    async fn update(
        &self,
        id: ProblemId,
        user_id: &str,
        patch: ProblemPatch,
    ) -> Result<Option<Problem>, StoreError> {
        Ok(self.state.lock().await.update(id, user_id, patch, Utc::now()))
    }

    async fn delete(&self, id: ProblemId, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.delete(id, user_id))
    }

    async fn increment_counter(
        &self,
        user_id: &str,
        counter: UsageCounter,
    ) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.increment(user_id, counter))
    }

    async fn counters(&self, user_id: &str) -> Result<UsageCounters, StoreError> {
        Ok(self.state.lock().await.counters(user_id))
    }
}
