//! JSON 文件存储
//!
//! 启动时整体读入内存，每次修改先写临时文件再重命名。
//! 写盘失败时内存中的数据保持修改前的状态。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ProblemStore, StoreState};
use crate::error::StoreError;
use crate::models::{NewProblem, Problem, ProblemId, ProblemPatch, UsageCounter, UsageCounters};

/// JSON 文件存储
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonFileStore {
    /// 打开存储文件，文件不存在时从空数据开始
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => StoreState::default(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupted {
                path: path.display().to_string(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("存储文件不存在，创建新存储: {}", path.display());
                StoreState::default()
            }
            Err(source) => {
                return Err(StoreError::ReadFailed {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 在副本上执行修改，写盘成功后再替换内存数据
    async fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> Result<T, StoreError> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let result = f(&mut next);
        self.persist(&next).await?;
        *guard = next;
        Ok(result)
    }

    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let write_failed = |source: std::io::Error| StoreError::WriteFailed {
            path: self.path.display().to_string(),
            source,
        };

        let bytes = serde_json::to_vec_pretty(state).map_err(|e| {
            write_failed(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(write_failed)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            warn!("⚠️  存储文件替换失败: {}", e);
            write_failed(e)
        })?;
        Ok(())
    }
}

#[async_trait]
impl ProblemStore for JsonFileStore {
    async fn create(&self, user_id: &str, fields: NewProblem) -> Result<Problem, StoreError> {
        self.mutate(|state| state.create(user_id, fields, Utc::now())).await
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
        self.mutate(|state| state.update(id, user_id, patch, Utc::now())).await
    }

    async fn delete(&self, id: ProblemId, user_id: &str) -> Result<bool, StoreError> {
        self.mutate(|state| state.delete(id, user_id)).await
    }

    async fn increment_counter(
        &self,
        user_id: &str,
        counter: UsageCounter,
    ) -> Result<u64, StoreError> {
        self.mutate(|state| state.increment(user_id, counter)).await
    }

    async fn counters(&self, user_id: &str) -> Result<UsageCounters, StoreError> {
        Ok(self.state.lock().await.counters(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        let problem = store
            .create(
                "u1",
                NewProblem {
                    subject: "math".to_string(),
                    content: "正四面体".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .increment_counter("u1", UsageCounter::FigureRegeneration)
            .await
            .unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let loaded = reopened.get(problem.id, "u1").await.unwrap().unwrap();
        assert_eq!(loaded.content, "正四面体");
        assert_eq!(
            reopened.counters("u1").await.unwrap().figure_regeneration_count,
            1
        );

        // 新 ID 不会与已有记录冲突
        let next = reopened
            .create("u1", NewProblem::default())
            .await
            .unwrap();
        assert!(next.id > problem.id);
    }

    #[tokio::test]
    async fn test_corrupted_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = JsonFileStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { .. }));
    }
}
