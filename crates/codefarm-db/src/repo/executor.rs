//! Executor repository.

use async_trait::async_trait;
use codefarm_core::ExecutorId;
use codefarm_core::executor::ExecutorRecord;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::{DbError, DbResult};

#[async_trait]
pub trait ExecutorRepo: Send + Sync {
    /// Insert or replace a record.
    async fn save(&self, record: &ExecutorRecord) -> DbResult<()>;
    async fn get(&self, id: ExecutorId) -> DbResult<ExecutorRecord>;
    /// Records that have not reached a terminal state.
    async fn find_active(&self) -> DbResult<Vec<ExecutorRecord>>;
    async fn remove(&self, id: ExecutorId) -> DbResult<()>;
}

/// In-memory implementation of ExecutorRepo.
#[derive(Default)]
pub struct MemExecutorRepo {
    records: RwLock<BTreeMap<ExecutorId, ExecutorRecord>>,
}

impl MemExecutorRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutorRepo for MemExecutorRepo {
    async fn save(&self, record: &ExecutorRecord) -> DbResult<()> {
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: ExecutorId) -> DbResult<ExecutorRecord> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("executor {}", id)))
    }

    async fn find_active(&self) -> DbResult<Vec<ExecutorRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn remove(&self, id: ExecutorId) -> DbResult<()> {
        match self.records.write().await.remove(&id) {
            Some(_) => Ok(()),
            None => Err(DbError::NotFound(format!("executor {}", id))),
        }
    }
}
