//! Reference in-memory [`ExecutionStore`], the single persistence backend
//! this crate ships. A production SQL/KV backend implements the same
//! trait out of tree.
//!
//! A `parking_lot`-guarded `RwLock<HashMap<String, Execution>>` plus a
//! companion `Mutex` per execution id, exposed via the async-trait shape
//! every other collaborator here uses. The per-id mutex is what gives a
//! store the at-most-one-concurrent-tick guarantee.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use super::model::{Execution, ExecutionStatus};
use super::store::{ExecutionStore, StoreError};

#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<String, Execution>>,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the per-execution lock a caller should hold for the whole
    /// load-mutate-save span of a single Tick.
    pub fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().get(id) {
            return lock.clone();
        }
        self.locks
            .write()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.executions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn load(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self.executions.read().get(id).cloned())
    }

    async fn save(&self, execution: &Execution) -> Result<(), StoreError> {
        self.executions
            .write()
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.executions.write().remove(id).is_some())
    }

    async fn list_wake_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let executions = self.executions.read();
        Ok(executions
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Waiting
                    && e.wake_at.map(|wake_at| wake_at <= now).unwrap_or(false)
            })
            .take(limit)
            .map(|e| e.id.clone())
            .collect())
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read();
        Ok(executions
            .values()
            .filter(|e| e.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_by_idempotency_key(
        &self,
        flow_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Execution>, StoreError> {
        let executions = self.executions.read();
        Ok(executions
            .values()
            .find(|e| {
                e.flow_id == flow_id
                    && e.idempotency_key.as_deref() == Some(key)
                    && e.idempotency_expires_at
                        .map(|expiry| now < expiry)
                        .unwrap_or(false)
            })
            .cloned())
    }

    async fn find_children(&self, parent_id: &str) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read();
        Ok(executions
            .values()
            .filter(|e| e.parent_execution_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn find_timed_out_executions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read();
        Ok(executions
            .values()
            .filter(|e| {
                !e.status.is_terminal()
                    && (now - e.created_at).num_milliseconds()
                        >= e.timeout_config.execution_timeout_ms
            })
            .cloned()
            .collect())
    }

    async fn find_timed_out_waits(&self, now: DateTime<Utc>) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read();
        Ok(executions
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Waiting
                    && e.wait_started_at
                        .map(|started| {
                            (now - started).num_milliseconds() >= e.timeout_config.wait_timeout_ms
                        })
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}
