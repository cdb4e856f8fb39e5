//! The durable state-store contract.
//!
//! Built around this engine's single-mutable-record model: no event log,
//! no task queue, no worker registry. `save` replaces the whole record,
//! and serializing concurrent ticks against the same execution is the
//! store's responsibility.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::model::{Execution, ExecutionStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    NotFound(String),
    #[error("concurrent modification of execution {0}")]
    ConcurrencyConflict(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Durable CRUD plus the indexed queries the engine's driver loop and
/// cancellation cascade need.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    async fn load(&self, id: &str) -> Result<Option<Execution>, StoreError>;

    async fn save(&self, execution: &Execution) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn list_wake_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Create-time dedup lookup. `window_ms` bounds how stale a match may
    /// be, but never extends a stored `idempotency_expires_at`.
    async fn find_by_idempotency_key(
        &self,
        flow_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Execution>, StoreError> {
        let _ = (flow_id, key, now);
        Ok(None)
    }

    async fn find_children(&self, parent_id: &str) -> Result<Vec<Execution>, StoreError> {
        let _ = parent_id;
        Ok(Vec::new())
    }

    async fn find_timed_out_executions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError> {
        let _ = now;
        Ok(Vec::new())
    }

    async fn find_timed_out_waits(&self, now: DateTime<Utc>) -> Result<Vec<Execution>, StoreError> {
        let _ = now;
        Ok(Vec::new())
    }
}
