//! The mutable per-instance execution record.
//!
//! This is the full durable state itself (context, retry bookkeeping,
//! wait metadata, cancellation), not a projection replayed from an event
//! log. The engine persists a single mutable row per execution, not an
//! append-only event stream.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Waiting,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Waiting
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Cancelling => "cancelling",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationSource {
    User,
    Timeout,
    System,
    Parent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cancellation {
    pub source: CancellationSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionError {
    pub fn from_engine_error(err: &EngineError, step_id: Option<String>) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
            step_id,
            details: err.details.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub execution_timeout_ms: i64,
    pub wait_timeout_ms: i64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: 24 * 60 * 60 * 1000,
            wait_timeout_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_id: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// The durable per-instance record the engine loads, mutates and saves on
/// every [`crate::engine::Engine::tick`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub flow_id: String,
    pub flow_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    pub status: ExecutionStatus,
    pub current_step_id: String,
    pub context: BTreeMap<String, Value>,
    pub step_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_started_at: Option<DateTime<Utc>>,
    pub timeout_config: TimeoutConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,

    #[serde(default)]
    pub retry_attempts: BTreeMap<String, u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<Cancellation>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn new_pending(
        id: Option<String>,
        flow_id: String,
        flow_version: String,
        initial_step_id: String,
        context: BTreeMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.unwrap_or_else(|| Uuid::now_v7().to_string()),
            flow_id,
            flow_version,
            tenant_id: None,
            parent_execution_id: None,
            metadata: None,
            status: ExecutionStatus::Pending,
            current_step_id: initial_step_id,
            context,
            step_count: 0,
            history: Vec::new(),
            wake_at: None,
            wait_reason: None,
            wait_started_at: None,
            timeout_config: TimeoutConfig::default(),
            error: None,
            retry_attempts: BTreeMap::new(),
            cancellation: None,
            idempotency_key: None,
            idempotency_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn ensure_mutable(&self) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::new(
                ErrorCode::ExecutionCancelled,
                format!("execution {} is already in terminal status {}", self.id, self.status),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pending_defaults() {
        let exec = Execution::new_pending(
            None,
            "simple".into(),
            "1".into(),
            "start".into(),
            BTreeMap::new(),
        );
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.step_count, 0);
        assert_eq!(exec.current_step_id, "start");
        assert!(exec.history.is_empty());
    }

    #[test]
    fn terminal_statuses_freeze() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Cancelling.is_terminal());
        assert!(!ExecutionStatus::Waiting.is_terminal());
    }
}
