//! Fire-and-forget projection of step outputs into typed external tables.
//!
//! The `TableStore`/`Wal` split follows the same mold as every other
//! collaborator contract here: `#[async_trait]`, a dedicated error enum,
//! `dashmap`-style keyed storage for the in-memory reference impl. Write
//! failures here must never affect the execution's own outcome, the same
//! "never block or fail the caller" posture the event bus is written to.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::events::{EngineEvent, EventBus};
use crate::flow::{Pipe, PipeOn};

/// Which branch of a step's three-way outcome just fired, for matching
/// against a pipe's `on` filter. A wait is neither a success nor a
/// failure, so it only ever fires `PipeOn::Any` pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOutcome {
    Success,
    Failure,
    Wait,
}

impl PipeOutcome {
    fn fires(self, on: PipeOn) -> bool {
        match on {
            PipeOn::Success => self == PipeOutcome::Success,
            PipeOn::Failure => self == PipeOutcome::Failure,
            PipeOn::Any => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("table '{0}' not found")]
    UnknownTable(String),
    #[error("row not found")]
    RowNotFound,
    #[error("table backend error: {0}")]
    Backend(String),
}

/// Equality filter plus paging/ordering for [`TableStore::query`]. Kept
/// deliberately small, a production SQL-backed store would translate this
/// into a real `WHERE`/`ORDER BY`/`LIMIT`/`OFFSET` clause.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    pub equals: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

#[async_trait]
pub trait TableStore: Send + Sync + 'static {
    async fn insert(
        &self,
        table_id: &str,
        row: BTreeMap<String, Value>,
        tenant_id: Option<&str>,
    ) -> Result<String, TableError>;

    /// Default impl inserts rows one at a time; a production backend
    /// overrides this with a real batched write.
    async fn insert_batch(
        &self,
        table_id: &str,
        rows: Vec<BTreeMap<String, Value>>,
        tenant_id: Option<&str>,
    ) -> Result<Vec<String>, TableError> {
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(self.insert(table_id, row, tenant_id).await?);
        }
        Ok(ids)
    }

    async fn get(&self, table_id: &str, row_id: &str) -> Result<Option<Value>, TableError>;

    async fn query(
        &self,
        table_id: &str,
        filter: RowFilter,
        order_by: Option<OrderBy>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Value>, TableError>;

    async fn update(
        &self,
        table_id: &str,
        row_id: &str,
        patch: BTreeMap<String, Value>,
    ) -> Result<(), TableError>;

    async fn delete(&self, table_id: &str, row_id: &str) -> Result<bool, TableError>;

    async fn count(&self, table_id: &str) -> Result<usize, TableError>;
}

/// Reference [`TableStore`]: one `Vec` of rows per table id.
#[derive(Default)]
pub struct InMemoryTableStore {
    tables: DashMap<String, Vec<(String, Value)>>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn insert(
        &self,
        table_id: &str,
        mut row: BTreeMap<String, Value>,
        tenant_id: Option<&str>,
    ) -> Result<String, TableError> {
        if let Some(tenant) = tenant_id {
            row.insert("tenant_id".to_string(), Value::String(tenant.to_string()));
        }
        let row_id = Uuid::new_v4().to_string();
        self.tables
            .entry(table_id.to_string())
            .or_default()
            .push((row_id.clone(), Value::Object(row.into_iter().collect())));
        Ok(row_id)
    }

    async fn get(&self, table_id: &str, row_id: &str) -> Result<Option<Value>, TableError> {
        Ok(self
            .tables
            .get(table_id)
            .and_then(|rows| rows.iter().find(|(id, _)| id == row_id).map(|(_, v)| v.clone())))
    }

    async fn query(
        &self,
        table_id: &str,
        filter: RowFilter,
        order_by: Option<OrderBy>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Value>, TableError> {
        let Some(rows) = self.tables.get(table_id) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<Value> = rows
            .iter()
            .map(|(_, v)| v.clone())
            .filter(|row| {
                filter
                    .equals
                    .iter()
                    .all(|(col, want)| row.get(col).map(|got| got == want).unwrap_or(false))
            })
            .collect();

        if let Some(order) = order_by {
            matched.sort_by(|a, b| {
                let av = a.get(&order.column);
                let bv = b.get(&order.column);
                let ord = av
                    .and_then(|v| v.as_str())
                    .zip(bv.and_then(|v| v.as_str()))
                    .map(|(a, b)| a.cmp(b))
                    .unwrap_or(std::cmp::Ordering::Equal);
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        let skip = offset.unwrap_or(0);
        let matched: Vec<Value> = matched.into_iter().skip(skip).collect();
        Ok(match limit {
            Some(n) => matched.into_iter().take(n).collect(),
            None => matched,
        })
    }

    async fn update(
        &self,
        table_id: &str,
        row_id: &str,
        patch: BTreeMap<String, Value>,
    ) -> Result<(), TableError> {
        let mut rows = self
            .tables
            .get_mut(table_id)
            .ok_or_else(|| TableError::UnknownTable(table_id.to_string()))?;
        let (_, row) = rows
            .iter_mut()
            .find(|(id, _)| id == row_id)
            .ok_or(TableError::RowNotFound)?;
        if let Some(obj) = row.as_object_mut() {
            for (k, v) in patch {
                obj.insert(k, v);
            }
        }
        Ok(())
    }

    async fn delete(&self, table_id: &str, row_id: &str) -> Result<bool, TableError> {
        let Some(mut rows) = self.tables.get_mut(table_id) else {
            return Ok(false);
        };
        let before = rows.len();
        rows.retain(|(id, _)| id != row_id);
        Ok(rows.len() != before)
    }

    async fn count(&self, table_id: &str) -> Result<usize, TableError> {
        Ok(self.tables.get(table_id).map(|rows| rows.len()).unwrap_or(0))
    }
}

#[derive(Debug, Clone)]
pub struct WalEntry {
    pub id: String,
    pub pipe_id: String,
    pub table_id: String,
    pub row: BTreeMap<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only buffer for pipe writes that failed, so they may be replayed
/// later. A double failure here is swallowed, the execution, not the
/// pipe's side table, is this engine's source of truth.
#[async_trait]
pub trait Wal: Send + Sync + 'static {
    async fn append(&self, entry: WalEntry);
    async fn read_pending(&self, limit: usize) -> Vec<WalEntry>;
    async fn ack(&self, id: &str);

    /// Drops every acknowledged entry. The in-memory reference implementation
    /// has nothing to compact (`ack` already removes the entry), so this is a
    /// no-op that returns 0; a disk-backed WAL would reclaim segment space.
    async fn compact(&self) -> usize {
        0
    }
}

#[derive(Default)]
pub struct InMemoryWal {
    entries: dashmap::DashMap<String, WalEntry>,
}

impl InMemoryWal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Wal for InMemoryWal {
    async fn append(&self, entry: WalEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    async fn read_pending(&self, limit: usize) -> Vec<WalEntry> {
        self.entries.iter().take(limit).map(|e| e.value().clone()).collect()
    }

    async fn ack(&self, id: &str) {
        self.entries.remove(id);
    }
}

fn navigate<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Writes every pipe attached to `step_id` whose `on` matches `outcome`.
/// Never returns an error: write failures are logged, emitted as
/// `pipe.failed`, and best-effort appended to `wal`.
pub async fn run_pipes(
    pipes: impl Iterator<Item = &Pipe>,
    outcome: PipeOutcome,
    output: Option<&Value>,
    tenant_id: Option<&str>,
    execution_id: &str,
    table_store: &dyn TableStore,
    wal: Option<&dyn Wal>,
    event_bus: &Arc<dyn EventBus>,
) {
    for pipe in pipes {
        if !outcome.fires(pipe.on) {
            continue;
        }

        let mut row: BTreeMap<String, Value> = pipe.static_values.clone();
        if let Some(output) = output {
            for mapping in &pipe.mappings {
                if let Some(value) = navigate(output, &mapping.source_path) {
                    row.insert(mapping.column_id.clone(), value.clone());
                }
            }
        }

        match table_store.insert(&pipe.table_id, row.clone(), tenant_id).await {
            Ok(_row_id) => {
                event_bus
                    .publish(EngineEvent::PipeInserted {
                        execution_id: execution_id.to_string(),
                        pipe_id: pipe.id.clone(),
                        timestamp: Utc::now(),
                    })
                    .await;
            }
            Err(err) => {
                tracing::warn!(pipe_id = %pipe.id, error = %err, "pipe write failed");
                event_bus
                    .publish(EngineEvent::PipeFailed {
                        execution_id: execution_id.to_string(),
                        pipe_id: pipe.id.clone(),
                        error: err.to_string(),
                        timestamp: Utc::now(),
                    })
                    .await;

                if let Some(wal) = wal {
                    wal.append(WalEntry {
                        id: Uuid::new_v4().to_string(),
                        pipe_id: pipe.id.clone(),
                        table_id: pipe.table_id.clone(),
                        row,
                        recorded_at: Utc::now(),
                    })
                    .await;
                }
            }
        }
    }
}
