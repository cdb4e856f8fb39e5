//! Durable execution state: the record, its store contract, and the
//! in-memory reference implementation.

pub mod memory;
pub mod model;
pub mod store;

pub use memory::InMemoryExecutionStore;
pub use model::{
    Cancellation, CancellationSource, Execution, ExecutionError, ExecutionStatus, HistoryEntry,
    TimeoutConfig,
};
pub use store::{ExecutionStore, StoreError};
