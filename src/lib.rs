//! # flowmonkey-engine
//!
//! A durable, data-driven workflow execution engine: flows are declarative
//! graphs of steps, step behavior is supplied by a registry of pluggable
//! [`Handler`] implementations, and each in-flight execution is a single
//! mutable durable record the engine loads, advances one step, and saves,
//! rather than an event-sourced replay log.
//!
//! ## Features
//!
//! - **Declarative flows**: a [`Flow`] is a graph of [`Step`]s wired by
//!   per-outcome transitions; no Rust type per workflow.
//! - **Pluggable handlers**: step behavior lives behind the [`Handler`]
//!   trait, keyed by `step.type` in a [`HandlerRegistry`].
//! - **Deterministic retries**: exponential backoff with no jitter, so a
//!   given `(attempt, policy)` pair always produces the same delay.
//! - **Bounded context**: per-execution state is a size/depth/key-limited
//!   map, with opaque references to an external store for oversized values.
//! - **Fire-and-forget pipes**: step outputs can be projected into external
//!   tables without ever affecting the execution's own outcome.
//! - **Cascading cancellation**: cancelling an execution revokes its resume
//!   tokens and recursively cancels its children.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Engine                              │
//! │   (create / tick / run / cancel, the load-mutate-save loop)  │
//! └─────────────────────────────────────────────────────────────┘
//!          │            │             │             │
//!          ▼            ▼             ▼             ▼
//! ┌────────────┐ ┌─────────────┐ ┌──────────┐ ┌──────────────┐
//! │ FlowRegistry│ │HandlerRegistry│ │Execution │ │ ResumeToken  │
//! │ (graphs)    │ │(step impls)  │ │  Store   │ │  Manager     │
//! └────────────┘ └─────────────┘ └──────────┘ └──────────────┘
//!                                       │
//!                                       ▼
//!                              ┌──────────────┐
//!                              │  EventBus /  │
//!                              │  Pipe writer │
//!                              └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flowmonkey_engine::prelude::*;
//!
//! let store = Arc::new(InMemoryExecutionStore::new());
//! let flows = Arc::new(FlowRegistry::new());
//! let handlers = Arc::new(HandlerRegistry::new());
//! let events: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
//! let tokens: Arc<dyn ResumeTokenManager> = Arc::new(InMemoryResumeTokenManager::new());
//! let tables: Arc<dyn TableStore> = Arc::new(InMemoryTableStore::new());
//!
//! let engine = Engine::new(store, flows, handlers, events, tokens, tables);
//! let created = engine.create("my_flow", json!({"input": 1}), CreateOptions::default()).await?;
//! let result = engine.run(&created.execution.id, RunOptions::default()).await?;
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod flow;
pub mod handler;
pub mod input;
pub mod pipe;
pub mod token;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::{ContextLimits, EngineConfig};
    pub use crate::context::{Context, ExternalStore, InMemoryExternalStore, Tier};
    pub use crate::engine::{
        CancelOptions, CancelResult, CreateOptions, CreateResult, Engine, EngineDriverError,
        RunOptions, TickResult,
    };
    pub use crate::error::{EngineError, ErrorCode, EngineResult};
    pub use crate::events::{EngineEvent, EventBus, InMemoryEventBus, Listener};
    pub use crate::execution::{Execution, ExecutionStatus, ExecutionStore, InMemoryExecutionStore};
    pub use crate::flow::{Flow, FlowRegistry, Pipe, RetryPolicy, Step};
    pub use crate::handler::{Handler, HandlerParams, HandlerRegistry, StepOutcome, StepResult};
    pub use crate::input::InputSelector;
    pub use crate::pipe::{InMemoryTableStore, InMemoryWal, PipeOutcome, TableStore, Wal};
    pub use crate::token::{InMemoryResumeTokenManager, ResumeTokenManager};
}

pub use engine::Engine;
pub use error::{EngineError, EngineResult, ErrorCode};
pub use execution::{Execution, ExecutionStatus};
pub use flow::{Flow, FlowRegistry};
pub use handler::{Handler, HandlerRegistry};
