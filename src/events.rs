//! Engine lifecycle events and the best-effort bus that dispatches them.
//!
//! `EngineEvent` is a single `#[serde(tag = "type", rename_all =
//! "snake_case")]` enum covering every lifecycle notification the engine
//! emits. These are not the durable source of truth (the `Execution`
//! record is); they are a side channel, so a listener panicking or
//! erroring must never affect the driver loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ExecutionCreated {
        execution_id: String,
        flow_id: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionStarted {
        execution_id: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionCompleted {
        execution_id: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionFailed {
        execution_id: String,
        code: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionWaiting {
        execution_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        wake_at: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    ExecutionResumed {
        execution_id: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionCancelled {
        execution_id: String,
        source: String,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        execution_id: String,
        step_id: String,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        execution_id: String,
        step_id: String,
        outcome: String,
        duration_ms: i64,
        timestamp: DateTime<Utc>,
    },
    StepTimeout {
        execution_id: String,
        step_id: String,
        timestamp: DateTime<Utc>,
    },
    StepRetry {
        execution_id: String,
        step_id: String,
        attempt: u32,
        max_attempts: u32,
        backoff_ms: u64,
        timestamp: DateTime<Utc>,
    },
    Transition {
        execution_id: String,
        from_step_id: String,
        to_step_id: String,
        outcome: String,
        timestamp: DateTime<Utc>,
    },
    IdempotencyHit {
        execution_id: String,
        flow_id: String,
        timestamp: DateTime<Utc>,
    },
    PipeInserted {
        execution_id: String,
        pipe_id: String,
        timestamp: DateTime<Utc>,
    },
    PipeFailed {
        execution_id: String,
        pipe_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    PipeDiscarded {
        execution_id: String,
        pipe_id: String,
        timestamp: DateTime<Utc>,
    },
    TokenCreated {
        token: String,
        execution_id: String,
        timestamp: DateTime<Utc>,
    },
    TokenUsed {
        token: String,
        timestamp: DateTime<Utc>,
    },
    TokenRevoked {
        token: String,
        timestamp: DateTime<Utc>,
    },
    TokensCleaned {
        count: usize,
        timestamp: DateTime<Utc>,
    },
    WalAppended {
        entry_id: String,
        timestamp: DateTime<Utc>,
    },
    WalReplayed {
        entry_id: String,
        timestamp: DateTime<Utc>,
    },
    WalCompacted {
        count: usize,
        timestamp: DateTime<Utc>,
    },
    FlowRegistered {
        flow_id: String,
        version: String,
        timestamp: DateTime<Utc>,
    },
    HandlerRegistered {
        handler_type: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            EngineEvent::ExecutionCreated { execution_id, .. }
            | EngineEvent::ExecutionStarted { execution_id, .. }
            | EngineEvent::ExecutionCompleted { execution_id, .. }
            | EngineEvent::ExecutionFailed { execution_id, .. }
            | EngineEvent::ExecutionWaiting { execution_id, .. }
            | EngineEvent::ExecutionResumed { execution_id, .. }
            | EngineEvent::ExecutionCancelled { execution_id, .. }
            | EngineEvent::StepStarted { execution_id, .. }
            | EngineEvent::StepCompleted { execution_id, .. }
            | EngineEvent::StepTimeout { execution_id, .. }
            | EngineEvent::StepRetry { execution_id, .. }
            | EngineEvent::Transition { execution_id, .. }
            | EngineEvent::IdempotencyHit { execution_id, .. }
            | EngineEvent::PipeInserted { execution_id, .. }
            | EngineEvent::PipeFailed { execution_id, .. }
            | EngineEvent::PipeDiscarded { execution_id, .. }
            | EngineEvent::TokenCreated { execution_id, .. } => Some(execution_id),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Best-effort dispatch contract. Listener failures (panics included) must
/// never escape `publish`.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    async fn publish(&self, event: EngineEvent);
    fn subscribe(&self, listener: Listener);
}

/// Reference in-memory bus: dispatches inline and synchronously, which is
/// convenient for tests. A production bus would instead enqueue to a
/// background dispatcher.
#[derive(Default)]
pub struct InMemoryEventBus {
    listeners: RwLock<Vec<Listener>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: EngineEvent) {
        let listeners: Vec<Listener> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            let event_ref = &event;
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| listener(event_ref)));
            if let Err(_panic) = outcome {
                tracing::error!("event listener panicked, isolating and continuing");
            }
        }
    }

    fn subscribe(&self, listener: Listener) {
        self.listeners.write().push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn publish_invokes_all_listeners() {
        let bus = InMemoryEventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        bus.subscribe(Arc::new(move |_event| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        let c2 = count.clone();
        bus.subscribe(Arc::new(move |_event| {
            c2.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(EngineEvent::ExecutionStarted {
            execution_id: "e1".into(),
            timestamp: Utc::now(),
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_prevent_others() {
        let bus = InMemoryEventBus::new();
        bus.subscribe(Arc::new(|_event| panic!("boom")));
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        bus.subscribe(Arc::new(move |_event| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(EngineEvent::ExecutionStarted {
            execution_id: "e1".into(),
            timestamp: Utc::now(),
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_serializes_with_tagged_type() {
        let event = EngineEvent::ExecutionCreated {
            execution_id: "e1".into(),
            flow_id: "simple".into(),
            timestamp: Utc::now(),
        };
        let json = event.as_json();
        assert_eq!(json["type"], "execution_created");
    }
}
