//! Handler registry: keyed by `step.type`, storing already-constructed
//! handler instances rather than factory closures. Handlers are plain
//! `Arc<dyn Handler>` values the embedder constructs once at startup,
//! since there is no per-execution handler state to instantiate.

use std::fmt;

use dashmap::DashMap;

use super::definition::{Handler, HandlerDescriptor, HandlerRef};

#[derive(Debug, thiserror::Error)]
pub enum HandlerRegistryError {
    #[error("handler type '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("handler type '{0}' is not registered")]
    NotFound(String),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, HandlerRef>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: HandlerRef) -> Result<(), HandlerRegistryError> {
        let handler_type = handler.handler_type().to_string();
        if self.handlers.contains_key(&handler_type) {
            return Err(HandlerRegistryError::AlreadyRegistered(handler_type));
        }
        tracing::info!(handler_type = %handler_type, "handler registered");
        self.handlers.insert(handler_type, handler);
        Ok(())
    }

    pub fn get(&self, handler_type: &str) -> Option<HandlerRef> {
        self.handlers.get(handler_type).map(|e| e.value().clone())
    }

    pub fn has(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }

    pub fn types(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn descriptors(&self) -> Vec<HandlerDescriptor> {
        self.handlers.iter().map(|e| e.value().descriptor()).collect()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::definition::{HandlerParams, StepResult};
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        fn handler_type(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _params: HandlerParams<'_>) -> StepResult {
            StepResult::success(None)
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = HandlerRegistry::new();
        registry.register(std::sync::Arc::new(NoopHandler)).unwrap();
        assert!(registry.has("noop"));
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn duplicate_registration_errors() {
        let registry = HandlerRegistry::new();
        registry.register(std::sync::Arc::new(NoopHandler)).unwrap();
        assert!(matches!(
            registry.register(std::sync::Arc::new(NoopHandler)),
            Err(HandlerRegistryError::AlreadyRegistered(_))
        ));
    }
}
