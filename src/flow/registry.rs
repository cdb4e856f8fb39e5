//! Flow registry: versioned storage of [`Flow`] definitions with
//! registration-time validation.
//!
//! Data-driven rather than factory-driven: there is no per-flow Rust type
//! to instantiate, so `register` stores the flow itself (after validating
//! it) instead of a type-erased constructor closure.

use std::fmt;

use dashmap::DashMap;

use super::definition::Flow;

/// Errors raised while validating or registering a [`Flow`].
#[derive(Debug, thiserror::Error)]
pub enum FlowRegistryError {
    #[error("flow '{0}' has no steps")]
    NoSteps(String),
    #[error("flow '{0}' initial step '{1}' does not exist")]
    UnknownInitialStep(String, String),
    #[error("flow '{0}' step key '{1}' does not match step.id '{2}'")]
    StepKeyMismatch(String, String, String),
    #[error("flow '{0}' step '{1}' transitions to unknown step '{2}'")]
    UnknownTransitionTarget(String, String, String),
    #[error("flow '{0}' step '{1}' has a wait-capable handler type but no onResume or onSuccess transition")]
    UnreachableAfterWait(String, String),
    #[error("flow '{0}' version '{1}' already registered")]
    DuplicateVersion(String, String),
    #[error("flow '{0}' version '{1}' not found")]
    NotFound(String, String),
    #[error("flow '{0}' not found")]
    UnknownFlow(String),
}

/// Handler-type names the validator treats as wait-capable for the purpose
/// of the "unreachable after wait" static check.
const WAIT_CAPABLE_TYPES: &[&str] = &["wait", "delay", "human_task", "webhook_wait"];

/// Validates a flow graph in isolation (no registry state required).
pub fn validate(flow: &Flow) -> Result<(), FlowRegistryError> {
    if flow.steps.is_empty() {
        return Err(FlowRegistryError::NoSteps(flow.id.clone()));
    }

    if !flow.steps.contains_key(&flow.initial_step_id) {
        return Err(FlowRegistryError::UnknownInitialStep(
            flow.id.clone(),
            flow.initial_step_id.clone(),
        ));
    }

    for (key, step) in &flow.steps {
        if key != &step.id {
            return Err(FlowRegistryError::StepKeyMismatch(
                flow.id.clone(),
                key.clone(),
                step.id.clone(),
            ));
        }

        for target in [
            &step.transitions.on_success,
            &step.transitions.on_failure,
            &step.transitions.on_resume,
        ]
        .into_iter()
        .flatten()
        {
            if !flow.steps.contains_key(target) {
                return Err(FlowRegistryError::UnknownTransitionTarget(
                    flow.id.clone(),
                    step.id.clone(),
                    target.clone(),
                ));
            }
        }

        if WAIT_CAPABLE_TYPES.contains(&step.r#type.as_str())
            && step.transitions.on_resume.is_none()
            && step.transitions.on_success.is_none()
        {
            return Err(FlowRegistryError::UnreachableAfterWait(
                flow.id.clone(),
                step.id.clone(),
            ));
        }
    }

    Ok(())
}

/// Versioned store of registered flows, keyed by `(id, version)`, tracking
/// the latest version per id on every successful registration (last write
/// wins, regardless of version-string ordering).
pub struct FlowRegistry {
    flows: DashMap<(String, String), Flow>,
    latest: DashMap<String, String>,
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
            latest: DashMap::new(),
        }
    }

    #[tracing::instrument(skip(self, flow), fields(flow_id = %flow.id, version = %flow.version))]
    pub fn register(&self, flow: Flow) -> Result<(), FlowRegistryError> {
        validate(&flow)?;

        let key = (flow.id.clone(), flow.version.clone());
        if self.flows.contains_key(&key) {
            return Err(FlowRegistryError::DuplicateVersion(flow.id, flow.version));
        }

        // Last-registered-wins: whichever `register` call lands most recently
        // becomes "latest", regardless of version-string ordering.
        self.latest.insert(flow.id.clone(), flow.version.clone());

        tracing::info!("flow registered");
        self.flows.insert(key, flow);
        Ok(())
    }

    pub fn get(&self, id: &str, version: Option<&str>) -> Result<Flow, FlowRegistryError> {
        let version = match version {
            Some(v) => v.to_string(),
            None => self
                .latest
                .get(id)
                .map(|v| v.clone())
                .ok_or_else(|| FlowRegistryError::UnknownFlow(id.to_string()))?,
        };

        self.flows
            .get(&(id.to_string(), version.clone()))
            .map(|entry| entry.clone())
            .ok_or_else(|| FlowRegistryError::NotFound(id.to_string(), version))
    }

    pub fn has(&self, id: &str) -> bool {
        self.latest.contains_key(id)
    }

    pub fn flow_ids(&self) -> Vec<String> {
        self.latest.iter().map(|e| e.key().clone()).collect()
    }

    pub fn versions(&self, id: &str) -> Vec<String> {
        self.flows
            .iter()
            .filter(|e| e.key().0 == id)
            .map(|e| e.key().1.clone())
            .collect()
    }
}

impl fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flow_ids", &self.flow_ids())
            .finish()
    }
}
