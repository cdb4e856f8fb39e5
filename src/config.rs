//! Engine-wide tunables.
//!
//! Plain structs with a [`Default`] impl and `with_*` builders. No
//! external config-file crate; the embedder wires this up
//! programmatically.

use std::time::Duration;

/// Bounds on a single [`crate::context::Context`].
#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    pub max_total_size: usize,
    pub max_value_size: usize,
    pub max_keys: usize,
    pub max_depth: usize,
    /// Values at or above this size are routed to the external tier, if one
    /// is configured, instead of being stored inline.
    pub inline_threshold: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_total_size: 10 * 1024 * 1024,
            max_value_size: 1024 * 1024,
            max_keys: 500,
            max_depth: 15,
            inline_threshold: 256 * 1024,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_steps: u64,
    pub max_run_iterations: u64,
    pub default_step_timeout: Duration,
    pub context_limits: ContextLimits,
    pub max_idempotency_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 1000,
            max_run_iterations: 10_000,
            default_step_timeout: Duration::from_secs(30),
            context_limits: ContextLimits::default(),
            max_idempotency_window: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl EngineConfig {
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn with_context_limits(mut self, limits: ContextLimits) -> Self {
        self.context_limits = limits;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_steps, 1000);
        assert_eq!(cfg.default_step_timeout, Duration::from_secs(30));
        assert_eq!(cfg.context_limits.max_keys, 500);
        assert_eq!(cfg.context_limits.max_depth, 15);
    }

    #[test]
    fn builder_overrides_apply() {
        let cfg = EngineConfig::default().with_max_steps(10);
        assert_eq!(cfg.max_steps, 10);
    }
}
