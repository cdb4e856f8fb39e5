//! The [`Handler`] trait and the [`StepResult`] outcome it produces.
//!
//! A handler's result is not a plain success/error pair: it is the
//! three-way `StepResult` sum the engine's apply-result step branches on
//! (success, failure, or wait).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::execution::model::Execution;
use crate::flow::Step;
use crate::token::ResumeTokenManager;

/// A handler failure. Carries a stable code so [`crate::flow::RetryPolicy`]
/// can allowlist it.
#[derive(Debug, Clone)]
pub struct StepError {
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl StepError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::new("HANDLER_ERROR", err.to_string())
    }
}

/// What a handler asks the engine to do next, beyond the plain outcome.
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub outcome: StepOutcome,
    pub output: Option<Value>,
    pub next_step_override: Option<Option<String>>,
}

#[derive(Debug, Clone)]
pub enum StepOutcome {
    Success,
    Failure(StepError),
    Wait {
        wake_at_ms: Option<i64>,
        wait_reason: Option<String>,
        resume_token: Option<String>,
    },
}

impl Default for StepOutcome {
    fn default() -> Self {
        StepOutcome::Success
    }
}

impl StepResult {
    pub fn success(output: Option<Value>) -> Self {
        Self {
            outcome: StepOutcome::Success,
            output,
            next_step_override: None,
        }
    }

    pub fn failure(error: StepError) -> Self {
        Self {
            outcome: StepOutcome::Failure(error),
            output: None,
            next_step_override: None,
        }
    }

    pub fn wait(wake_at_ms: Option<i64>, wait_reason: Option<String>) -> Self {
        Self {
            outcome: StepOutcome::Wait {
                wake_at_ms,
                wait_reason,
                resume_token: None,
            },
            output: None,
            next_step_override: None,
        }
    }

    pub fn with_next_step_override(mut self, next: Option<String>) -> Self {
        self.next_step_override = Some(next);
        self
    }
}

/// Parameters passed to [`Handler::execute`].
pub struct HandlerParams<'a> {
    pub step: &'a Step,
    pub input: Value,
    pub context: &'a Context,
    pub execution: &'a Execution,
    /// Lets a handler mint its own resume token ahead of returning
    /// `StepOutcome::Wait`, instead of relying on the engine to generate
    /// one when the outcome carries no `wakeAt`.
    pub token_manager: Option<Arc<dyn ResumeTokenManager>>,
    pub signal: CancellationToken,
}

/// Declarative metadata an editor/admin surface can use without ever
/// instantiating the handler.
#[derive(Debug, Clone)]
pub struct HandlerDescriptor {
    pub name: &'static str,
    pub category: &'static str,
    pub stateful: bool,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
}

/// A step implementation, keyed in the [`crate::handler::HandlerRegistry`]
/// by [`Handler::handler_type`].
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    fn handler_type(&self) -> &str;

    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor {
            name: "",
            category: "",
            stateful: false,
            input_schema: None,
            output_schema: None,
        }
    }

    /// Opt-in static validation of a step's `config` at flow-registration
    /// time. Default: no validation.
    fn validate_config(&self, _config: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn execute(&self, params: HandlerParams<'_>) -> StepResult;

    /// Whether this handler type participates in long-running/wait
    /// semantics; surfaced via [`HandlerDescriptor`] for editor tooling.
    fn stateful(&self) -> bool {
        false
    }
}

pub type HandlerRef = Arc<dyn Handler>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_result_success_carries_output() {
        let result = StepResult::success(Some(serde_json::json!({"a": 1})));
        assert!(matches!(result.outcome, StepOutcome::Success));
        assert_eq!(result.output, Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn step_error_display_includes_code() {
        let err = StepError::new("TRANSIENT", "connection reset");
        assert_eq!(err.to_string(), "TRANSIENT: connection reset");
    }
}
