//! Error taxonomy shared by every engine collaborator.
//!
//! Every error code the engine can surface is an [`ErrorCode`] variant, and
//! every fallible public method returns [`EngineError`] (or a narrower
//! newtype wrapping it, such as [`crate::execution::store::StoreError`]).
//! Handler failures are represented separately as data (see
//! [`crate::handler::StepError`]) since they do not abort the driver loop.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable, serializable error codes. These render identically whether read
/// from a [`Display`] impl or matched on by an embedder's client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    FlowInvalid,
    InvalidTransition,
    FlowNotFound,
    StepNotFound,
    HandlerNotFound,
    ExecutionNotFound,
    MaxSteps,
    MaxIterations,
    InputError,
    HandlerError,
    StepFailed,
    ContextValueTooLarge,
    ContextSizeLimit,
    ContextKeyLimit,
    ContextNestingLimit,
    InvalidResumeToken,
    ResumeTokenExpired,
    ExecutionNotWaiting,
    ExecutionCancelled,
    Cancelled,
}

impl ErrorCode {
    /// The exact code string an embedder sees on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FlowInvalid => "FLOW_INVALID",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::FlowNotFound => "FLOW_NOT_FOUND",
            ErrorCode::StepNotFound => "STEP_NOT_FOUND",
            ErrorCode::HandlerNotFound => "HANDLER_NOT_FOUND",
            ErrorCode::ExecutionNotFound => "EXECUTION_NOT_FOUND",
            ErrorCode::MaxSteps => "MAX_STEPS",
            ErrorCode::MaxIterations => "MAX_ITERATIONS",
            ErrorCode::InputError => "INPUT_ERROR",
            ErrorCode::HandlerError => "HANDLER_ERROR",
            ErrorCode::StepFailed => "STEP_FAILED",
            ErrorCode::ContextValueTooLarge => "CONTEXT_VALUE_TOO_LARGE",
            ErrorCode::ContextSizeLimit => "CONTEXT_SIZE_LIMIT",
            ErrorCode::ContextKeyLimit => "CONTEXT_KEY_LIMIT",
            ErrorCode::ContextNestingLimit => "CONTEXT_NESTING_LIMIT",
            ErrorCode::InvalidResumeToken => "INVALID_RESUME_TOKEN",
            ErrorCode::ResumeTokenExpired => "RESUME_TOKEN_EXPIRED",
            ErrorCode::ExecutionNotWaiting => "EXECUTION_NOT_WAITING",
            ErrorCode::ExecutionCancelled => "EXECUTION_CANCELLED",
            ErrorCode::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The engine's single error type. Carries a stable [`ErrorCode`] plus a
/// human-readable message and optional structured detail, mirroring the
/// `{message, code, retryable}` shape of a `WorkflowError` but with the code
/// required rather than optional.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn flow_not_found(flow_id: &str) -> Self {
        Self::new(ErrorCode::FlowNotFound, format!("flow not found: {flow_id}"))
    }

    pub fn step_not_found(step_id: &str) -> Self {
        Self::new(ErrorCode::StepNotFound, format!("step not found: {step_id}"))
    }

    pub fn handler_not_found(handler_type: &str) -> Self {
        Self::new(
            ErrorCode::HandlerNotFound,
            format!("handler not registered: {handler_type}"),
        )
    }

    pub fn execution_not_found(execution_id: &str) -> Self {
        Self::new(
            ErrorCode::ExecutionNotFound,
            format!("execution not found: {execution_id}"),
        )
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(ErrorCode::HandlerError, err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_renders_spec_string() {
        assert_eq!(ErrorCode::MaxSteps.as_str(), "MAX_STEPS");
        assert_eq!(ErrorCode::ContextKeyLimit.to_string(), "CONTEXT_KEY_LIMIT");
    }

    #[test]
    fn engine_error_display_includes_code_and_message() {
        let err = EngineError::flow_not_found("simple");
        assert_eq!(err.to_string(), "FLOW_NOT_FOUND: flow not found: simple");
    }

    #[test]
    fn anyhow_conversion_maps_to_handler_error() {
        let err: EngineError = anyhow::anyhow!("boom").into();
        assert_eq!(err.code, ErrorCode::HandlerError);
    }
}
