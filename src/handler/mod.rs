//! Pluggable step implementations.

pub mod definition;
pub mod registry;

pub use definition::{
    Handler, HandlerDescriptor, HandlerParams, HandlerRef, StepError, StepOutcome, StepResult,
};
pub use registry::{HandlerRegistry, HandlerRegistryError};
