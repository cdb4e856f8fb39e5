//! The engine core: ties every collaborator together into `Create` /
//! `Tick` / `Run` / `Cancel`.

pub mod executor;

pub use executor::{
    CancelOptions, CancelResult, CancellationSourceArg, CreateOptions, CreateResult, Engine,
    EngineDriverError, RunOptions, TickOutcome, TickResult,
};
