//! Step runners for the Runline job engine.
//!
//! Provides runner implementations and the registry selecting them:
//! - Local subprocesses in a private directory per execution

pub mod local;
pub mod registry;

pub use local::{LocalRunner, LocalRunnerFactory};
pub use registry::RunnerRegistry;
pub use runline_core::runner::{
    RunnerBehaviour, RunnerData, RunnerFactory, StepError, StepOutput,
};
