//! Core domain types and traits for the Runline job engine.
//!
//! This crate contains:
//! - Resource identifiers and common error types
//! - Job specifications, steps, parameters and trigger filters
//! - Job and step execution records with their state machines
//! - Events, identities, projects and access scopes
//! - The runner capability trait and execution context

pub mod error;
pub mod event;
pub mod execution;
pub mod filter;
pub mod id;
pub mod identity;
pub mod job;
pub mod parameter;
pub mod project;
pub mod runner;
pub mod scope;

pub use error::{Error, Result};
pub use execution::{ExecutionStatus, JobExecution, StepExecution, TransitionError};
pub use id::ResourceId;
pub use scope::Scope;
