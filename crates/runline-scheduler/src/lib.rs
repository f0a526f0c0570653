//! Workers and execution lifecycle for the Runline job engine.
//!
//! Every background activity runs as a [`WorkerLoop`] polling the store:
//! the event processor turns events into executions, the job scheduler starts
//! them on runners and the watcher fails executions whose runner went silent.
//! Multiple service instances can run the same workers against one database.

pub mod daemon;
pub mod driver;
pub mod error;
pub mod event_processor;
pub mod job_scheduler;
pub mod service;
#[cfg(test)]
mod testing;
pub mod watcher;
pub mod worker;

pub use daemon::Service;
pub use driver::RunnerSupervisor;
pub use error::{SchedulerError, SchedulerResult};
pub use event_processor::EventProcessor;
pub use job_scheduler::JobScheduler;
pub use service::ExecutionService;
pub use watcher::DeadExecutionWatcher;
pub use worker::{WorkerBehaviour, WorkerHandle, WorkerLoop};
