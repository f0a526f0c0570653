//! Fails executions whose runner stopped sending heartbeats.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runline_db::Store;
use tracing::warn;

use crate::SchedulerResult;
use crate::worker::WorkerBehaviour;

pub const JOB_EXECUTION_WATCHER: &str = "job-execution-watcher";

/// Reaps started executions not refreshed within `timeout`, typically
/// because the service instance running them died.
pub struct DeadExecutionWatcher {
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl DeadExecutionWatcher {
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { store, timeout }
    }
}

#[async_trait]
impl WorkerBehaviour for DeadExecutionWatcher {
    async fn process_one(&mut self) -> SchedulerResult<bool> {
        match self.store.fail_dead_execution(self.timeout).await? {
            Some(id) => {
                warn!(job_execution_id = %id, timeout = ?self.timeout, "Dead job execution failed");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
