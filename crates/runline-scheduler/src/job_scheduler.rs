//! Starts created executions on runners.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::SchedulerResult;
use crate::service::ExecutionService;
use crate::worker::WorkerBehaviour;

pub const JOB_SCHEDULER: &str = "job-scheduler";

/// Claims the oldest schedulable execution and hands it to a runner.
///
/// The claim happens in the store under the scheduling lock: a job that is
/// not concurrent never has two started executions, and the number of
/// started executions stays under `max_parallel` across every instance.
pub struct JobScheduler {
    service: Arc<ExecutionService>,
    max_parallel: Option<u32>,
}

impl JobScheduler {
    pub fn new(service: Arc<ExecutionService>, max_parallel: Option<u32>) -> Self {
        Self {
            service,
            max_parallel,
        }
    }
}

#[async_trait]
impl WorkerBehaviour for JobScheduler {
    async fn process_one(&mut self) -> SchedulerResult<bool> {
        if self.service.runners().is_stopping() {
            return Ok(false);
        }

        let Some(data) = self
            .service
            .store()
            .start_next_execution(self.max_parallel)
            .await?
        else {
            return Ok(false);
        };

        let je = &data.job_execution;
        info!(
            job_execution_id = %je.id,
            job = %je.job_spec.name,
            runner = je.job_spec.runner_name(),
            "Job execution started"
        );

        self.service.start_job_execution(data).await?;
        Ok(true)
    }
}
