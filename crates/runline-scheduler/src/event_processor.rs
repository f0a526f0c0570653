//! Turns stored events into job executions.

use std::sync::Arc;

use async_trait::async_trait;
use runline_db::Store;
use tracing::{debug, info};

use crate::SchedulerResult;
use crate::worker::{WorkerBehaviour, WorkerHandle};

pub const EVENT_PROCESSOR: &str = "event-processor";

/// Consumes unprocessed events one at a time. An event whose job accepts it
/// produces an execution, after which the job scheduler is woken up.
pub struct EventProcessor {
    store: Arc<dyn Store>,
    default_retention: Option<u32>,
    job_scheduler: WorkerHandle,
}

impl EventProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        default_retention: Option<u32>,
        job_scheduler: WorkerHandle,
    ) -> Self {
        Self {
            store,
            default_retention,
            job_scheduler,
        }
    }
}

#[async_trait]
impl WorkerBehaviour for EventProcessor {
    async fn process_one(&mut self) -> SchedulerResult<bool> {
        let Some(processed) = self
            .store
            .process_next_event(self.default_retention)
            .await?
        else {
            return Ok(false);
        };

        match processed.job_execution {
            Some(je) => {
                info!(
                    event_id = %processed.event_id,
                    job_execution_id = %je.id,
                    job = %je.job_spec.name,
                    "Event instantiated job"
                );
                self.job_scheduler.wake_up();
            }
            None => debug!(event_id = %processed.event_id, "Event ignored"),
        }

        Ok(true)
    }
}
