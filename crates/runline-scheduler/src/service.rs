//! Execution operations shared by the workers and the outer layers.

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use runline_core::event::Event;
use runline_core::job::{Job, JobSpec};
use runline_core::parameter::{ParameterValues, check_values};
use runline_core::runner::RunnerData;
use runline_core::{Error, JobExecution, ResourceId, Scope, StepExecution};
use runline_db::{Store, StepUpdate};
use runline_executor::RunnerRegistry;
use tracing::{info, warn};

use crate::SchedulerResult;
use crate::driver::RunnerSupervisor;
use crate::worker::WorkerHandle;

/// Workers woken up when new work is stored.
#[derive(Debug, Clone)]
pub struct WorkerHandles {
    pub job_scheduler: WorkerHandle,
    pub event_processor: WorkerHandle,
}

pub struct ExecutionService {
    store: Arc<dyn Store>,
    registry: Arc<RunnerRegistry>,
    runners: RunnerSupervisor,
    default_retention: Option<u32>,
    workers: OnceLock<WorkerHandles>,
}

impl ExecutionService {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<RunnerRegistry>,
        runners: RunnerSupervisor,
        default_retention: Option<u32>,
    ) -> Self {
        Self {
            store,
            registry,
            runners,
            default_retention,
            workers: OnceLock::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn runners(&self) -> &RunnerSupervisor {
        &self.runners
    }

    pub fn default_retention(&self) -> Option<u32> {
        self.default_retention
    }

    /// Register the workers to wake up. Only the first call has an effect.
    pub fn attach_workers(&self, workers: WorkerHandles) {
        if self.workers.set(workers).is_err() {
            warn!("Workers already attached");
        }
    }

    fn wake_job_scheduler(&self) {
        if let Some(workers) = self.workers.get() {
            workers.job_scheduler.wake_up();
        }
    }

    fn wake_event_processor(&self) {
        if let Some(workers) = self.workers.get() {
            workers.event_processor.wake_up();
        }
    }

    /// Validate and store a new job.
    pub async fn create_job(&self, project_id: ResourceId, spec: JobSpec) -> SchedulerResult<Job> {
        spec.validate()?;

        let runner = spec.runner_name();
        if !self.registry.names().contains(&runner) {
            return Err(Error::InvalidInput(format!("unknown runner {:?}", runner)).into());
        }

        let job = self.store.create_job(project_id, spec).await?;
        info!(job_id = %job.id, job = %job.spec.name, "Job created");
        Ok(job)
    }

    /// Create an execution of a job with caller supplied parameters.
    pub async fn instantiate_job(
        &self,
        job_id: ResourceId,
        parameters: ParameterValues,
        scope: Scope,
    ) -> SchedulerResult<JobExecution> {
        let job = self.store.get_job(job_id, scope).await?;
        let parameters = check_values(&job.spec.parameters, &parameters)?;

        let je = self
            .store
            .instantiate_job(&job, parameters, None, self.default_retention)
            .await?;
        info!(job_execution_id = %je.id, job = %job.spec.name, "Job execution created");

        self.wake_job_scheduler();
        Ok(je)
    }

    /// Hand a started execution over to its runner.
    ///
    /// Problems found at this point cannot be reported to a caller: the
    /// execution is failed with the reason instead.
    pub async fn start_job_execution(&self, data: RunnerData) -> SchedulerResult<()> {
        let je = &data.job_execution;
        let scope = Scope::project(je.project_id);

        let missing = je
            .job_spec
            .identities
            .iter()
            .find(|name| !data.context.identities.contains_key(*name));
        let runner = match missing {
            Some(name) => Err(Error::NotFound(format!("identity {:?}", name))),
            None => self.registry.create(data.clone()),
        };

        match runner {
            Ok(runner) => {
                self.runners.spawn(runner, &data);
                Ok(())
            }
            Err(e) => {
                let message = format!("cannot start runner: {}", e);
                warn!(job_execution_id = %je.id, reason = %message, "Cannot start job execution");
                self.store
                    .fail_job_execution(je.id, &message, scope)
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn get_job_execution(
        &self,
        id: ResourceId,
        scope: Scope,
    ) -> SchedulerResult<JobExecution> {
        Ok(self.store.get_job_execution(id, scope).await?)
    }

    pub async fn list_step_executions(
        &self,
        job_execution_id: ResourceId,
        scope: Scope,
    ) -> SchedulerResult<Vec<StepExecution>> {
        Ok(self
            .store
            .list_step_executions(job_execution_id, scope)
            .await?)
    }

    /// Abort an unfinished execution. A running runner notices on its next
    /// heartbeat and interrupts the current step.
    pub async fn abort_job_execution(
        &self,
        id: ResourceId,
        scope: Scope,
    ) -> SchedulerResult<JobExecution> {
        let je = self.store.abort_job_execution(id, scope).await?;
        info!(job_execution_id = %id, "Job execution aborted");
        Ok(je)
    }

    /// Reset a finished execution so that it gets scheduled again.
    pub async fn restart_job_execution(
        &self,
        id: ResourceId,
        scope: Scope,
    ) -> SchedulerResult<JobExecution> {
        let je = self.store.restart_job_execution(id, scope).await?;
        info!(job_execution_id = %id, "Job execution restarted");
        self.wake_job_scheduler();
        Ok(je)
    }

    pub async fn update_step_execution_start(
        &self,
        id: ResourceId,
        scope: Scope,
    ) -> SchedulerResult<StepExecution> {
        self.update_step_execution(id, StepUpdate::Start, scope).await
    }

    pub async fn update_step_execution_success(
        &self,
        id: ResourceId,
        scope: Scope,
    ) -> SchedulerResult<StepExecution> {
        self.update_step_execution(id, StepUpdate::Success, scope)
            .await
    }

    pub async fn update_step_execution_failure(
        &self,
        id: ResourceId,
        message: impl Into<String>,
        scope: Scope,
    ) -> SchedulerResult<StepExecution> {
        self.update_step_execution(id, StepUpdate::Failure(message.into()), scope)
            .await
    }

    pub async fn update_step_execution_aborted(
        &self,
        id: ResourceId,
        scope: Scope,
    ) -> SchedulerResult<StepExecution> {
        self.update_step_execution(id, StepUpdate::Aborted, scope)
            .await
    }

    async fn update_step_execution(
        &self,
        id: ResourceId,
        update: StepUpdate,
        scope: Scope,
    ) -> SchedulerResult<StepExecution> {
        Ok(self.store.update_step_execution(id, update, scope).await?)
    }

    /// Store an unprocessed copy of an event so that its job runs again.
    pub async fn replay_event(&self, id: ResourceId, scope: Scope) -> SchedulerResult<Event> {
        let event = self.store.get_event(id, scope).await?;
        let replayed = event.replay(Utc::now());
        self.store.insert_event(&replayed).await?;
        info!(event_id = %replayed.id, original_event_id = %id, "Event replayed");

        self.wake_event_processor();
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runline_core::job::{RunnerSpec, Step};
    use runline_core::parameter::{Parameter, ParameterType};
    use runline_core::{ExecutionStatus, TransitionError};
    use runline_db::{CatalogRepo, ExecutionRepo, MemoryStore};
    use serde_json::json;

    use crate::testing::{FakeRunner, fake_service};

    fn spec() -> JobSpec {
        let mut count = Parameter::new("count", ParameterType::Integer);
        count.default = Some(json!(1));
        JobSpec {
            name: "deploy".into(),
            runner: Some(FakeRunner::spec()),
            parameters: vec![Parameter::new("target", ParameterType::String), count],
            steps: vec![Step::code("true"), Step::code("true")],
            ..Default::default()
        }
    }

    async fn setup() -> (MemoryStore, Arc<ExecutionService>, Job) {
        let store = MemoryStore::new();
        let service = fake_service(&store, FakeRunner::Succeeding);
        let project = store.create_project("main").await.unwrap();
        let job = service.create_job(project.id, spec()).await.unwrap();
        (store, service, job)
    }

    fn target(value: &str) -> ParameterValues {
        ParameterValues::from([("target".to_string(), json!(value))])
    }

    #[tokio::test]
    async fn test_create_job_validates_spec() {
        let (store, service, job) = setup().await;

        let mut unknown_runner = spec();
        unknown_runner.name = "other".into();
        unknown_runner.runner = Some(RunnerSpec {
            name: "docker".into(),
            parameters: serde_json::Value::Null,
        });
        let err = service
            .create_job(job.project_id, unknown_runner)
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());

        let mut empty = spec();
        empty.name = "empty".into();
        empty.steps.clear();
        assert!(service.create_job(job.project_id, empty).await.is_err());

        let duplicate = service.create_job(job.project_id, spec()).await;
        assert!(duplicate.is_err());
        assert!(store.get_job(job.id, Scope::Global).await.is_ok());
    }

    #[tokio::test]
    async fn test_instantiate_checks_parameters() {
        let (_store, service, job) = setup().await;
        let scope = Scope::project(job.project_id);

        let je = service
            .instantiate_job(job.id, target("prod"), scope)
            .await
            .unwrap();
        assert_eq!(je.status, ExecutionStatus::Created);
        assert_eq!(je.parameters.get("target"), Some(&json!("prod")));
        assert_eq!(je.parameters.get("count"), Some(&json!(1)));
        let steps = service.list_step_executions(je.id, scope).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].position, 2);

        let missing = service
            .instantiate_job(job.id, ParameterValues::new(), scope)
            .await
            .unwrap_err();
        assert!(missing.is_invalid_input());

        let mut unknown = target("prod");
        unknown.insert("colour".into(), json!("red"));
        assert!(
            service
                .instantiate_job(job.id, unknown, scope)
                .await
                .unwrap_err()
                .is_invalid_input()
        );

        let mut wrong_type = target("prod");
        wrong_type.insert("count".into(), json!(1.5));
        assert!(
            service
                .instantiate_job(job.id, wrong_type, scope)
                .await
                .unwrap_err()
                .is_invalid_input()
        );
    }

    #[tokio::test]
    async fn test_other_project_cannot_see_execution() {
        let (store, service, job) = setup().await;
        let other = store.create_project("other").await.unwrap();

        let err = service
            .instantiate_job(job.id, target("prod"), Scope::project(other.id))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let je = service
            .instantiate_job(job.id, target("prod"), Scope::Global)
            .await
            .unwrap();
        let err = service
            .abort_job_execution(je.id, Scope::project(other.id))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_abort_and_restart() {
        let (_store, service, job) = setup().await;
        let scope = Scope::project(job.project_id);
        let je = service
            .instantiate_job(job.id, target("prod"), scope)
            .await
            .unwrap();

        let err = service
            .restart_job_execution(je.id, scope)
            .await
            .unwrap_err();
        assert!(matches!(err.transition(), Some(TransitionError::NotFinished(_))));

        let aborted = service.abort_job_execution(je.id, scope).await.unwrap();
        assert_eq!(aborted.status, ExecutionStatus::Aborted);
        assert!(aborted.start_time.is_none());
        assert!(aborted.end_time.is_none());

        let err = service.abort_job_execution(je.id, scope).await.unwrap_err();
        assert!(matches!(err.transition(), Some(TransitionError::Aborted(_))));

        let steps = service.list_step_executions(je.id, scope).await.unwrap();
        let err = service
            .update_step_execution_start(steps[0].id, scope)
            .await
            .unwrap_err();
        assert!(matches!(err.transition(), Some(TransitionError::Aborted(_))));

        let restarted = service.restart_job_execution(je.id, scope).await.unwrap();
        assert_eq!(restarted.status, ExecutionStatus::Created);
        assert!(restarted.failure_message.is_none());
        let steps = service.list_step_executions(je.id, scope).await.unwrap();
        assert!(steps.iter().all(|s| s.status == ExecutionStatus::Created));
    }

    #[tokio::test]
    async fn test_step_updates() {
        let (store, service, job) = setup().await;
        let scope = Scope::project(job.project_id);
        service
            .instantiate_job(job.id, target("prod"), scope)
            .await
            .unwrap();
        let data = store.start_next_execution(None).await.unwrap().unwrap();
        let steps = &data.step_executions;

        let step = service
            .update_step_execution_start(steps[0].id, scope)
            .await
            .unwrap();
        assert_eq!(step.status, ExecutionStatus::Started);
        assert!(step.start_time.is_some());
        let step = service
            .update_step_execution_failure(steps[0].id, "exit 2", scope)
            .await
            .unwrap();
        assert_eq!(step.status, ExecutionStatus::Failed);
        assert_eq!(step.failure_message.as_deref(), Some("exit 2"));

        let step = service
            .update_step_execution_start(steps[1].id, scope)
            .await
            .unwrap();
        assert!(step.failure_message.is_none());
        let step = service
            .update_step_execution_success(steps[1].id, scope)
            .await
            .unwrap();
        assert_eq!(step.status, ExecutionStatus::Successful);
        assert!(step.end_time.is_some());

        let step = service
            .update_step_execution_aborted(steps[1].id, scope)
            .await
            .unwrap();
        assert_eq!(step.status, ExecutionStatus::Aborted);
    }

    #[tokio::test]
    async fn test_replay_event() {
        let (store, service, job) = setup().await;
        let event = Event::new(
            job.project_id,
            job.id,
            "github",
            "push",
            json!({"ref": "main"}),
            Utc::now(),
        );
        store.insert_event(&event).await.unwrap();

        let replayed = service
            .replay_event(event.id, Scope::project(job.project_id))
            .await
            .unwrap();
        assert_ne!(replayed.id, event.id);
        assert_eq!(replayed.original_event_id, Some(event.id));
        assert!(!replayed.processed);
        assert_eq!(replayed.data, event.data);

        let again = service
            .replay_event(replayed.id, Scope::Global)
            .await
            .unwrap();
        assert_eq!(again.original_event_id, Some(event.id));
        assert_eq!(store.events().len(), 3);
    }
}
