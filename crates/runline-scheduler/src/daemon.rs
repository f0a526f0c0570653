//! Service lifecycle: builds the workers, runs them and shuts them down.

use std::sync::Arc;

use runline_config::ServiceConfig;
use runline_db::Store;
use runline_executor::RunnerRegistry;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::SchedulerResult;
use crate::driver::RunnerSupervisor;
use crate::event_processor::{EVENT_PROCESSOR, EventProcessor};
use crate::job_scheduler::{JOB_SCHEDULER, JobScheduler};
use crate::service::{ExecutionService, WorkerHandles};
use crate::watcher::{DeadExecutionWatcher, JOB_EXECUTION_WATCHER};
use crate::worker::{WorkerBehaviour, WorkerHandle, WorkerLoop};

/// A running engine instance.
///
/// Several instances may share one database; they coordinate through the
/// store only.
pub struct Service {
    config: ServiceConfig,
    execution: Arc<ExecutionService>,
    workers: TaskTracker,
    stop: CancellationToken,
    handles: Vec<WorkerHandle>,
}

impl Service {
    pub fn new(config: ServiceConfig, store: Arc<dyn Store>, registry: RunnerRegistry) -> Self {
        let runners = RunnerSupervisor::new(store.clone(), config.job_execution_refresh_interval);
        let execution = Arc::new(ExecutionService::new(
            store,
            Arc::new(registry),
            runners,
            config.job_execution_retention,
        ));

        Self {
            config,
            execution,
            workers: TaskTracker::new(),
            stop: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn execution(&self) -> &Arc<ExecutionService> {
        &self.execution
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerHandle> {
        self.handles.iter().find(|h| h.name() == name)
    }

    /// Spawn every worker.
    pub async fn start(&mut self) -> SchedulerResult<()> {
        let store = self.execution.store().clone();

        let job_scheduler = self
            .spawn_worker(
                JOB_SCHEDULER,
                JobScheduler::new(
                    self.execution.clone(),
                    self.config.max_parallel_job_executions,
                ),
            )
            .await?;

        let event_processor = self
            .spawn_worker(
                EVENT_PROCESSOR,
                EventProcessor::new(
                    store.clone(),
                    self.config.job_execution_retention,
                    job_scheduler.clone(),
                ),
            )
            .await?;

        self.spawn_worker(
            JOB_EXECUTION_WATCHER,
            DeadExecutionWatcher::new(store, self.config.job_execution_timeout),
        )
        .await?;

        self.execution.attach_workers(WorkerHandles {
            job_scheduler,
            event_processor,
        });

        info!(workers = self.handles.len(), "Service started");
        Ok(())
    }

    async fn spawn_worker(
        &mut self,
        name: &str,
        behaviour: impl WorkerBehaviour,
    ) -> SchedulerResult<WorkerHandle> {
        let worker = WorkerLoop::new(name, self.config.worker(name), behaviour);
        let handle = worker.spawn(&self.workers, self.stop.clone()).await?;
        self.handles.push(handle.clone());
        Ok(handle)
    }

    /// Interrupt running executions, then stop the workers.
    ///
    /// A scheduler iteration in flight when shutdown begins may still start
    /// an execution. Its runner is created already cancelled, and the second
    /// wait on the runners covers it once the workers are gone.
    pub async fn shutdown(self) {
        let runners = self.execution.runners();
        info!(running = runners.running(), "Stopping runners");
        runners.shutdown().await;

        info!("Stopping workers");
        self.stop.cancel();
        self.workers.close();
        self.workers.wait().await;

        runners.shutdown().await;
        info!("Service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use runline_config::{LocalRunnerConfig, WorkerConfig};
    use runline_core::event::Event;
    use runline_core::identity::Identity;
    use runline_core::job::{JobSpec, OnFailure, Step};
    use runline_core::parameter::ParameterValues;
    use runline_core::{ExecutionStatus, JobExecution, ResourceId, Scope};
    use runline_db::{CatalogRepo, ExecutionRepo, MemoryStore};
    use serde_json::json;

    fn config(root: &std::path::Path) -> ServiceConfig {
        let worker = WorkerConfig {
            disabled: false,
            initial_delay: Duration::from_millis(10),
            error_delay: Duration::from_millis(50),
            sleep_duration: Duration::from_millis(50),
        };
        let mut config = ServiceConfig {
            job_execution_refresh_interval: Duration::from_millis(100),
            local_runner: LocalRunnerConfig {
                root_directory: root.to_path_buf(),
            },
            ..Default::default()
        };
        for name in [JOB_SCHEDULER, EVENT_PROCESSOR, JOB_EXECUTION_WATCHER] {
            config.workers.insert(name.to_string(), worker.clone());
        }
        config
    }

    async fn start(store: &MemoryStore, root: &std::path::Path) -> Service {
        let config = config(root);
        let registry = RunnerRegistry::from_config(&config).unwrap();
        let mut service = Service::new(config, Arc::new(store.clone()), registry);
        service.start().await.unwrap();
        service
    }

    async fn wait_finished(service: &Service, id: ResourceId) -> JobExecution {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let je = service
                    .execution()
                    .get_job_execution(id, Scope::Global)
                    .await
                    .unwrap();
                if je.is_finished() {
                    return je;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("execution did not finish in time")
    }

    async fn run_job(steps: Vec<Step>) -> (JobExecution, Vec<runline_core::StepExecution>) {
        let root = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let service = start(&store, root.path()).await;
        let project = store.create_project("main").await.unwrap();
        let spec = JobSpec {
            name: "e2e".into(),
            steps,
            ..Default::default()
        };
        let job = service
            .execution()
            .create_job(project.id, spec)
            .await
            .unwrap();
        let je = service
            .execution()
            .instantiate_job(job.id, ParameterValues::new(), Scope::project(project.id))
            .await
            .unwrap();

        let je = wait_finished(&service, je.id).await;
        service.execution().runners().wait_idle().await;
        let steps = service
            .execution()
            .list_step_executions(je.id, Scope::Global)
            .await
            .unwrap();
        service.shutdown().await;

        // Sandboxes are removed once their execution ends.
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
        (je, steps)
    }

    #[tokio::test]
    async fn test_failed_step_aborts_the_rest() {
        let (je, steps) = run_job(vec![
            Step::code("echo one"),
            Step::code("exit 1"),
            Step::code("echo three"),
        ])
        .await;

        assert_eq!(je.status, ExecutionStatus::Failed);
        assert_eq!(
            je.failure_message.as_deref(),
            Some("cannot execute step 2: program exited with status 1")
        );
        let statuses: Vec<_> = steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                ExecutionStatus::Successful,
                ExecutionStatus::Failed,
                ExecutionStatus::Aborted
            ]
        );
        assert_eq!(steps[0].output, "one\n");
        assert_eq!(
            steps[1].failure_message.as_deref(),
            Some("program exited with status 1")
        );
        assert!(steps[2].start_time.is_none());
        assert!(steps[2].end_time.is_none());
    }

    #[tokio::test]
    async fn test_continue_on_failure_still_succeeds() {
        let (je, steps) = run_job(vec![
            Step::code("exit 1").with_on_failure(OnFailure::Continue),
            Step::code("echo after"),
        ])
        .await;

        assert_eq!(je.status, ExecutionStatus::Successful);
        assert_eq!(steps[0].status, ExecutionStatus::Failed);
        assert_eq!(steps[1].status, ExecutionStatus::Successful);
        assert_eq!(steps[1].output, "after\n");
    }

    #[tokio::test]
    async fn test_environment_precedence() {
        let root = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let service = start(&store, root.path()).await;
        let project = store.create_project("main").await.unwrap();

        for (name, values) in [
            ("first", json!({"A": "first", "B": "first", "C": "first"})),
            ("second", json!({"B": "second", "C": "second"})),
        ] {
            store
                .create_identity(&Identity {
                    id: ResourceId::new(),
                    project_id: project.id,
                    name: name.into(),
                    connector: "generic".into(),
                    kind: "env".into(),
                    data: json!({ "environment": values }),
                })
                .await
                .unwrap();
        }

        let mut spec = JobSpec {
            name: "env".into(),
            identities: vec!["first".into(), "second".into()],
            steps: vec![Step::code("echo \"$A $B $C\"")],
            ..Default::default()
        };
        spec.environment.insert("C".into(), "job".into());
        let job = service
            .execution()
            .create_job(project.id, spec)
            .await
            .unwrap();
        let je = service
            .execution()
            .instantiate_job(job.id, ParameterValues::new(), Scope::Global)
            .await
            .unwrap();

        let je = wait_finished(&service, je.id).await;
        assert_eq!(je.status, ExecutionStatus::Successful);
        service.execution().runners().wait_idle().await;
        let steps = service
            .execution()
            .list_step_executions(je.id, Scope::Global)
            .await
            .unwrap();
        assert_eq!(steps[0].output, "first second job\n");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_event_runs_job() {
        let root = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let service = start(&store, root.path()).await;
        let project = store.create_project("main").await.unwrap();
        let spec: JobSpec = serde_json::from_value(json!({
            "name": "on-push",
            "trigger": {
                "connector": "github",
                "event": "push",
                "filters": [{"path": "/branch", "is_equal_to": "main"}]
            },
            "steps": [{"code": "read -r branch < \"$RUNLINE_DIR/event/branch\" || true\necho \"$branch\""}]
        }))
        .unwrap();
        let job = service
            .execution()
            .create_job(project.id, spec)
            .await
            .unwrap();

        let event = Event::new(
            project.id,
            job.id,
            "github",
            "push",
            json!({"branch": "main"}),
            Utc::now(),
        );
        store.insert_event(&event).await.unwrap();
        service
            .worker(EVENT_PROCESSOR)
            .expect("event processor running")
            .wake_up();

        let je = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(je) = store.job_executions().into_iter().next() {
                    if je.is_finished() {
                        return je;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("event did not run the job");

        assert_eq!(je.status, ExecutionStatus::Successful);
        assert_eq!(je.event_id, Some(event.id));
        service.execution().runners().wait_idle().await;
        let steps = service
            .execution()
            .list_step_executions(je.id, Scope::Global)
            .await
            .unwrap();
        assert_eq!(steps[0].output, "main\n");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_aborts_running_executions() {
        let root = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let service = start(&store, root.path()).await;
        let project = store.create_project("main").await.unwrap();
        let spec = JobSpec {
            name: "forever".into(),
            steps: vec![Step::code("while :; do :; done"), Step::code("true")],
            ..Default::default()
        };
        let job = service
            .execution()
            .create_job(project.id, spec)
            .await
            .unwrap();
        let je = service
            .execution()
            .instantiate_job(job.id, ParameterValues::new(), Scope::Global)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let steps = store
                    .list_step_executions(je.id, Scope::Global)
                    .await
                    .unwrap();
                if steps[0].status == ExecutionStatus::Started {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("step did not start");

        service.shutdown().await;

        let je = store.get_job_execution(je.id, Scope::Global).await.unwrap();
        assert_eq!(je.status, ExecutionStatus::Aborted);
        let steps = store.list_step_executions(je.id, Scope::Global).await.unwrap();
        assert!(steps.iter().all(|s| s.status == ExecutionStatus::Aborted));
    }
}
