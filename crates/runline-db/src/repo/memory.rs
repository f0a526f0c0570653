//! In-memory store for tests and local runs.
//!
//! All state sits behind one mutex, so every operation is atomic and claims
//! behave like `FOR UPDATE SKIP LOCKED` under a single advisory lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runline_core::event::Event;
use runline_core::execution::NewJobExecution;
use runline_core::identity::Identity;
use runline_core::job::{Job, JobSpec};
use runline_core::parameter::{ParameterValues, default_values};
use runline_core::project::{Project, ProjectSettings};
use runline_core::runner::{ExecutionContext, RunnerData};
use runline_core::{ExecutionStatus, JobExecution, ResourceId, Scope, StepExecution};
use tracing::warn;

use super::execution::EXECUTION_TIMEOUT_MESSAGE;
use super::{CatalogRepo, ExecutionRepo, ProcessedEvent, StepUpdate};
use crate::{DbError, DbResult};

#[derive(Default)]
struct MemoryState {
    projects: HashMap<ResourceId, Project>,
    settings: HashMap<ResourceId, ProjectSettings>,
    identities: HashMap<ResourceId, Identity>,
    jobs: HashMap<ResourceId, Job>,
    events: HashMap<ResourceId, Event>,
    executions: HashMap<ResourceId, JobExecution>,
    steps: HashMap<ResourceId, StepExecution>,
}

impl MemoryState {
    fn execution(&self, id: ResourceId, scope: Scope) -> DbResult<&JobExecution> {
        self.executions
            .get(&id)
            .filter(|je| scope.contains(je.project_id))
            .ok_or_else(|| DbError::NotFound(format!("job execution {}", id)))
    }

    fn steps_of(&self, job_execution_id: ResourceId) -> Vec<StepExecution> {
        let mut steps: Vec<_> = self
            .steps
            .values()
            .filter(|s| s.job_execution_id == job_execution_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.position);
        steps
    }

    fn insert_execution(&mut self, je: JobExecution, steps: Vec<StepExecution>) {
        for step in steps {
            self.steps.insert(step.id, step);
        }
        self.executions.insert(je.id, je);
    }

    fn transition<F>(&mut self, id: ResourceId, scope: Scope, f: F) -> DbResult<JobExecution>
    where
        F: FnOnce(&mut JobExecution, &mut [StepExecution], DateTime<Utc>) -> DbResult<()>,
    {
        let mut je = self.execution(id, scope)?.clone();
        let mut steps = self.steps_of(id);

        f(&mut je, steps.as_mut_slice(), Utc::now())?;

        for step in steps {
            self.steps.insert(step.id, step);
        }
        self.executions.insert(id, je.clone());
        Ok(je)
    }

    fn runner_data(&self, je: JobExecution) -> DbResult<RunnerData> {
        let project = self
            .projects
            .get(&je.project_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("project {}", je.project_id)))?;
        let project_settings = self
            .settings
            .get(&je.project_id)
            .cloned()
            .unwrap_or_else(|| ProjectSettings::new(je.project_id));
        let event = je.event_id.and_then(|id| self.events.get(&id).cloned());
        let identities = self
            .identities
            .values()
            .filter(|i| i.project_id == je.project_id && je.job_spec.identities.contains(&i.name))
            .map(|i| (i.name.clone(), i.clone()))
            .collect();

        Ok(RunnerData {
            project,
            project_settings,
            context: ExecutionContext {
                event,
                parameters: je.parameters.clone(),
                identities,
            },
            step_executions: self.steps_of(je.id),
            job_execution: je,
        })
    }
}

/// Store keeping every record in memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every job execution, oldest first.
    pub fn job_executions(&self) -> Vec<JobExecution> {
        let mut executions: Vec<_> = self.state().executions.values().cloned().collect();
        executions.sort_by_key(|je| (je.creation_time, je.id));
        executions
    }

    /// Snapshot of every event, oldest first.
    pub fn events(&self) -> Vec<Event> {
        let mut events: Vec<_> = self.state().events.values().cloned().collect();
        events.sort_by_key(|e| (e.creation_time, e.id));
        events
    }

    /// Overwrite the heartbeat of an execution.
    pub fn set_refresh_time(
        &self,
        id: ResourceId,
        refresh_time: impl Into<Option<DateTime<Utc>>>,
    ) -> DbResult<()> {
        let mut state = self.state();
        let je = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job execution {}", id)))?;
        je.refresh_time = refresh_time.into();
        Ok(())
    }
}

#[async_trait]
impl CatalogRepo for MemoryStore {
    async fn create_project(&self, name: &str) -> DbResult<Project> {
        let mut state = self.state();
        if state.projects.values().any(|p| p.name == name) {
            return Err(DbError::Duplicate(format!("project {}", name)));
        }
        let project = Project {
            id: ResourceId::new(),
            name: name.to_string(),
        };
        state
            .settings
            .insert(project.id, ProjectSettings::new(project.id));
        state.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: ResourceId) -> DbResult<Project> {
        self.state()
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))
    }

    async fn get_project_settings(&self, project_id: ResourceId) -> DbResult<ProjectSettings> {
        self.state()
            .settings
            .get(&project_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("project settings {}", project_id)))
    }

    async fn update_project_settings(&self, settings: &ProjectSettings) -> DbResult<()> {
        let mut state = self.state();
        let slot = state
            .settings
            .get_mut(&settings.id)
            .ok_or_else(|| DbError::NotFound(format!("project settings {}", settings.id)))?;
        *slot = settings.clone();
        Ok(())
    }

    async fn create_job(&self, project_id: ResourceId, spec: JobSpec) -> DbResult<Job> {
        let mut state = self.state();
        if !state.projects.contains_key(&project_id) {
            return Err(DbError::NotFound(format!("project {}", project_id)));
        }
        if state
            .jobs
            .values()
            .any(|j| j.project_id == project_id && j.spec.name == spec.name)
        {
            return Err(DbError::Duplicate(format!("job {}", spec.name)));
        }
        let now = Utc::now();
        let job = Job {
            id: ResourceId::new(),
            project_id,
            creation_time: now,
            update_time: now,
            disabled: false,
            spec,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: ResourceId, scope: Scope) -> DbResult<Job> {
        self.state()
            .jobs
            .get(&id)
            .filter(|j| scope.contains(j.project_id))
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn set_job_disabled(
        &self,
        id: ResourceId,
        disabled: bool,
        scope: Scope,
    ) -> DbResult<Job> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&id)
            .filter(|j| scope.contains(j.project_id))
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        job.disabled = disabled;
        job.update_time = Utc::now();
        Ok(job.clone())
    }

    async fn create_identity(&self, identity: &Identity) -> DbResult<()> {
        let mut state = self.state();
        if state
            .identities
            .values()
            .any(|i| i.project_id == identity.project_id && i.name == identity.name)
        {
            return Err(DbError::Duplicate(format!("identity {}", identity.name)));
        }
        state.identities.insert(identity.id, identity.clone());
        Ok(())
    }

    async fn insert_event(&self, event: &Event) -> DbResult<()> {
        self.state().events.insert(event.id, event.clone());
        Ok(())
    }

    async fn get_event(&self, id: ResourceId, scope: Scope) -> DbResult<Event> {
        self.state()
            .events
            .get(&id)
            .filter(|e| scope.contains(e.project_id))
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("event {}", id)))
    }
}

#[async_trait]
impl ExecutionRepo for MemoryStore {
    async fn instantiate_job(
        &self,
        job: &Job,
        parameters: ParameterValues,
        event: Option<&Event>,
        default_retention: Option<u32>,
    ) -> DbResult<JobExecution> {
        let (je, steps) = JobExecution::instantiate(
            NewJobExecution {
                project_id: job.project_id,
                job_id: job.id,
                job_spec: job.spec.clone(),
                parameters,
                event: event.map(|e| (e.id, e.event_time)),
                default_retention,
            },
            Utc::now(),
        );
        self.state().insert_execution(je.clone(), steps);
        Ok(je)
    }

    async fn start_next_execution(
        &self,
        max_parallel: Option<u32>,
    ) -> DbResult<Option<RunnerData>> {
        let mut state = self.state();

        let started: Vec<&JobExecution> = state
            .executions
            .values()
            .filter(|je| je.status == ExecutionStatus::Started)
            .collect();
        if let Some(max) = max_parallel {
            if started.len() >= max as usize {
                return Ok(None);
            }
        }

        let next = state
            .executions
            .values()
            .filter(|je| je.status == ExecutionStatus::Created)
            .filter(|je| {
                je.job_spec.concurrent
                    || !started
                        .iter()
                        .any(|other| other.job_id == je.job_id && other.id != je.id)
            })
            .min_by_key(|je| (je.scheduled_time, je.id))
            .map(|je| je.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let je = state.transition(id, Scope::Global, |je, _, now| Ok(je.start(now)?))?;
        state.runner_data(je).map(Some)
    }

    async fn process_next_event(
        &self,
        default_retention: Option<u32>,
    ) -> DbResult<Option<ProcessedEvent>> {
        let mut state = self.state();

        let next = state
            .events
            .values()
            .filter(|e| !e.processed && e.job_id.is_some())
            .min_by_key(|e| (e.creation_time, e.id))
            .cloned();
        let Some(event) = next else {
            return Ok(None);
        };

        let job = event.job_id.and_then(|id| state.jobs.get(&id).cloned());

        let mut job_execution = None;
        if let Some(job) = job {
            let accepted = job.accepts(&event).unwrap_or_else(|e| {
                warn!(event_id = %event.id, job_id = %job.id, error = %e, "cannot evaluate trigger filters");
                false
            });
            if accepted {
                let (je, steps) = JobExecution::instantiate(
                    NewJobExecution {
                        project_id: job.project_id,
                        job_id: job.id,
                        parameters: default_values(&job.spec.parameters),
                        job_spec: job.spec,
                        event: Some((event.id, event.event_time)),
                        default_retention,
                    },
                    Utc::now(),
                );
                state.insert_execution(je.clone(), steps);
                job_execution = Some(je);
            }
        }

        if let Some(stored) = state.events.get_mut(&event.id) {
            stored.processed = true;
        }

        Ok(Some(ProcessedEvent {
            event_id: event.id,
            job_execution,
        }))
    }

    async fn fail_dead_execution(&self, timeout: Duration) -> DbResult<Option<ResourceId>> {
        let mut state = self.state();
        let now = Utc::now();

        let dead = state
            .executions
            .values()
            .filter(|je| je.is_dead(timeout, now))
            .min_by_key(|je| je.refresh_time)
            .map(|je| je.id);
        let Some(id) = dead else {
            return Ok(None);
        };

        state.transition(id, Scope::Global, |je, steps, now| {
            Ok(je.fail(EXECUTION_TIMEOUT_MESSAGE, steps, now)?)
        })?;
        Ok(Some(id))
    }

    async fn get_job_execution(&self, id: ResourceId, scope: Scope) -> DbResult<JobExecution> {
        self.state().execution(id, scope).cloned()
    }

    async fn list_step_executions(
        &self,
        job_execution_id: ResourceId,
        scope: Scope,
    ) -> DbResult<Vec<StepExecution>> {
        let state = self.state();
        state.execution(job_execution_id, scope)?;
        Ok(state.steps_of(job_execution_id))
    }

    async fn succeed_job_execution(
        &self,
        id: ResourceId,
        scope: Scope,
    ) -> DbResult<JobExecution> {
        self.state()
            .transition(id, scope, |je, _, now| Ok(je.succeed(now)?))
    }

    async fn fail_job_execution(
        &self,
        id: ResourceId,
        message: &str,
        scope: Scope,
    ) -> DbResult<JobExecution> {
        self.state()
            .transition(id, scope, |je, steps, now| Ok(je.fail(message, steps, now)?))
    }

    async fn abort_job_execution(&self, id: ResourceId, scope: Scope) -> DbResult<JobExecution> {
        self.state()
            .transition(id, scope, |je, steps, now| Ok(je.abort(steps, now)?))
    }

    async fn restart_job_execution(
        &self,
        id: ResourceId,
        scope: Scope,
    ) -> DbResult<JobExecution> {
        self.state()
            .transition(id, scope, |je, steps, now| Ok(je.restart(steps, now)?))
    }

    async fn refresh_job_execution(&self, id: ResourceId, scope: Scope) -> DbResult<()> {
        self.state()
            .transition(id, scope, |je, _, now| Ok(je.refresh(now)?))
            .map(|_| ())
    }

    async fn update_step_execution(
        &self,
        id: ResourceId,
        update: StepUpdate,
        scope: Scope,
    ) -> DbResult<StepExecution> {
        let mut state = self.state();
        let job_execution_id = state
            .steps
            .get(&id)
            .filter(|s| scope.contains(s.project_id))
            .map(|s| s.job_execution_id)
            .ok_or_else(|| DbError::NotFound(format!("step execution {}", id)))?;
        state.execution(job_execution_id, scope)?.check_updatable()?;

        let step = state
            .steps
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("step execution {}", id)))?;
        update.apply(step, Utc::now());
        Ok(step.clone())
    }

    async fn append_step_output(
        &self,
        id: ResourceId,
        output: &str,
        scope: Scope,
    ) -> DbResult<()> {
        let mut state = self.state();
        let step = state
            .steps
            .get_mut(&id)
            .filter(|s| scope.contains(s.project_id))
            .ok_or_else(|| DbError::NotFound(format!("step execution {}", id)))?;
        step.output.push_str(output);
        Ok(())
    }
}
