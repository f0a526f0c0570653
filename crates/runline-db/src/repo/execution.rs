//! Execution repository: job executions, step executions and the claims
//! made by the polling workers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runline_core::event::Event;
use runline_core::execution::NewJobExecution;
use runline_core::job::Job;
use runline_core::parameter::ParameterValues;
use runline_core::project::ProjectSettings;
use runline_core::runner::{ExecutionContext, RunnerData};
use runline_core::{JobExecution, ResourceId, Scope, StepExecution};
use sqlx::PgConnection;
use tracing::{debug, warn};
use uuid::Uuid;

use super::PgStore;
use super::rows::{
    EventRow, IdentityRow, JobExecutionRow, JobRow, ProjectRow, ProjectSettingsRow,
    StepExecutionRow, encode_parameters, encode_spec,
};
use crate::{DbError, DbResult};

/// Advisory lock class shared by every lock the engine takes.
const LOCK_CLASS: i32 = 0x0100;
/// Serializes job scheduling across service instances.
const LOCK_JOB_SCHEDULING: i32 = 0x0002;

/// Failure message of executions whose runner stopped sending heartbeats.
pub const EXECUTION_TIMEOUT_MESSAGE: &str = "execution timeout";

/// A change reported by a runner for one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepUpdate {
    Start,
    Success,
    Failure(String),
    Aborted,
}

impl StepUpdate {
    pub(crate) fn apply(&self, step: &mut StepExecution, now: DateTime<Utc>) {
        match self {
            StepUpdate::Start => step.start(now),
            StepUpdate::Success => step.succeed(now),
            StepUpdate::Failure(message) => step.fail(message.clone(), now),
            StepUpdate::Aborted => step.abort(now),
        }
    }
}

/// Outcome of processing one event.
#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    pub event_id: ResourceId,
    /// The execution instantiated for the event, if the job accepted it.
    pub job_execution: Option<JobExecution>,
}

#[async_trait]
pub trait ExecutionRepo: Send + Sync {
    /// Create a job execution and its steps in the `created` status.
    async fn instantiate_job(
        &self,
        job: &Job,
        parameters: ParameterValues,
        event: Option<&Event>,
        default_retention: Option<u32>,
    ) -> DbResult<JobExecution>;

    /// Pick the oldest schedulable execution, start it and load what its
    /// runner needs. `None` when nothing can be started right now.
    async fn start_next_execution(&self, max_parallel: Option<u32>)
    -> DbResult<Option<RunnerData>>;

    /// Consume one unprocessed event, instantiating its job if the trigger
    /// filters accept it.
    async fn process_next_event(
        &self,
        default_retention: Option<u32>,
    ) -> DbResult<Option<ProcessedEvent>>;

    /// Fail one started execution whose heartbeat is older than `timeout`.
    async fn fail_dead_execution(&self, timeout: Duration) -> DbResult<Option<ResourceId>>;

    async fn get_job_execution(&self, id: ResourceId, scope: Scope) -> DbResult<JobExecution>;
    async fn list_step_executions(
        &self,
        job_execution_id: ResourceId,
        scope: Scope,
    ) -> DbResult<Vec<StepExecution>>;

    async fn succeed_job_execution(&self, id: ResourceId, scope: Scope)
    -> DbResult<JobExecution>;
    async fn fail_job_execution(
        &self,
        id: ResourceId,
        message: &str,
        scope: Scope,
    ) -> DbResult<JobExecution>;
    async fn abort_job_execution(&self, id: ResourceId, scope: Scope) -> DbResult<JobExecution>;
    async fn restart_job_execution(&self, id: ResourceId, scope: Scope)
    -> DbResult<JobExecution>;

    /// Heartbeat. Fails with a transition error once the execution is
    /// finished, which tells the runner to stop.
    async fn refresh_job_execution(&self, id: ResourceId, scope: Scope) -> DbResult<()>;

    async fn update_step_execution(
        &self,
        id: ResourceId,
        update: StepUpdate,
        scope: Scope,
    ) -> DbResult<StepExecution>;

    /// Append text to the output of a step.
    async fn append_step_output(&self, id: ResourceId, output: &str, scope: Scope)
    -> DbResult<()>;
}

fn scope_uuid(scope: Scope) -> Option<Uuid> {
    scope.project_id().map(Uuid::from)
}

async fn insert_execution(
    conn: &mut PgConnection,
    je: &JobExecution,
    steps: &[StepExecution],
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO job_executions
          (id, project_id, job_id, job_spec, event_id, parameters, creation_time, update_time,
           scheduled_time, status, start_time, end_time, refresh_time, expiration_time,
           failure_message)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(je.id.as_uuid())
    .bind(je.project_id.as_uuid())
    .bind(je.job_id.as_uuid())
    .bind(encode_spec(&je.job_spec)?)
    .bind(je.event_id.map(Uuid::from))
    .bind(encode_parameters(&je.parameters)?)
    .bind(je.creation_time)
    .bind(je.update_time)
    .bind(je.scheduled_time)
    .bind(je.status.as_str())
    .bind(je.start_time)
    .bind(je.end_time)
    .bind(je.refresh_time)
    .bind(je.expiration_time)
    .bind(&je.failure_message)
    .execute(&mut *conn)
    .await?;

    for step in steps {
        sqlx::query(
            r#"
            INSERT INTO step_executions
              (id, project_id, job_execution_id, position, status, start_time, end_time,
               failure_message, output)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(step.id.as_uuid())
        .bind(step.project_id.as_uuid())
        .bind(step.job_execution_id.as_uuid())
        .bind(step.position)
        .bind(step.status.as_str())
        .bind(step.start_time)
        .bind(step.end_time)
        .bind(&step.failure_message)
        .bind(&step.output)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn save_execution(conn: &mut PgConnection, je: &JobExecution) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE job_executions
        SET update_time = $2, status = $3, start_time = $4, end_time = $5,
            refresh_time = $6, failure_message = $7
        WHERE id = $1
        "#,
    )
    .bind(je.id.as_uuid())
    .bind(je.update_time)
    .bind(je.status.as_str())
    .bind(je.start_time)
    .bind(je.end_time)
    .bind(je.refresh_time)
    .bind(&je.failure_message)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn save_step(conn: &mut PgConnection, step: &StepExecution) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE step_executions
        SET status = $2, start_time = $3, end_time = $4, failure_message = $5, output = $6
        WHERE id = $1
        "#,
    )
    .bind(step.id.as_uuid())
    .bind(step.status.as_str())
    .bind(step.start_time)
    .bind(step.end_time)
    .bind(&step.failure_message)
    .bind(&step.output)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn lock_execution(
    conn: &mut PgConnection,
    id: ResourceId,
    scope: Scope,
) -> DbResult<JobExecution> {
    let row = sqlx::query_as::<_, JobExecutionRow>(
        r#"
        SELECT * FROM job_executions
        WHERE id = $1 AND ($2::uuid IS NULL OR project_id = $2)
        FOR UPDATE
        "#,
    )
    .bind(id.as_uuid())
    .bind(scope_uuid(scope))
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("job execution {}", id)))?;
    row.try_into()
}

async fn load_steps(
    conn: &mut PgConnection,
    job_execution_id: ResourceId,
    for_update: bool,
) -> DbResult<Vec<StepExecution>> {
    let query = if for_update {
        "SELECT * FROM step_executions WHERE job_execution_id = $1 ORDER BY position FOR UPDATE"
    } else {
        "SELECT * FROM step_executions WHERE job_execution_id = $1 ORDER BY position"
    };
    let rows = sqlx::query_as::<_, StepExecutionRow>(query)
        .bind(job_execution_id.as_uuid())
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(StepExecution::try_from).collect()
}

/// Apply a transition to a locked execution and its steps, then save both.
async fn transition<F>(
    conn: &mut PgConnection,
    id: ResourceId,
    scope: Scope,
    f: F,
) -> DbResult<JobExecution>
where
    F: FnOnce(&mut JobExecution, &mut [StepExecution], DateTime<Utc>) -> DbResult<()> + Send,
{
    let mut je = lock_execution(conn, id, scope).await?;
    let mut steps = load_steps(conn, je.id, true).await?;
    let before = steps.clone();

    f(&mut je, steps.as_mut_slice(), Utc::now())?;

    save_execution(conn, &je).await?;
    for (step, old) in steps.iter().zip(&before) {
        if step != old {
            save_step(conn, step).await?;
        }
    }
    Ok(je)
}

async fn load_runner_data(conn: &mut PgConnection, je: JobExecution) -> DbResult<RunnerData> {
    let project = sqlx::query_as::<_, ProjectRow>("SELECT id, name FROM projects WHERE id = $1")
        .bind(je.project_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("project {}", je.project_id)))?;

    let project_settings =
        sqlx::query_as::<_, ProjectSettingsRow>("SELECT * FROM project_settings WHERE id = $1")
            .bind(je.project_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await?
            .map(ProjectSettings::from)
            .unwrap_or_else(|| ProjectSettings::new(je.project_id));

    let event = match je.event_id {
        Some(event_id) => sqlx::query_as::<_, EventRow>("SELECT * FROM events WHERE id = $1")
            .bind(event_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await?
            .map(Event::from),
        None => None,
    };

    let identities = sqlx::query_as::<_, IdentityRow>(
        "SELECT * FROM identities WHERE project_id = $1 AND name = ANY($2)",
    )
    .bind(je.project_id.as_uuid())
    .bind(&je.job_spec.identities)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|row| (row.name.clone(), row.into()))
    .collect();

    let step_executions = load_steps(conn, je.id, false).await?;

    Ok(RunnerData {
        project: project.into(),
        project_settings,
        context: ExecutionContext {
            event,
            parameters: je.parameters.clone(),
            identities,
        },
        job_execution: je,
        step_executions,
    })
}

#[async_trait]
impl ExecutionRepo for PgStore {
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

        let mut tx = self.pool.begin().await?;
        insert_execution(&mut tx, &je, &steps).await?;
        tx.commit().await?;

        Ok(je)
    }

    async fn start_next_execution(
        &self,
        max_parallel: Option<u32>,
    ) -> DbResult<Option<RunnerData>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(LOCK_CLASS)
            .bind(LOCK_JOB_SCHEDULING)
            .execute(&mut *tx)
            .await?;

        if let Some(max) = max_parallel {
            let started: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM job_executions WHERE status = 'started'",
            )
            .fetch_one(&mut *tx)
            .await?;
            if started >= i64::from(max) {
                debug!(started, max, "parallel execution limit reached");
                return Ok(None);
            }
        }

        // Non-concurrent jobs are skipped while another of their executions
        // is started; the advisory lock keeps this check race free.
        let row = sqlx::query_as::<_, JobExecutionRow>(
            r#"
            SELECT je1.* FROM job_executions AS je1
            WHERE je1.status = 'created'
              AND ((je1.job_spec->>'concurrent')::BOOLEAN IS TRUE
                   OR NOT EXISTS (SELECT 1 FROM job_executions AS je2
                                  WHERE je2.job_id = je1.job_id
                                    AND je2.id <> je1.id
                                    AND je2.status = 'started'))
            ORDER BY je1.scheduled_time, je1.id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut je = JobExecution::try_from(row)?;
        je.start(Utc::now())?;
        save_execution(&mut tx, &je).await?;

        let data = load_runner_data(&mut tx, je).await?;
        tx.commit().await?;

        Ok(Some(data))
    }

    async fn process_next_event(
        &self,
        default_retention: Option<u32>,
    ) -> DbResult<Option<ProcessedEvent>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT * FROM events
            WHERE processed = FALSE AND job_id IS NOT NULL
            ORDER BY creation_time, id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let event = Event::from(row);

        let job = match event.job_id {
            Some(job_id) => sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
                .bind(job_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?
                .map(Job::try_from)
                .transpose()?,
            None => None,
        };

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
                        job_spec: job.spec.clone(),
                        parameters: runline_core::parameter::default_values(
                            &job.spec.parameters,
                        ),
                        event: Some((event.id, event.event_time)),
                        default_retention,
                    },
                    Utc::now(),
                );
                insert_execution(&mut tx, &je, &steps).await?;
                job_execution = Some(je);
            }
        }

        sqlx::query("UPDATE events SET processed = TRUE WHERE id = $1")
            .bind(event.id.as_uuid())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(ProcessedEvent {
            event_id: event.id,
            job_execution,
        }))
    }

    async fn fail_dead_execution(&self, timeout: Duration) -> DbResult<Option<ResourceId>> {
        let deadline = Utc::now()
            - chrono::Duration::from_std(timeout)
                .map_err(|e| DbError::InvalidData(format!("execution timeout: {}", e)))?;

        let mut tx = self.pool.begin().await?;

        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM job_executions
            WHERE status = 'started' AND (refresh_time IS NULL OR refresh_time < $1)
            ORDER BY refresh_time NULLS FIRST
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(deadline)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = id else {
            return Ok(None);
        };

        let je = transition(&mut tx, id.into(), Scope::Global, |je, steps, now| {
            Ok(je.fail(EXECUTION_TIMEOUT_MESSAGE, steps, now)?)
        })
        .await?;
        tx.commit().await?;

        Ok(Some(je.id))
    }

    async fn get_job_execution(&self, id: ResourceId, scope: Scope) -> DbResult<JobExecution> {
        let row = sqlx::query_as::<_, JobExecutionRow>(
            "SELECT * FROM job_executions WHERE id = $1 AND ($2::uuid IS NULL OR project_id = $2)",
        )
        .bind(id.as_uuid())
        .bind(scope_uuid(scope))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job execution {}", id)))?;
        row.try_into()
    }

    async fn list_step_executions(
        &self,
        job_execution_id: ResourceId,
        scope: Scope,
    ) -> DbResult<Vec<StepExecution>> {
        let rows = sqlx::query_as::<_, StepExecutionRow>(
            r#"
            SELECT * FROM step_executions
            WHERE job_execution_id = $1 AND ($2::uuid IS NULL OR project_id = $2)
            ORDER BY position
            "#,
        )
        .bind(job_execution_id.as_uuid())
        .bind(scope_uuid(scope))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StepExecution::try_from).collect()
    }

    async fn succeed_job_execution(
        &self,
        id: ResourceId,
        scope: Scope,
    ) -> DbResult<JobExecution> {
        let mut tx = self.pool.begin().await?;
        let je = transition(&mut tx, id, scope, |je, _, now| Ok(je.succeed(now)?)).await?;
        tx.commit().await?;
        Ok(je)
    }

    async fn fail_job_execution(
        &self,
        id: ResourceId,
        message: &str,
        scope: Scope,
    ) -> DbResult<JobExecution> {
        let message = message.to_string();
        let mut tx = self.pool.begin().await?;
        let je = transition(&mut tx, id, scope, move |je, steps, now| {
            Ok(je.fail(message, steps, now)?)
        })
        .await?;
        tx.commit().await?;
        Ok(je)
    }

    async fn abort_job_execution(&self, id: ResourceId, scope: Scope) -> DbResult<JobExecution> {
        let mut tx = self.pool.begin().await?;
        let je = transition(&mut tx, id, scope, |je, steps, now| Ok(je.abort(steps, now)?)).await?;
        tx.commit().await?;
        Ok(je)
    }

    async fn restart_job_execution(
        &self,
        id: ResourceId,
        scope: Scope,
    ) -> DbResult<JobExecution> {
        let mut tx = self.pool.begin().await?;
        let je = transition(&mut tx, id, scope, |je, steps, now| {
            Ok(je.restart(steps, now)?)
        })
        .await?;
        tx.commit().await?;
        Ok(je)
    }

    async fn refresh_job_execution(&self, id: ResourceId, scope: Scope) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let mut je = lock_execution(&mut tx, id, scope).await?;
        je.refresh(Utc::now())?;
        sqlx::query("UPDATE job_executions SET refresh_time = $2 WHERE id = $1")
            .bind(je.id.as_uuid())
            .bind(je.refresh_time)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_step_execution(
        &self,
        id: ResourceId,
        update: StepUpdate,
        scope: Scope,
    ) -> DbResult<StepExecution> {
        let mut tx = self.pool.begin().await?;

        // Lock the parent first so step updates and execution transitions
        // always take their locks in the same order.
        let parent = sqlx::query_as::<_, JobExecutionRow>(
            r#"
            SELECT je.* FROM job_executions AS je
            JOIN step_executions AS se ON se.job_execution_id = je.id
            WHERE se.id = $1 AND ($2::uuid IS NULL OR se.project_id = $2)
            FOR UPDATE OF je
            "#,
        )
        .bind(id.as_uuid())
        .bind(scope_uuid(scope))
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("step execution {}", id)))?;
        let parent = JobExecution::try_from(parent)?;
        parent.check_updatable()?;

        let row = sqlx::query_as::<_, StepExecutionRow>(
            "SELECT * FROM step_executions WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        let mut step = StepExecution::try_from(row)?;

        update.apply(&mut step, Utc::now());
        save_step(&mut tx, &step).await?;
        tx.commit().await?;

        Ok(step)
    }

    async fn append_step_output(
        &self,
        id: ResourceId,
        output: &str,
        scope: Scope,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions SET output = output || $3
            WHERE id = $1 AND ($2::uuid IS NULL OR project_id = $2)
            "#,
        )
        .bind(id.as_uuid())
        .bind(scope_uuid(scope))
        .bind(output)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("step execution {}", id)));
        }
        Ok(())
    }
}
