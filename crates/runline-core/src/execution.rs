//! Job and step executions and their state machines.
//!
//! Every transition is a pure method taking the current time, so the
//! PostgreSQL and in-memory stores apply exactly the same rules. Stores load
//! the records under a row lock, call the transition, then persist the
//! result.

use chrono::{DateTime, Duration, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ResourceId;
use crate::job::JobSpec;
use crate::parameter::ParameterValues;

/// Status shared by job executions and step executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[display("created")]
    Created,
    #[display("started")]
    Started,
    #[display("successful")]
    Successful,
    #[display("failed")]
    Failed,
    #[display("aborted")]
    Aborted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Created => "created",
            ExecutionStatus::Started => "started",
            ExecutionStatus::Successful => "successful",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Successful | ExecutionStatus::Failed | ExecutionStatus::Aborted
        )
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(ExecutionStatus::Created),
            "started" => Ok(ExecutionStatus::Started),
            "successful" => Ok(ExecutionStatus::Successful),
            "failed" => Ok(ExecutionStatus::Failed),
            "aborted" => Ok(ExecutionStatus::Aborted),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// A transition rejected because of the current state of a job execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job execution {0} has been aborted")]
    Aborted(ResourceId),

    #[error("job execution {0} is finished")]
    Finished(ResourceId),

    #[error("job execution {0} is not finished yet")]
    NotFinished(ResourceId),

    #[error("job execution {0} is already started")]
    AlreadyStarted(ResourceId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ResourceId,
    pub project_id: ResourceId,
    pub job_id: ResourceId,
    pub job_spec: JobSpec,
    pub event_id: Option<ResourceId>,
    pub parameters: ParameterValues,
    pub creation_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub scheduled_time: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub refresh_time: Option<DateTime<Utc>>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub failure_message: Option<String>,
}

/// Input of [`JobExecution::instantiate`].
#[derive(Debug, Clone)]
pub struct NewJobExecution {
    pub project_id: ResourceId,
    pub job_id: ResourceId,
    pub job_spec: JobSpec,
    pub parameters: ParameterValues,
    /// Originating event id and event time.
    pub event: Option<(ResourceId, DateTime<Utc>)>,
    /// Retention in days when the job spec does not set one.
    pub default_retention: Option<u32>,
}

impl JobExecution {
    /// Build a created execution and its created step executions.
    pub fn instantiate(
        input: NewJobExecution,
        now: DateTime<Utc>,
    ) -> (JobExecution, Vec<StepExecution>) {
        let retention = match input.job_spec.retention {
            0 => input.default_retention.unwrap_or(0),
            days => days,
        };
        let expiration_time = (retention > 0).then(|| now + Duration::days(retention as i64));

        let (event_id, scheduled_time) = match input.event {
            Some((id, event_time)) => (Some(id), event_time),
            None => (None, now),
        };

        let execution = JobExecution {
            id: ResourceId::new(),
            project_id: input.project_id,
            job_id: input.job_id,
            job_spec: input.job_spec,
            event_id,
            parameters: input.parameters,
            creation_time: now,
            update_time: now,
            scheduled_time,
            status: ExecutionStatus::Created,
            start_time: None,
            end_time: None,
            refresh_time: None,
            expiration_time,
            failure_message: None,
        };

        let steps = (1..=execution.job_spec.steps.len() as i32)
            .map(|position| StepExecution::new(&execution, position))
            .collect();

        (execution, steps)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Reject any update of an execution that already reached a terminal
    /// status.
    pub fn check_updatable(&self) -> Result<(), TransitionError> {
        match self.status {
            ExecutionStatus::Aborted => Err(TransitionError::Aborted(self.id)),
            s if s.is_terminal() => Err(TransitionError::Finished(self.id)),
            _ => Ok(()),
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.check_updatable()?;
        if self.status == ExecutionStatus::Started {
            return Err(TransitionError::AlreadyStarted(self.id));
        }
        self.status = ExecutionStatus::Started;
        self.update_time = now;
        self.start_time = Some(now);
        self.refresh_time = Some(now);
        self.failure_message = None;
        Ok(())
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.check_updatable()?;
        self.status = ExecutionStatus::Successful;
        self.update_time = now;
        self.end_time = Some(now);
        self.refresh_time = None;
        Ok(())
    }

    /// Fail the execution and abort every unfinished step.
    pub fn fail(
        &mut self,
        message: impl Into<String>,
        steps: &mut [StepExecution],
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.check_updatable()?;
        self.status = ExecutionStatus::Failed;
        self.update_time = now;
        self.end_time = Some(now);
        self.refresh_time = None;
        self.failure_message = Some(message.into());
        abort_unfinished_steps(steps, now);
        Ok(())
    }

    /// Abort the execution and every unfinished step.
    ///
    /// The end time is only set if the execution had started.
    pub fn abort(
        &mut self,
        steps: &mut [StepExecution],
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.check_updatable()?;
        if self.status == ExecutionStatus::Started {
            self.end_time = Some(now);
        }
        self.status = ExecutionStatus::Aborted;
        self.update_time = now;
        self.refresh_time = None;
        abort_unfinished_steps(steps, now);
        Ok(())
    }

    /// Record a heartbeat from the runner owning the execution.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.is_finished() {
            return Err(TransitionError::Finished(self.id));
        }
        self.refresh_time = Some(now);
        Ok(())
    }

    /// Put a finished execution back in the queue with fresh steps.
    pub fn restart(
        &mut self,
        steps: &mut [StepExecution],
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.is_finished() {
            return Err(TransitionError::NotFinished(self.id));
        }
        self.status = ExecutionStatus::Created;
        self.update_time = now;
        self.start_time = None;
        self.end_time = None;
        self.refresh_time = None;
        self.failure_message = None;
        for step in steps {
            step.reset();
        }
        Ok(())
    }

    /// True when the heartbeat of a started execution is older than `timeout`.
    pub fn is_dead(&self, timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
        if self.status != ExecutionStatus::Started {
            return false;
        }
        let timeout = Duration::from_std(timeout).unwrap_or(Duration::MAX);
        match self.refresh_time {
            Some(refresh_time) => now.signed_duration_since(refresh_time) > timeout,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: ResourceId,
    pub project_id: ResourceId,
    pub job_execution_id: ResourceId,
    /// 1-based index of the step in the frozen job spec.
    pub position: i32,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure_message: Option<String>,
    pub output: String,
}

impl StepExecution {
    fn new(execution: &JobExecution, position: i32) -> Self {
        Self {
            id: ResourceId::new(),
            project_id: execution.project_id,
            job_execution_id: execution.id,
            position,
            status: ExecutionStatus::Created,
            start_time: None,
            end_time: None,
            failure_message: None,
            output: String::new(),
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Started;
        self.start_time = Some(now);
        self.end_time = None;
        self.failure_message = None;
        self.output.clear();
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Successful;
        self.end_time = Some(now);
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Failed;
        self.end_time = Some(now);
        self.failure_message = Some(message.into());
    }

    pub fn abort(&mut self, now: DateTime<Utc>) {
        if self.status == ExecutionStatus::Started {
            self.end_time = Some(now);
        }
        self.status = ExecutionStatus::Aborted;
    }

    fn reset(&mut self) {
        self.status = ExecutionStatus::Created;
        self.start_time = None;
        self.end_time = None;
        self.failure_message = None;
        self.output.clear();
    }
}

/// Abort every step that is still created or started.
pub fn abort_unfinished_steps(steps: &mut [StepExecution], now: DateTime<Utc>) {
    for step in steps.iter_mut().filter(|s| !s.status.is_terminal()) {
        step.abort(now);
    }
}
