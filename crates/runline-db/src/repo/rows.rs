//! Database rows and their conversion to domain types.

use chrono::{DateTime, Utc};
use runline_core::event::Event;
use runline_core::identity::Identity;
use runline_core::job::Job;
use runline_core::project::{Project, ProjectSettings};
use runline_core::{ExecutionStatus, JobExecution, ResourceId, StepExecution};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::{DbError, DbResult};

fn decode<T: DeserializeOwned>(what: &str, value: serde_json::Value) -> DbResult<T> {
    serde_json::from_value(value).map_err(|e| DbError::InvalidData(format!("{}: {}", what, e)))
}

fn encode<T: serde::Serialize>(what: &str, value: &T) -> DbResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| DbError::InvalidData(format!("{}: {}", what, e)))
}

fn status(value: &str) -> DbResult<ExecutionStatus> {
    value.parse().map_err(DbError::InvalidData)
}

pub(crate) fn encode_spec(spec: &runline_core::job::JobSpec) -> DbResult<serde_json::Value> {
    encode("job spec", spec)
}

pub(crate) fn encode_parameters(
    parameters: &runline_core::parameter::ParameterValues,
) -> DbResult<serde_json::Value> {
    encode("parameters", parameters)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ProjectRow {
    pub id: Uuid,
    pub name: String,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        Project {
            id: row.id.into(),
            name: row.name,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ProjectSettingsRow {
    pub id: Uuid,
    pub code_header: String,
}

impl From<ProjectSettingsRow> for ProjectSettings {
    fn from(row: ProjectSettingsRow) -> Self {
        ProjectSettings {
            id: row.id.into(),
            code_header: row.code_header,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct IdentityRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub connector: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

impl From<IdentityRow> for Identity {
    fn from(row: IdentityRow) -> Self {
        Identity {
            id: row.id.into(),
            project_id: row.project_id.into(),
            name: row.name,
            connector: row.connector,
            kind: row.kind,
            data: row.data,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub creation_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub disabled: bool,
    pub spec: serde_json::Value,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id.into(),
            project_id: row.project_id.into(),
            creation_time: row.creation_time,
            update_time: row.update_time,
            disabled: row.disabled,
            spec: decode("job spec", row.spec)?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct EventRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub job_id: Option<Uuid>,
    pub creation_time: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
    pub connector: String,
    pub name: String,
    pub data: serde_json::Value,
    pub processed: bool,
    pub original_event_id: Option<Uuid>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: row.id.into(),
            project_id: row.project_id.into(),
            job_id: row.job_id.map(ResourceId::from),
            creation_time: row.creation_time,
            event_time: row.event_time,
            connector: row.connector,
            name: row.name,
            data: row.data,
            processed: row.processed,
            original_event_id: row.original_event_id.map(ResourceId::from),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobExecutionRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub job_id: Uuid,
    pub job_spec: serde_json::Value,
    pub event_id: Option<Uuid>,
    pub parameters: serde_json::Value,
    pub creation_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub scheduled_time: DateTime<Utc>,
    pub status: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub refresh_time: Option<DateTime<Utc>>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub failure_message: Option<String>,
}

impl TryFrom<JobExecutionRow> for JobExecution {
    type Error = DbError;

    fn try_from(row: JobExecutionRow) -> Result<Self, Self::Error> {
        Ok(JobExecution {
            id: row.id.into(),
            project_id: row.project_id.into(),
            job_id: row.job_id.into(),
            job_spec: decode("job spec", row.job_spec)?,
            event_id: row.event_id.map(ResourceId::from),
            parameters: decode("parameters", row.parameters)?,
            creation_time: row.creation_time,
            update_time: row.update_time,
            scheduled_time: row.scheduled_time,
            status: status(&row.status)?,
            start_time: row.start_time,
            end_time: row.end_time,
            refresh_time: row.refresh_time,
            expiration_time: row.expiration_time,
            failure_message: row.failure_message,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct StepExecutionRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub job_execution_id: Uuid,
    pub position: i32,
    pub status: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure_message: Option<String>,
    pub output: String,
}

impl TryFrom<StepExecutionRow> for StepExecution {
    type Error = DbError;

    fn try_from(row: StepExecutionRow) -> Result<Self, Self::Error> {
        Ok(StepExecution {
            id: row.id.into(),
            project_id: row.project_id.into(),
            job_execution_id: row.job_execution_id.into(),
            position: row.position,
            status: status(&row.status)?,
            start_time: row.start_time,
            end_time: row.end_time,
            failure_message: row.failure_message,
            output: row.output,
        })
    }
}
