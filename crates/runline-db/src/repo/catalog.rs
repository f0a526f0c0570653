//! Catalog repository: projects, jobs, identities and events.
//!
//! The engine only reads these records; writes exist for the outer layers
//! (connectors insert events, the API deploys jobs) and for tests.

use async_trait::async_trait;
use chrono::Utc;
use runline_core::event::Event;
use runline_core::identity::Identity;
use runline_core::job::{Job, JobSpec};
use runline_core::project::{Project, ProjectSettings};
use runline_core::{ResourceId, Scope};

use super::PgStore;
use super::rows::{EventRow, JobRow, ProjectRow, ProjectSettingsRow, encode_spec};
use crate::{DbError, DbResult};

#[async_trait]
pub trait CatalogRepo: Send + Sync {
    /// Create a project with default settings.
    async fn create_project(&self, name: &str) -> DbResult<Project>;
    async fn get_project(&self, id: ResourceId) -> DbResult<Project>;
    async fn get_project_settings(&self, project_id: ResourceId) -> DbResult<ProjectSettings>;
    async fn update_project_settings(&self, settings: &ProjectSettings) -> DbResult<()>;

    async fn create_job(&self, project_id: ResourceId, spec: JobSpec) -> DbResult<Job>;
    async fn get_job(&self, id: ResourceId, scope: Scope) -> DbResult<Job>;
    async fn set_job_disabled(&self, id: ResourceId, disabled: bool, scope: Scope)
    -> DbResult<Job>;

    async fn create_identity(&self, identity: &Identity) -> DbResult<()>;

    /// Store an event for the event processor to pick up.
    async fn insert_event(&self, event: &Event) -> DbResult<()>;
    async fn get_event(&self, id: ResourceId, scope: Scope) -> DbResult<Event>;
}

#[async_trait]
impl CatalogRepo for PgStore {
    async fn create_project(&self, name: &str) -> DbResult<Project> {
        let project = Project {
            id: ResourceId::new(),
            name: name.to_string(),
        };
        let settings = ProjectSettings::new(project.id);

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO projects (id, name) VALUES ($1, $2)")
            .bind(project.id.as_uuid())
            .bind(&project.name)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::from_insert(e, || format!("project {}", name)))?;
        sqlx::query("INSERT INTO project_settings (id, code_header) VALUES ($1, $2)")
            .bind(settings.id.as_uuid())
            .bind(&settings.code_header)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(project)
    }

    async fn get_project(&self, id: ResourceId) -> DbResult<Project> {
        let row = sqlx::query_as::<_, ProjectRow>("SELECT id, name FROM projects WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))?;
        Ok(row.into())
    }

    async fn get_project_settings(&self, project_id: ResourceId) -> DbResult<ProjectSettings> {
        let row = sqlx::query_as::<_, ProjectSettingsRow>(
            "SELECT id, code_header FROM project_settings WHERE id = $1",
        )
        .bind(project_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("project settings {}", project_id)))?;
        Ok(row.into())
    }

    async fn update_project_settings(&self, settings: &ProjectSettings) -> DbResult<()> {
        let result = sqlx::query("UPDATE project_settings SET code_header = $2 WHERE id = $1")
            .bind(settings.id.as_uuid())
            .bind(&settings.code_header)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("project settings {}", settings.id)));
        }
        Ok(())
    }

    async fn create_job(&self, project_id: ResourceId, spec: JobSpec) -> DbResult<Job> {
        let name = spec.name.clone();
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (id, project_id, creation_time, update_time, disabled, spec)
            VALUES ($1, $2, $3, $3, FALSE, $4)
            RETURNING *
            "#,
        )
        .bind(ResourceId::new().as_uuid())
        .bind(project_id.as_uuid())
        .bind(Utc::now())
        .bind(encode_spec(&spec)?)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DbError::from_insert(e, || format!("job {}", name)))?;
        row.try_into()
    }

    async fn get_job(&self, id: ResourceId, scope: Scope) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE id = $1 AND ($2::uuid IS NULL OR project_id = $2)",
        )
        .bind(id.as_uuid())
        .bind(scope.project_id().map(uuid::Uuid::from))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        row.try_into()
    }

    async fn set_job_disabled(
        &self,
        id: ResourceId,
        disabled: bool,
        scope: Scope,
    ) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs SET disabled = $3, update_time = NOW()
            WHERE id = $1 AND ($2::uuid IS NULL OR project_id = $2)
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(scope.project_id().map(uuid::Uuid::from))
        .bind(disabled)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        row.try_into()
    }

    async fn create_identity(&self, identity: &Identity) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO identities (id, project_id, name, connector, type, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(identity.id.as_uuid())
        .bind(identity.project_id.as_uuid())
        .bind(&identity.name)
        .bind(&identity.connector)
        .bind(&identity.kind)
        .bind(&identity.data)
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::from_insert(e, || format!("identity {}", identity.name)))?;
        Ok(())
    }

    async fn insert_event(&self, event: &Event) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO events
              (id, project_id, job_id, creation_time, event_time, connector, name, data,
               processed, original_event_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.project_id.as_uuid())
        .bind(event.job_id.map(uuid::Uuid::from))
        .bind(event.creation_time)
        .bind(event.event_time)
        .bind(&event.connector)
        .bind(&event.name)
        .bind(&event.data)
        .bind(event.processed)
        .bind(event.original_event_id.map(uuid::Uuid::from))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_event(&self, id: ResourceId, scope: Scope) -> DbResult<Event> {
        let row = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events WHERE id = $1 AND ($2::uuid IS NULL OR project_id = $2)",
        )
        .bind(id.as_uuid())
        .bind(scope.project_id().map(uuid::Uuid::from))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("event {}", id)))?;
        Ok(row.into())
    }
}
