//! Storage for the Runline job engine.
//!
//! [`Store`] is everything the workers need. [`PgStore`] implements it on
//! PostgreSQL and [`MemoryStore`] in process. Service instances sharing a
//! database coordinate through row locks taken with `FOR UPDATE SKIP LOCKED`
//! and transaction-scoped advisory locks, never through in-process state.

pub mod error;
pub mod repo;

use std::time::Duration;

use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

pub use error::{DbError, DbResult};
pub use repo::*;

/// Schema of the engine, embedded at build time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Shared by every worker, runner heartbeat and output writer of a service.
const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a connection pool and bring the schema up to date.
pub async fn connect(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;

    MIGRATOR.run(&pool).await?;
    info!(
        migrations = MIGRATOR.iter().count(),
        "Database schema up to date"
    );

    Ok(pool)
}
