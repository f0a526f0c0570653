//! Repository traits and implementations.

pub mod catalog;
pub mod execution;
pub mod memory;
mod rows;

use sqlx::PgPool;

pub use catalog::CatalogRepo;
pub use execution::{EXECUTION_TIMEOUT_MESSAGE, ExecutionRepo, ProcessedEvent, StepUpdate};
pub use memory::MemoryStore;

/// Everything the engine needs from storage.
pub trait Store: CatalogRepo + ExecutionRepo {}

impl<T: CatalogRepo + ExecutionRepo> Store for T {}

/// PostgreSQL implementation of the repositories.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}
