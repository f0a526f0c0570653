//! Scheduler error types.

use runline_core::TransitionError;
use runline_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Core(#[from] runline_core::Error),

    #[error(transparent)]
    Db(#[from] DbError),

    /// Fatal failure of a running execution, recorded as its failure message.
    #[error("{0}")]
    Execution(String),

    #[error("panic: {0}")]
    Panic(String),
}

impl SchedulerError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::Core(runline_core::Error::NotFound(_))
                | SchedulerError::Db(DbError::NotFound(_))
        )
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self, SchedulerError::Core(runline_core::Error::InvalidInput(_)))
    }

    /// The state error behind a rejected transition, if that is what failed.
    pub fn transition(&self) -> Option<&TransitionError> {
        match self {
            SchedulerError::Core(runline_core::Error::Transition(e))
            | SchedulerError::Db(DbError::Transition(e)) => Some(e),
            _ => None,
        }
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
