//! Errors raised while loading the service configuration.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration document: {0}")]
    Syntax(#[from] kdl::KdlError),

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("worker {0:?} is configured more than once")]
    DuplicateWorker(String),

    #[error("unknown runner {0:?}")]
    UnknownRunner(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
