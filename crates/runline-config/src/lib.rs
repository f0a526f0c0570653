//! KDL configuration parsing for the Runline job engine.
//!
//! This crate handles parsing of the service configuration file
//! (`runline.kdl`) and the environment variables overriding it.

pub mod error;
mod nodes;
pub mod service;

pub use error::{ConfigError, ConfigResult};
pub use service::{
    LocalRunnerConfig, ServiceConfig, WorkerConfig, load_service_config, parse_service_config,
};
