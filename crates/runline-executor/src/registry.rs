//! Registry of runner factories, keyed by runner name.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use runline_config::ServiceConfig;
use runline_core::runner::{RunnerBehaviour, RunnerData, RunnerFactory};
use runline_core::{Error, Result};

use crate::local::LocalRunnerFactory;

/// Runner factories available to the scheduler.
///
/// Built once at startup and shared by reference; jobs select a runner by
/// name through their spec.
#[derive(Default, Clone)]
pub struct RunnerRegistry {
    factories: BTreeMap<String, Arc<dyn RunnerFactory>>,
    allowed: Option<BTreeSet<String>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the runners shipped with the service.
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalRunnerFactory::new(
            config.local_runner.clone(),
        )))?;
        if !config.allowed_runners.is_empty() {
            registry.restrict(config.allowed_runners.iter().cloned());
        }
        Ok(registry)
    }

    pub fn register(&mut self, factory: Arc<dyn RunnerFactory>) -> Result<()> {
        let name = factory.name().to_string();
        if self.factories.contains_key(&name) {
            return Err(Error::Conflict(format!("runner {} is already registered", name)));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Only allow the given runner names.
    pub fn restrict(&mut self, names: impl IntoIterator<Item = String>) {
        self.allowed = Some(names.into_iter().collect());
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories
            .keys()
            .filter(|name| self.is_allowed(name))
            .map(String::as_str)
            .collect()
    }

    fn is_allowed(&self, name: &str) -> bool {
        self.allowed
            .as_ref()
            .is_none_or(|allowed| allowed.contains(name))
    }

    /// Build the runner selected by the execution's job spec.
    pub fn create(&self, data: RunnerData) -> Result<Box<dyn RunnerBehaviour>> {
        let name = data.job_execution.job_spec.runner_name().to_string();
        if !self.is_allowed(&name) {
            return Err(Error::InvalidInput(format!("runner {:?} is not allowed", name)));
        }
        let factory = self
            .factories
            .get(&name)
            .ok_or_else(|| Error::NotFound(format!("runner {:?}", name)))?;
        factory.create(data)
    }
}
