//! Fake runners and fixtures for scheduler tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runline_core::job::RunnerSpec;
use runline_core::runner::{RunnerBehaviour, RunnerData, RunnerFactory, StepError, StepOutput};
use runline_db::MemoryStore;
use runline_executor::RunnerRegistry;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::driver::RunnerSupervisor;
use crate::service::ExecutionService;

pub(crate) const FAKE_RUNNER: &str = "fake";

/// Behaviour of every step run by the fake runner.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FakeRunner {
    /// Write the step position to stdout and succeed.
    Succeeding,
    /// Wait until cancelled.
    Blocking,
    /// Panic in the first step.
    Panicking,
}

impl FakeRunner {
    pub(crate) fn spec() -> RunnerSpec {
        RunnerSpec {
            name: FAKE_RUNNER.into(),
            parameters: serde_json::Value::Null,
        }
    }
}

#[async_trait]
impl RunnerBehaviour for FakeRunner {
    async fn init(&mut self) -> Result<(), StepError> {
        Ok(())
    }

    async fn execute_step(
        &mut self,
        index: usize,
        mut stdout: StepOutput,
        _stderr: StepOutput,
        cancel: CancellationToken,
    ) -> Result<(), StepError> {
        match self {
            FakeRunner::Succeeding => {
                stdout
                    .write_all(format!("step {}\n", index + 1).as_bytes())
                    .await?;
                Ok(())
            }
            FakeRunner::Blocking => {
                cancel.cancelled().await;
                Err(StepError::Interrupted(index as i32 + 1))
            }
            FakeRunner::Panicking => panic!("runner exploded"),
        }
    }

    async fn terminate(&mut self) {}
}

struct FakeFactory(FakeRunner);

impl RunnerFactory for FakeFactory {
    fn name(&self) -> &str {
        FAKE_RUNNER
    }

    fn create(&self, _data: RunnerData) -> runline_core::Result<Box<dyn RunnerBehaviour>> {
        Ok(Box::new(self.0))
    }
}

/// Service over `store` whose jobs can use the fake runner.
pub(crate) fn fake_service(store: &MemoryStore, runner: FakeRunner) -> Arc<ExecutionService> {
    let mut registry = RunnerRegistry::new();
    registry
        .register(Arc::new(FakeFactory(runner)))
        .expect("fake runner registered once");
    let store: Arc<dyn runline_db::Store> = Arc::new(store.clone());
    let runners = RunnerSupervisor::new(store.clone(), Duration::from_millis(50));
    Arc::new(ExecutionService::new(
        store,
        Arc::new(registry),
        runners,
        None,
    ))
}
