//! Runner driver: runs the steps of one started execution on its runner and
//! records every transition in the store.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use runline_core::job::OnFailure;
use runline_core::runner::{RunnerBehaviour, RunnerData, StepError};
use runline_core::{JobExecution, ResourceId, Scope, StepExecution};
use runline_db::{DbError, Store, StepUpdate};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::worker::panic_message;
use crate::{SchedulerError, SchedulerResult};

const OUTPUT_BUFFER_SIZE: usize = 64 * 1024;

/// Owns the tasks of every running execution.
///
/// Cancelling the supervisor interrupts in-flight steps: each runner then
/// aborts its execution.
#[derive(Clone)]
pub struct RunnerSupervisor {
    store: Arc<dyn Store>,
    refresh_interval: Duration,
    tracker: TaskTracker,
    stop: CancellationToken,
}

impl RunnerSupervisor {
    pub fn new(store: Arc<dyn Store>, refresh_interval: Duration) -> Self {
        Self {
            store,
            refresh_interval,
            tracker: TaskTracker::new(),
            stop: CancellationToken::new(),
        }
    }

    /// Drive `runner` through the steps of the execution in `data`.
    pub fn spawn(&self, runner: Box<dyn RunnerBehaviour>, data: &RunnerData) {
        let je = &data.job_execution;
        let driver = RunnerDriver {
            store: self.store.clone(),
            runner,
            job_execution: je.clone(),
            steps: data.step_executions.clone(),
            scope: Scope::project(je.project_id),
            refresh_interval: self.refresh_interval,
            cancel: self.stop.child_token(),
            current_step: None,
        };
        let span = info_span!("runner", job_execution_id = %je.id, job = %je.job_spec.name);
        self.tracker.spawn(driver.run().instrument(span));
    }

    /// True once shutdown has begun. No new runner should be started.
    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Interrupt every runner and wait for all of them to finish. Runners
    /// spawned afterwards start cancelled; calling this again waits for them.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Wait for every runner spawned so far without interrupting them.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

struct RunnerDriver {
    store: Arc<dyn Store>,
    runner: Box<dyn RunnerBehaviour>,
    job_execution: JobExecution,
    steps: Vec<StepExecution>,
    scope: Scope,
    refresh_interval: Duration,
    cancel: CancellationToken,
    /// Index of the step started and not yet recorded as finished.
    current_step: Option<usize>,
}

impl RunnerDriver {
    async fn run(mut self) {
        info!("Starting runner");

        let heartbeat = self.spawn_heartbeat();

        let outcome = AssertUnwindSafe(self.execute()).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => match e.transition() {
                Some(transition) => {
                    info!(reason = %transition, "Execution finished elsewhere");
                }
                None => {
                    error!(error = %e, "Execution failed");
                    self.fail(e.to_string()).await;
                }
            },
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Runner panicked");
                self.fail(format!("panic: {}", message)).await;
            }
        }

        heartbeat.abort();
        self.runner.terminate().await;
        info!("Runner terminated");
    }

    async fn execute(&mut self) -> SchedulerResult<()> {
        if let Err(e) = self.runner.init().await {
            return Err(SchedulerError::Execution(format!(
                "cannot initialize runner: {}",
                e
            )));
        }

        for index in 0..self.steps.len() {
            if self.cancel.is_cancelled() {
                self.store
                    .abort_job_execution(self.job_execution.id, self.scope)
                    .await?;
                info!("Execution aborted");
                return Ok(());
            }

            let step_id = self.steps[index].id;
            let position = index + 1;
            self.store
                .update_step_execution(step_id, StepUpdate::Start, self.scope)
                .await?;
            self.current_step = Some(index);
            debug!(
                step = position,
                description = %self.job_execution.job_spec.steps[index].describe(),
                "Step started"
            );

            match self.execute_step(index, step_id).await? {
                Ok(()) => {
                    self.store
                        .update_step_execution(step_id, StepUpdate::Success, self.scope)
                        .await?;
                    self.current_step = None;
                    debug!(step = position, "Step succeeded");
                }
                Err(StepError::Failure(message)) => {
                    self.store
                        .update_step_execution(
                            step_id,
                            StepUpdate::Failure(message.clone()),
                            self.scope,
                        )
                        .await?;
                    self.current_step = None;
                    info!(step = position, reason = %message, "Step failed");

                    if self.job_execution.job_spec.steps[index].on_failure == OnFailure::Abort {
                        let message = format!("cannot execute step {}: {}", position, message);
                        self.store
                            .fail_job_execution(self.job_execution.id, &message, self.scope)
                            .await?;
                        return Ok(());
                    }
                }
                Err(StepError::Interrupted(_)) => {
                    self.store
                        .abort_job_execution(self.job_execution.id, self.scope)
                        .await?;
                    info!(step = position, "Execution aborted");
                    return Ok(());
                }
                Err(e) => {
                    return Err(SchedulerError::Execution(format!(
                        "cannot execute step {}: {}",
                        position, e
                    )));
                }
            }
        }

        self.store
            .succeed_job_execution(self.job_execution.id, self.scope)
            .await?;
        info!("Execution succeeded");
        Ok(())
    }

    /// Run one step with its output streamed to the store. The outer error
    /// is a storage failure, the inner one comes from the runner.
    async fn execute_step(
        &mut self,
        index: usize,
        step_id: ResourceId,
    ) -> SchedulerResult<Result<(), StepError>> {
        let (stdout_w, stdout_r) = tokio::io::duplex(OUTPUT_BUFFER_SIZE);
        let (stderr_w, stderr_r) = tokio::io::duplex(OUTPUT_BUFFER_SIZE);

        let (result, stdout, stderr) = tokio::join!(
            self.runner.execute_step(
                index,
                Box::new(stdout_w),
                Box::new(stderr_w),
                self.cancel.clone()
            ),
            capture_output(self.store.clone(), step_id, self.scope, stdout_r),
            capture_output(self.store.clone(), step_id, self.scope, stderr_r),
        );

        stdout?;
        stderr?;
        Ok(result)
    }

    /// Record a fatal error on the running step and the execution.
    async fn fail(&mut self, message: String) {
        if let Some(index) = self.current_step.take() {
            let step_id = self.steps[index].id;
            if let Err(e) = self
                .store
                .update_step_execution(step_id, StepUpdate::Failure(message.clone()), self.scope)
                .await
            {
                warn!(step = index + 1, error = %e, "Cannot mark step as failed");
            }
        }

        if let Err(e) = self
            .store
            .fail_job_execution(self.job_execution.id, &message, self.scope)
            .await
        {
            warn!(error = %e, "Cannot mark execution as failed");
        }
    }

    /// Refresh the execution periodically. When the store reports it
    /// finished, the in-flight step is cancelled.
    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let id = self.job_execution.id;
        let scope = self.scope;
        let cancel = self.cancel.clone();
        let period = self.refresh_interval;

        let span = info_span!("heartbeat");
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = interval.tick() => {}
                    }
                    match store.refresh_job_execution(id, scope).await {
                        Ok(()) => {}
                        Err(DbError::Transition(e)) => {
                            info!(reason = %e, "Execution finished, interrupting runner");
                            cancel.cancel();
                            return;
                        }
                        Err(e) => warn!(error = %e, "Cannot refresh execution"),
                    }
                }
            }
            .instrument(span),
        )
    }
}

/// Append every line read from `reader` to the output of a step.
///
/// Reading continues after a storage error so the writer never blocks; the
/// first error is returned once the stream ends.
async fn capture_output<R>(
    store: Arc<dyn Store>,
    step_id: ResourceId,
    scope: Scope,
    reader: R,
) -> SchedulerResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut failure: Option<SchedulerError> = None;

    loop {
        buf.clear();
        let n = match reader.read_until(b'\n', &mut buf).await {
            Ok(n) => n,
            Err(e) => {
                return Err(SchedulerError::Execution(format!(
                    "cannot read output: {}",
                    e
                )));
            }
        };
        if n == 0 {
            break;
        }
        if failure.is_some() {
            continue;
        }

        let mut line = String::from_utf8_lossy(&buf).into_owned();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        if let Err(e) = store.append_step_output(step_id, &line, scope).await {
            failure = Some(e.into());
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
