//! Polling worker loop.
//!
//! A worker repeatedly asks its behaviour to process one unit of work. It
//! drains everything available, then sleeps until its timer fires or someone
//! wakes it up. Errors and panics back the worker off for the error delay.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use runline_config::WorkerConfig;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span};

use crate::SchedulerResult;

/// Work performed by a [`WorkerLoop`].
#[async_trait]
pub trait WorkerBehaviour: Send + 'static {
    /// Called once before the loop task is spawned.
    async fn init(&mut self) -> SchedulerResult<()> {
        Ok(())
    }

    /// Called on the loop task before the first iteration.
    async fn start(&mut self) -> SchedulerResult<()> {
        Ok(())
    }

    /// Called on the loop task once the loop has exited.
    async fn stop(&mut self) {}

    /// Process one unit of work. `Ok(true)` means there may be more.
    async fn process_one(&mut self) -> SchedulerResult<bool>;
}

/// Wakes a running worker before its timer fires.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    name: String,
    wake: Option<mpsc::Sender<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the worker. A wake-up already pending absorbs this one.
    pub fn wake_up(&self) {
        if let Some(wake) = &self.wake {
            let _ = wake.try_send(());
        }
    }

    /// Handle of a worker that never runs.
    pub fn disabled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            wake: None,
        }
    }
}

pub struct WorkerLoop {
    name: String,
    config: WorkerConfig,
    behaviour: Box<dyn WorkerBehaviour>,
}

impl WorkerLoop {
    pub fn new(
        name: impl Into<String>,
        config: WorkerConfig,
        behaviour: impl WorkerBehaviour,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            behaviour: Box::new(behaviour),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Initialize the behaviour and run the loop on a task of `tracker`
    /// until `stop` is cancelled.
    pub async fn spawn(
        mut self,
        tracker: &TaskTracker,
        stop: CancellationToken,
    ) -> SchedulerResult<WorkerHandle> {
        if self.config.disabled {
            info!(worker = %self.name, "Worker disabled");
            return Ok(WorkerHandle::disabled(self.name));
        }

        self.behaviour.init().await?;

        let (wake_tx, wake_rx) = mpsc::channel(1);
        let handle = WorkerHandle {
            name: self.name.clone(),
            wake: Some(wake_tx),
        };

        let span = info_span!("worker", worker = %self.name);
        tracker.spawn(self.run(wake_rx, stop).instrument(span));
        Ok(handle)
    }

    async fn run(mut self, mut wake: mpsc::Receiver<()>, stop: CancellationToken) {
        info!("Starting worker");

        if let Err(e) = self.behaviour.start().await {
            error!(error = %e, "Cannot start worker");
            return;
        }

        let timer = sleep(self.config.initial_delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                Some(()) = wake.recv() => debug!("Woken up"),
                _ = &mut timer => {}
            }

            let delay = self.drain(&stop).await;
            timer.as_mut().reset(Instant::now() + delay);
        }

        self.behaviour.stop().await;
        info!("Worker stopped");
    }

    /// Process work until none is left, returning the delay before the next
    /// attempt.
    async fn drain(&mut self, stop: &CancellationToken) -> Duration {
        loop {
            if stop.is_cancelled() {
                return self.config.sleep_duration;
            }

            let result = AssertUnwindSafe(self.behaviour.process_one())
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(true)) => continue,
                Ok(Ok(false)) => return self.config.sleep_duration,
                Ok(Err(e)) => {
                    error!(error = %e, "Cannot process work");
                    return self.config.error_delay;
                }
                Err(panic) => {
                    let backtrace = Backtrace::force_capture();
                    error!(
                        panic = %panic_message(panic.as_ref()),
                        %backtrace,
                        "Worker panicked"
                    );
                    return self.config.error_delay;
                }
            }
        }
    }
}

/// Text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::SchedulerError;

    fn config() -> WorkerConfig {
        WorkerConfig {
            disabled: false,
            initial_delay: Duration::from_millis(10),
            error_delay: Duration::from_millis(20),
            sleep_duration: Duration::from_secs(3600),
        }
    }

    /// Processes `pending` units of work, then reports nothing left.
    struct Counter {
        pending: Arc<AtomicUsize>,
        processed: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerBehaviour for Counter {
        async fn stop(&mut self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        async fn process_one(&mut self) -> SchedulerResult<bool> {
            let pending = self.pending.load(Ordering::SeqCst);
            if pending == 0 {
                return Ok(false);
            }
            self.pending.store(pending - 1, Ordering::SeqCst);
            self.processed.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    async fn wait_for(counter: &AtomicUsize, value: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) != value {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_drains_then_wakes_up() {
        let pending = Arc::new(AtomicUsize::new(3));
        let processed = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let worker = WorkerLoop::new(
            "counter",
            config(),
            Counter {
                pending: pending.clone(),
                processed: processed.clone(),
                stopped: stopped.clone(),
            },
        );

        let tracker = TaskTracker::new();
        let stop = CancellationToken::new();
        let handle = worker.spawn(&tracker, stop.clone()).await.unwrap();
        assert_eq!(handle.name(), "counter");

        wait_for(&processed, 3).await;

        // The sleep duration is long: only a wake-up gets new work processed.
        pending.store(2, Ordering::SeqCst);
        handle.wake_up();
        handle.wake_up();
        wait_for(&processed, 5).await;

        stop.cancel();
        tracker.close();
        tracker.wait().await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    struct Flaky {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerBehaviour for Flaky {
        async fn process_one(&mut self) -> SchedulerResult<bool> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => panic!("boom"),
                1 => Err(SchedulerError::Panic("not really".into())),
                _ => Ok(false),
            }
        }
    }

    #[tokio::test]
    async fn test_survives_errors_and_panics() {
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = WorkerLoop::new(
            "flaky",
            config(),
            Flaky {
                calls: calls.clone(),
            },
        );

        let tracker = TaskTracker::new();
        let stop = CancellationToken::new();
        worker.spawn(&tracker, stop.clone()).await.unwrap();

        // Panic and error both re-arm the timer with the short error delay.
        wait_for(&calls, 3).await;

        stop.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_disabled_worker_never_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut config = config();
        config.disabled = true;
        let worker = WorkerLoop::new(
            "flaky",
            config,
            Flaky {
                calls: calls.clone(),
            },
        );

        let tracker = TaskTracker::new();
        let handle = worker
            .spawn(&tracker, CancellationToken::new())
            .await
            .unwrap();
        handle.wake_up();
        tracker.close();
        tracker.wait().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
