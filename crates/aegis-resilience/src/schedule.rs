//! Cancellable periodic tasks.
//!
//! A [`PeriodicTask`] runs a job, waits `interval`, and runs it again until it
//! is stopped. The next run is scheduled only after the previous one finished,
//! whatever its outcome, so slow jobs never overlap themselves.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A restartable, self-rescheduling background job.
pub struct PeriodicTask {
    name: String,
    interval: Duration,
    run_immediately: bool,
    job: Job,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl PeriodicTask {
    /// Creates a stopped task. Call [`start`](Self::start) to schedule it.
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            run_immediately: false,
            job: Arc::new(move || Box::pin(job())),
            running: None,
        }
    }

    /// Runs the job as soon as the task starts instead of after one interval.
    #[must_use]
    pub fn run_immediately(mut self, run_immediately: bool) -> Self {
        self.run_immediately = run_immediately;
        self
    }

    /// Task name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delay between the end of one run and the start of the next.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns `true` while the task is scheduled.
    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|(token, handle)| !token.is_cancelled() && !handle.is_finished())
    }

    /// Spawns the task onto the current tokio runtime. No-op if already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let job = Arc::clone(&self.job);
        let interval = self.interval;
        let run_immediately = self.run_immediately;
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            debug!(task = %name, interval_ms = interval.as_millis() as u64, "Periodic task started");
            if !run_immediately {
                tokio::select! {
                    biased;
                    () = child.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            loop {
                tokio::select! {
                    biased;
                    () = child.cancelled() => break,
                    () = job() => {}
                }
                tokio::select! {
                    biased;
                    () = child.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            debug!(task = %name, "Periodic task stopped");
        });

        self.running = Some((token, handle));
    }

    /// Cancels the task. A run in progress is dropped at its next suspension point.
    pub fn stop(&mut self) {
        if let Some((token, _handle)) = self.running.take() {
            token.cancel();
        }
    }

    /// Stops and starts the task, resetting its schedule.
    pub fn restart(&mut self) {
        self.stop();
        self.start();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_task(counter: &Arc<AtomicU32>, interval: Duration) -> PeriodicTask {
        let counter = Arc::clone(counter);
        PeriodicTask::new("counter", interval, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_interval() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut task = counting_task(&counter, Duration::from_secs(10));
        task.start();
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut task = counting_task(&counter, Duration::from_secs(10)).run_immediately(true);
        task.start();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_restart() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut task = counting_task(&counter, Duration::from_secs(1));
        task.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        task.stop();
        assert!(!task.is_running());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        task.restart();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
