//! Debounced scheduling of a single logical task.
//!
//! Bursts of change notifications are coalesced: the task runs once the
//! triggers have been quiet for the configured delay. At most one run
//! executes at a time, and a trigger that arrives during a run causes
//! exactly one follow-up run right after it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A unit of work driven by [`DebouncedTask`].
#[async_trait]
pub trait ReconcileTask: Send + Sync + 'static {
    /// Performs one full run. Runs are never cancelled once started.
    async fn run(&self);
}

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    rerun: bool,
}

struct Inner {
    delay: Duration,
    state: Mutex<RunState>,
    wake: Notify,
    shutdown: CancellationToken,
    completed: AtomicU64,
}

/// Wraps a [`ReconcileTask`] with trigger coalescing.
///
/// Every trigger is eventually followed by a completed run that started
/// after it, but there is no one-to-one mapping between triggers and runs.
pub struct DebouncedTask {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DebouncedTask {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn(task: Arc<dyn ReconcileTask>, delay: Duration) -> Self {
        let inner = Arc::new(Inner {
            delay,
            state: Mutex::new(RunState::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            completed: AtomicU64::new(0),
        });
        let worker = tokio::spawn(worker_loop(Arc::clone(&inner), task));

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Requests a run.
    ///
    /// If no run is in flight, (re)starts the quiescence timer. If one is in
    /// flight, marks a follow-up run.
    pub fn trigger(&self) {
        let mut state = self.inner.state.lock();
        if state.running {
            trace!("Run in flight, marking follow-up");
            state.rerun = true;
        } else {
            trace!("Scheduling run in {:?}", self.inner.delay);
            self.inner.wake.notify_one();
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    /// Number of runs completed so far.
    pub fn completed_runs(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// True while a run is executing.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Stops the worker.
    ///
    /// A run that is in flight or already scheduled completes first; later
    /// triggers are ignored.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                debug!("Scheduler worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for DebouncedTask {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn worker_loop(inner: Arc<Inner>, task: Arc<dyn ReconcileTask>) {
    loop {
        // A trigger already pending at shutdown still gets its run.
        tokio::select! {
            biased;
            _ = inner.wake.notified() => {}
            _ = inner.shutdown.cancelled() => break,
        }

        // Quiescence: every further trigger restarts the timer.
        loop {
            tokio::select! {
                _ = tokio::time::sleep(inner.delay) => break,
                _ = inner.wake.notified() => trace!("Trigger during delay, restarting timer"),
                _ = inner.shutdown.cancelled() => break,
            }
        }

        loop {
            inner.state.lock().running = true;
            task.run().await;
            inner.completed.fetch_add(1, Ordering::AcqRel);

            let mut state = inner.state.lock();
            state.running = false;
            if !std::mem::take(&mut state.rerun) || inner.shutdown.is_cancelled() {
                break;
            }
            debug!("Trigger arrived during run, running again");
        }

        if inner.shutdown.is_cancelled() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        runs: AtomicUsize,
        observed: AtomicU64,
        source: AtomicU64,
        run_time: Duration,
    }

    #[async_trait]
    impl ReconcileTask for Recorder {
        async fn run(&self) {
            self.observed
                .store(self.source.load(Ordering::SeqCst), Ordering::SeqCst);
            if !self.run_time.is_zero() {
                tokio::time::sleep(self.run_time).await;
            }
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    const DELAY: Duration = Duration::from_millis(250);

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_run() {
        let recorder = Arc::new(Recorder::default());
        let task = DebouncedTask::spawn(recorder.clone(), DELAY);

        for version in 1..=10 {
            recorder.source.store(version, Ordering::SeqCst);
            task.trigger();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(recorder.runs.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.observed.load(Ordering::SeqCst), 10);
        assert_eq!(task.completed_runs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_restarts_on_trigger() {
        let recorder = Arc::new(Recorder::default());
        let task = DebouncedTask::spawn(recorder.clone(), DELAY);

        task.trigger();
        tokio::time::sleep(Duration::from_millis(200)).await;
        task.trigger();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // 400ms after the first trigger, but only 200ms after the last
        assert_eq!(recorder.runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_during_run_schedules_one_follow_up() {
        let recorder = Arc::new(Recorder {
            run_time: Duration::from_secs(1),
            ..Default::default()
        });
        let task = DebouncedTask::spawn(recorder.clone(), DELAY);

        task.trigger();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(task.is_running());

        recorder.source.store(7, Ordering::SeqCst);
        task.trigger();
        task.trigger();
        task.trigger();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recorder.runs.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.observed.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_run_separately() {
        let recorder = Arc::new(Recorder::default());
        let task = DebouncedTask::spawn(recorder.clone(), DELAY);

        task.trigger();
        tokio::time::sleep(Duration::from_secs(1)).await;
        task.trigger();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(recorder.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_scheduled_run() {
        let recorder = Arc::new(Recorder::default());
        let task = DebouncedTask::spawn(recorder.clone(), DELAY);

        task.trigger();
        tokio::task::yield_now().await;
        task.close().await;
        assert_eq!(recorder.runs.load(Ordering::SeqCst), 1);

        task.trigger();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_trigger_no_run() {
        let recorder = Arc::new(Recorder::default());
        let _task = DebouncedTask::spawn(recorder.clone(), DELAY);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(recorder.runs.load(Ordering::SeqCst), 0);
    }
}
