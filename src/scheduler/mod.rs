//! Background work on a dedicated tokio runtime.
//!
//! Two kinds of work run here: periodic [`BackgroundTask`]s (metrics) and
//! one-off blocking jobs (flushes at [`Priority::High`], compactions at
//! [`Priority::Low`]). Each priority has its own concurrency limit and a pause
//! gate; a paused job stays queued until its gate reopens.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Runtime;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{Result, Severity};
use crate::Error;

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Flushes.
    High,
    /// Compactions.
    Low,
}

struct Gate {
    permits: Arc<Semaphore>,
    paused: watch::Sender<bool>,
}

impl Gate {
    fn new(concurrency: usize) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            paused,
        }
    }
}

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Decrements the in-flight count when a job ends, however it ends.
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// Scheduler manages background tasks with graceful shutdown
pub struct Scheduler {
    runtime: Mutex<Option<Runtime>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    high: Gate,
    low: Gate,
    in_flight: Arc<InFlight>,
}

impl Scheduler {
    pub fn new(max_flushes: usize, max_compactions: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("emberdb-bg")
            .enable_time()
            .build()
            .map_err(|e| Error::io("scheduler start", Severity::Fatal, e))?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
            high: Gate::new(max_flushes),
            low: Gate::new(max_compactions),
            in_flight: Arc::new(InFlight::default()),
        })
    }

    /// Register a periodic background task
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<&Self> {
        let runtime = self.runtime.lock();
        let runtime = runtime.as_ref().ok_or(Error::ShutdownInProgress)?;
        let handle = runtime.spawn(Self::timer_loop(task, self.shutdown_tx.subscribe()));
        self.tasks.lock().push(handle);
        Ok(self)
    }

    async fn timer_loop<T: BackgroundTask + 'static>(
        task: Arc<T>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(task.interval());
        let mut run_id = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_id += 1;
                    let ctx = Context {
                        task_name: task.name(),
                        run_id,
                        shutdown: shutdown_rx.resubscribe(),
                    };

                    if let Err(e) = task.execute(ctx).await {
                        tracing::error!(
                            task = task.name(),
                            error = %e,
                            "Task execution failed"
                        );
                    }
                }

                _ = shutdown_rx.recv() => {
                    tracing::info!(task = task.name(), "Task shutting down");
                    break;
                }
            }
        }
    }

    /// Queues a one-off blocking job. Failures are logged, not returned.
    pub fn schedule<F>(&self, priority: Priority, name: &'static str, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let runtime = self.runtime.lock();
        let runtime = runtime.as_ref().ok_or(Error::ShutdownInProgress)?;

        let gate = self.gate(priority);
        let permits = gate.permits.clone();
        let mut paused = gate.paused.subscribe();

        *self.in_flight.count.lock() += 1;
        let done = InFlightGuard(self.in_flight.clone());

        runtime.spawn(async move {
            let _done = done;
            while *paused.borrow_and_update() {
                if paused.changed().await.is_err() {
                    return;
                }
            }
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match tokio::task::spawn_blocking(job).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(job = name, error = %e, "Background job failed"),
                Err(e) => tracing::error!(job = name, error = %e, "Background job panicked"),
            }
        });
        Ok(())
    }

    fn gate(&self, priority: Priority) -> &Gate {
        match priority {
            Priority::High => &self.high,
            Priority::Low => &self.low,
        }
    }

    /// Holds queued jobs of `priority` until [`resume`](Self::resume).
    /// Jobs already running finish.
    pub fn pause(&self, priority: Priority) {
        self.gate(priority).paused.send_replace(true);
    }

    pub fn resume(&self, priority: Priority) {
        self.gate(priority).paused.send_replace(false);
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.count.lock()
    }

    /// Blocks the calling thread until no job is queued or running.
    ///
    /// Must not be called from the scheduler's own threads, nor while a
    /// priority with queued jobs is paused.
    pub fn wait_for_idle(&self) {
        let mut count = self.in_flight.count.lock();
        while *count > 0 {
            self.in_flight.idle.wait(&mut count);
        }
    }

    /// Stops periodic tasks and tears down the runtime without blocking.
    /// Queued jobs that have not started are dropped.
    pub fn shutdown(&self) {
        self.shutdown_tx.send(()).ok();
        self.tasks.lock().clear();
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestTask {
        name: &'static str,
        interval: Duration,
        counter: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for TestTask {
        fn name(&self) -> &'static str {
            self.name
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_scheduler_basic() -> Result<()> {
        let scheduler = Scheduler::new(1, 1)?;
        let counter = Arc::new(AtomicUsize::new(0));

        let task = Arc::new(TestTask {
            name: "test-task",
            interval: Duration::from_millis(10),
            counter: counter.clone(),
        });

        scheduler.register(task)?;

        // Let it run for a bit
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Should have executed multiple times
        assert!(counter.load(Ordering::SeqCst) > 0);

        scheduler.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_scheduler_graceful_shutdown() -> Result<()> {
        let scheduler = Scheduler::new(1, 1)?;
        let counter = Arc::new(AtomicUsize::new(0));

        let task = Arc::new(TestTask {
            name: "test-task",
            interval: Duration::from_millis(10),
            counter: counter.clone(),
        });

        scheduler.register(task)?;

        // Let it run briefly
        tokio::time::sleep(Duration::from_millis(25)).await;

        // Shutdown should be fast
        let start = std::time::Instant::now();
        scheduler.shutdown();
        assert!(start.elapsed() < Duration::from_millis(100));

        let count_after_shutdown = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(counter.load(Ordering::SeqCst), count_after_shutdown);

        let refused = scheduler.register(Arc::new(TestTask {
            name: "late",
            interval: Duration::from_millis(10),
            counter,
        }));
        assert!(matches!(refused, Err(Error::ShutdownInProgress)));

        Ok(())
    }

    #[test]
    fn test_one_off_jobs_run() {
        let scheduler = Scheduler::new(2, 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let counter = counter.clone();
            scheduler
                .schedule(Priority::High, "count", move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        scheduler
            .schedule(Priority::Low, "fail", || {
                Err(Error::InvalidState("expected".into()))
            })
            .unwrap();

        scheduler.wait_for_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn test_pause_holds_jobs() {
        let scheduler = Scheduler::new(1, 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.pause(Priority::Low);

        {
            let counter = counter.clone();
            scheduler
                .schedule(Priority::Low, "held", move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.in_flight(), 1);

        scheduler.resume(Priority::Low);
        scheduler.wait_for_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_schedule_after_shutdown_is_refused() {
        let scheduler = Scheduler::new(1, 1).unwrap();
        scheduler.shutdown();
        assert!(scheduler.is_shutdown());
        let refused = scheduler.schedule(Priority::High, "late", || Ok(()));
        assert!(matches!(refused, Err(Error::ShutdownInProgress)));
    }
}
