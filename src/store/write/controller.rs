//! Process-wide stop/delay state consulted by every write group leader.
//!
//! Stall conditions are held as RAII tokens: while any [`StopWriteToken`] is
//! alive writes are stopped, and while any [`DelayWriteToken`] is alive writes
//! are rate limited through a token bucket. Dropping the last stop token wakes
//! writers blocked in [`WriteController::wait_while_stopped`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

/// Upper bound on a blocked writer's sleep between re-checks.
const STOP_RECHECK: Duration = Duration::from_millis(50);

/// Refill horizon for the token bucket. Credit never exceeds this much rate.
const BUCKET_REFILL_WINDOW: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Bucket {
    credit: i64,
    last_refill: Instant,
}

#[derive(Debug)]
struct Inner {
    total_stopped: AtomicUsize,
    total_delayed: AtomicUsize,
    delayed_write_rate: AtomicU64,
    max_delayed_write_rate: u64,
    bucket: Mutex<Bucket>,
    stop_mutex: Mutex<()>,
    stop_cv: Condvar,
}

/// Shared handle; clones refer to the same controller.
#[derive(Debug, Clone)]
pub struct WriteController {
    inner: Arc<Inner>,
}

impl WriteController {
    pub fn new(delayed_write_rate: u64) -> Self {
        let rate = delayed_write_rate.max(1);
        Self {
            inner: Arc::new(Inner {
                total_stopped: AtomicUsize::new(0),
                total_delayed: AtomicUsize::new(0),
                delayed_write_rate: AtomicU64::new(rate),
                max_delayed_write_rate: rate,
                bucket: Mutex::new(Bucket {
                    credit: 0,
                    last_refill: Instant::now(),
                }),
                stop_mutex: Mutex::new(()),
                stop_cv: Condvar::new(),
            }),
        }
    }

    pub fn get_stop_token(&self) -> StopWriteToken {
        self.inner.total_stopped.fetch_add(1, Ordering::SeqCst);
        StopWriteToken {
            controller: self.clone(),
        }
    }

    /// Delays writes at `rate` bytes/sec until the token is dropped.
    pub fn get_delay_token(&self, rate: u64) -> DelayWriteToken {
        if self.inner.total_delayed.fetch_add(1, Ordering::SeqCst) == 0 {
            // Fresh delay period; forget credit earned while unthrottled.
            let mut bucket = self.inner.bucket.lock();
            bucket.credit = 0;
            bucket.last_refill = Instant::now();
        }
        self.set_delayed_write_rate(rate);
        DelayWriteToken {
            controller: self.clone(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.total_stopped.load(Ordering::SeqCst) > 0
    }

    pub fn needs_delay(&self) -> bool {
        self.inner.total_delayed.load(Ordering::SeqCst) > 0
    }

    pub fn delayed_write_rate(&self) -> u64 {
        self.inner.delayed_write_rate.load(Ordering::SeqCst)
    }

    pub fn max_delayed_write_rate(&self) -> u64 {
        self.inner.max_delayed_write_rate
    }

    /// Clamped to `1..=max_delayed_write_rate`.
    pub fn set_delayed_write_rate(&self, rate: u64) {
        let rate = rate.clamp(1, self.inner.max_delayed_write_rate);
        self.inner.delayed_write_rate.store(rate, Ordering::SeqCst);
    }

    /// How long a writer of `bytes` must sleep before proceeding.
    ///
    /// Zero when writes are not delayed, and also when stopped: stopping is
    /// handled by [`wait_while_stopped`](Self::wait_while_stopped).
    pub fn get_delay(&self, bytes: u64) -> Duration {
        if self.is_stopped() || !self.needs_delay() {
            return Duration::ZERO;
        }
        let rate = self.delayed_write_rate();
        let mut bucket = self.inner.bucket.lock();
        self.refill(&mut bucket, rate);

        bucket.credit -= bytes as i64;
        if bucket.credit >= 0 {
            return Duration::ZERO;
        }
        let debt = bucket.credit.unsigned_abs();
        Duration::from_secs_f64(debt as f64 / rate as f64)
    }

    /// Charges `bytes` to the bucket without sleeping.
    ///
    /// Used for writers that may not be slowed down, so they still count
    /// against the budget of delayed writers.
    pub fn charge(&self, bytes: u64) {
        if !self.needs_delay() {
            return;
        }
        let rate = self.delayed_write_rate();
        let mut bucket = self.inner.bucket.lock();
        self.refill(&mut bucket, rate);
        bucket.credit -= bytes as i64;
    }

    fn refill(&self, bucket: &mut Bucket, rate: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        bucket.last_refill = now;
        let earned = (elapsed.as_secs_f64() * rate as f64) as i64;
        let cap = (BUCKET_REFILL_WINDOW.as_secs_f64() * rate as f64).max(1.0) as i64;
        bucket.credit = bucket.credit.saturating_add(earned).min(cap);
    }

    /// Blocks while writes are stopped.
    ///
    /// `check` runs before every wait and on every wakeup; an error from it
    /// ends the wait. The engine passes its background-error check so a fatal
    /// error releases stalled writers.
    pub fn wait_while_stopped<F>(&self, check: F) -> Result<()>
    where
        F: Fn() -> Result<()>,
    {
        let mut guard = self.inner.stop_mutex.lock();
        loop {
            check()?;
            if !self.is_stopped() {
                return Ok(());
            }
            self.inner.stop_cv.wait_for(&mut guard, STOP_RECHECK);
        }
    }

    /// Wakes every writer blocked in `wait_while_stopped`.
    pub fn notify_waiters(&self) {
        let _guard = self.inner.stop_mutex.lock();
        self.inner.stop_cv.notify_all();
    }
}

#[must_use = "writes resume as soon as the token is dropped"]
#[derive(Debug)]
pub struct StopWriteToken {
    controller: WriteController,
}

impl Drop for StopWriteToken {
    fn drop(&mut self) {
        self.controller
            .inner
            .total_stopped
            .fetch_sub(1, Ordering::SeqCst);
        self.controller.notify_waiters();
    }
}

#[must_use = "the delay ends as soon as the token is dropped"]
#[derive(Debug)]
pub struct DelayWriteToken {
    controller: WriteController,
}

impl Drop for DelayWriteToken {
    fn drop(&mut self) {
        self.controller
            .inner
            .total_delayed
            .fetch_sub(1, Ordering::SeqCst);
    }
}
