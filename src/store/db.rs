use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};

use super::{
    compaction::CompactionJob,
    error_handler::ErrorHandler,
    metrics::{MetricsTask, StateMetrics},
    recovery::{self, SST_DIR},
    state::DbState,
    write::{
        pipeline::{LogState, MemtableStage, VisibilityTracker},
        stall::StallEvaluator,
        thread::WriteThread,
        StallCondition, WriteController,
    },
    Store,
};
use crate::{
    batch::{SequenceNumber, WriteBatch},
    config::{ColumnFamilyOptions, DbConfig, WriteMode},
    error::Result,
    flock::FileLock,
    fs::FileSystem,
    options::{FlushOptions, WriteOptions},
    scheduler::{Priority, Scheduler},
    Error,
};

/// Everything a write, a background job or a reader touches.
pub struct DbInner {
    pub(crate) config: DbConfig,
    pub(crate) fs: Arc<dyn FileSystem>,
    /// Live mutable options. Jobs keep the `Arc` they loaded.
    pub(crate) options: ArcSwap<ColumnFamilyOptions>,
    options_lock: Mutex<()>,

    pub(crate) controller: WriteController,
    pub(crate) stall: StallEvaluator,
    stall_lock: Mutex<()>,
    pub(crate) errors: ErrorHandler,

    pub(crate) lanes: Vec<WriteThread>,
    pub(crate) next_lane: AtomicUsize,
    pub(crate) stage: Option<MemtableStage>,
    pub(crate) visibility: VisibilityTracker,
    pub(crate) log: Mutex<LogState>,
    pub(crate) wal_locks: Mutex<usize>,
    pub(crate) switch_requested: AtomicBool,

    pub(crate) state: DbState,
    pub(crate) scheduler: Scheduler,
    pub(crate) bg_mutex: Mutex<()>,
    pub(crate) bg_cv: Condvar,

    _lock: FileLock,
}

impl DbInner {
    pub(crate) fn sst_dir(&self) -> PathBuf {
        self.config.dir.join(SST_DIR)
    }

    /// Re-derives the stall condition from the live options and backlog.
    pub(crate) fn recalculate_stall(&self) -> StallCondition {
        let _guard = self.stall_lock.lock();
        let live = self.options.load_full();
        self.stall
            .recalculate(&self.controller, &live, self.state.backlog())
    }

    fn flush_wal(&self, sync: bool) -> Result<()> {
        let mut log = self.log.lock();
        let flushed = if sync {
            log.wal.sync()
        } else {
            log.wal.flush()
        };
        drop(log);
        if let Err(e) = &flushed {
            if e.is_fatal() {
                self.errors.set(e.clone());
            }
        }
        flushed
    }
}

/// An open database. Dropping it stops background work.
pub struct Db {
    pub(crate) inner: Arc<DbInner>,
}

impl Db {
    pub fn open(config: DbConfig) -> Result<Self> {
        config.validate()?;
        let recovered = recovery::recover(&config)?;

        let controller = WriteController::new(config.delayed_write_rate);
        let stall = StallEvaluator::new(
            config.delay_policy.clone(),
            config.delayed_write_rate,
            config.min_delayed_write_rate,
        );
        let lanes = (0..config.lane_count()).map(WriteThread::new).collect();
        let stage = (config.write_mode == WriteMode::Pipelined)
            .then(|| MemtableStage::new(config.max_pending_memtable_groups));
        let scheduler = Scheduler::new(
            config.max_background_flushes,
            config.max_background_compactions,
        )?;

        let inner = Arc::new(DbInner {
            fs: config.fs.clone(),
            options: ArcSwap::from_pointee(config.cf_options.clone()),
            options_lock: Mutex::new(()),
            errors: ErrorHandler::new(controller.clone()),
            controller,
            stall,
            stall_lock: Mutex::new(()),
            lanes,
            next_lane: AtomicUsize::new(0),
            stage,
            visibility: VisibilityTracker::new(recovered.last_sequence),
            log: Mutex::new(LogState {
                wal: recovered.wal,
                last_allocated: recovered.last_sequence,
            }),
            wal_locks: Mutex::new(0),
            switch_requested: AtomicBool::new(false),
            state: recovered.state,
            scheduler,
            bg_mutex: Mutex::new(()),
            bg_cv: Condvar::new(),
            _lock: recovered.lock,
            config,
        });

        if !inner.config.metrics_interval.is_zero() {
            inner
                .scheduler
                .register(Arc::new(MetricsTask::new(&inner)))?;
        }
        inner.recalculate_stall();
        inner.maybe_schedule_compaction();

        tracing::info!(
            dir = %inner.config.dir.display(),
            mode = ?inner.config.write_mode,
            lanes = inner.lanes.len(),
            last_sequence = recovered.last_sequence,
            "Opened database"
        );
        Ok(Db { inner })
    }

    /// Applies `batch` atomically and returns the sequence of its last
    /// operation. An empty batch returns the latest visible sequence.
    pub fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> Result<SequenceNumber> {
        self.inner.write_impl(opts, batch)
    }

    /// Reads the newest visible value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let snapshot = self.inner.visibility.published();
        let (active, immutables) = {
            let memtables = self.inner.state.memtables.read();
            (memtables.active.clone(), memtables.immutables.clone())
        };
        for memtable in std::iter::once(&active).chain(immutables.iter().rev()) {
            if let Some(value) = memtable.get(key, snapshot) {
                return Ok(value);
            }
        }

        // L0 tables overlap, so newest first; L1 holds at most one table.
        let levels = self.inner.state.levels.read().clone();
        for table in levels.iter().flat_map(|tables| tables.iter().rev()) {
            if let Some(value) = table.get(key, snapshot) {
                return Ok(value);
            }
        }
        Ok(None)
    }

    /// Flushes the log buffer and blocks new groups from the log until
    /// [`unlock_wal`](Self::unlock_wal). Nests.
    pub fn lock_wal(&self) -> Result<()> {
        let mut locks = self.inner.wal_locks.lock();
        if *locks == 0 {
            let exclusive = self
                .inner
                .enter_exclusive(false)
                .ok_or_else(|| Error::InvalidState("write lanes unavailable".to_string()))?;
            self.inner.flush_wal(false)?;
            for lane in &self.inner.lanes {
                lane.lock();
            }
            drop(exclusive);
        } else {
            self.inner.flush_wal(false)?;
        }
        *locks += 1;
        tracing::debug!(depth = *locks, "WAL locked");
        Ok(())
    }

    pub fn unlock_wal(&self) -> Result<()> {
        let mut locks = self.inner.wal_locks.lock();
        if *locks == 0 {
            return Err(Error::InvalidState("WAL is not locked".to_string()));
        }
        *locks -= 1;
        if *locks == 0 {
            for lane in &self.inner.lanes {
                lane.unlock();
            }
        }
        tracing::debug!(depth = *locks, "WAL unlocked");
        Ok(())
    }

    /// Pushes buffered log records to the OS, and fsyncs if `sync`.
    pub fn flush_wal(&self, sync: bool) -> Result<()> {
        self.inner.flush_wal(sync)
    }

    pub fn sync_wal(&self) -> Result<()> {
        self.inner.flush_wal(true)
    }

    /// Freezes the active memtable and flushes it to L0.
    ///
    /// Refused with `InvalidState` while the WAL is locked. Unless
    /// `allow_write_stall` is set, it first waits until the extra memtable and
    /// L0 table would not stall writes, and fails with `Incomplete` when no
    /// background work can get there.
    pub fn flush(&self, opts: &FlushOptions) -> Result<()> {
        self.inner.flush(opts)
    }

    /// Applies string option changes to the live options.
    ///
    /// Takes effect for every write admitted after it returns. Nothing is
    /// written to the manifest.
    pub fn set_options(&self, changes: &[(&str, &str)]) -> Result<()> {
        {
            let _guard = self.inner.options_lock.lock();
            let next = self.inner.options.load().apply(changes)?;
            self.inner.options.store(Arc::new(next));
            tracing::info!(?changes, "Options updated");
        }
        self.inner.recalculate_stall();
        self.inner.notify_background();
        self.inner.maybe_schedule_compaction();
        Ok(())
    }

    pub fn options(&self) -> Arc<ColumnFamilyOptions> {
        self.inner.options.load_full()
    }

    /// Leaves read-only mode once the log can be written and synced again.
    pub fn resume(&self) -> Result<()> {
        let Some(error) = self.inner.errors.current() else {
            return Ok(());
        };
        tracing::info!(error = %error, "Resuming after background error");

        self.inner.log.lock().wal.recover()?;
        self.inner.errors.clear();
        self.inner.recalculate_stall();
        if self.inner.state.immutable_count() > 0 {
            self.inner.schedule_flush();
        }
        self.inner.maybe_schedule_compaction();
        Ok(())
    }

    /// Holds queued flushes and compactions; running ones finish.
    pub fn pause_background_work(&self) {
        self.inner.scheduler.pause(Priority::High);
        self.inner.scheduler.pause(Priority::Low);
    }

    pub fn continue_background_work(&self) {
        self.inner.scheduler.resume(Priority::High);
        self.inner.scheduler.resume(Priority::Low);
    }

    /// Blocks until no flush or compaction is queued or running.
    pub fn wait_for_background_work(&self) {
        self.inner.scheduler.wait_for_idle();
    }

    /// Picks L0 and L1 for a manual compaction, ignoring the trigger. `None`
    /// when L0 is empty or a compaction is already running.
    pub fn pick_compaction(&self) -> Option<CompactionJob> {
        self.inner.pick_compaction(true)
    }

    pub fn run_compaction(&self, job: CompactionJob) -> Result<()> {
        self.inner.run_compaction(job)
    }

    pub fn write_controller(&self) -> &WriteController {
        &self.inner.controller
    }

    pub fn stall_condition(&self) -> StallCondition {
        self.inner.stall.condition()
    }

    pub fn wal_buffer_is_empty(&self) -> bool {
        self.inner.log.lock().wal.buffer_is_empty()
    }

    /// Log record bytes written since open.
    pub fn wal_bytes_written(&self) -> u64 {
        self.inner.log.lock().wal.bytes_written()
    }

    /// Manifest records written since open.
    pub fn manifest_update_sequence(&self) -> u64 {
        self.inner.state.manifest.lock().update_sequence()
    }

    pub fn latest_sequence(&self) -> SequenceNumber {
        self.inner.visibility.published()
    }

    pub fn background_error(&self) -> Option<Error> {
        self.inner.errors.current()
    }

    pub fn metrics(&self) -> StateMetrics {
        self.inner.state.metrics()
    }

    /// Finishes background work, syncs the log and stops the scheduler.
    pub fn close(self) -> Result<()> {
        self.continue_background_work();
        self.inner.scheduler.wait_for_idle();
        let synced = match self.inner.errors.current() {
            Some(_) => Ok(()),
            None => self.inner.flush_wal(true),
        };
        self.inner.scheduler.shutdown();
        tracing::info!(dir = %self.inner.config.dir.display(), "Closed database");
        synced
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.inner.scheduler.shutdown();
    }
}

impl Store for Db {
    fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> Result<SequenceNumber> {
        Db::write(self, opts, batch)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Db::get(self, key)
    }

    fn flush_wal(&self, sync: bool) -> Result<()> {
        Db::flush_wal(self, sync)
    }
}
