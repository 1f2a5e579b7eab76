//! Memtable switch and the flush job.
//!
//! A switch seals the current log, starts a new one and freezes the active
//! memtable. It runs under barriers on every write lane, so no group is between
//! its log append and its memtable insert while the memtable changes.
//!
//! The flush job drains immutable memtables oldest first: each becomes an L0
//! table, is recorded in the manifest, and then lets go of the logs it pinned.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    error::Result,
    options::FlushOptions,
    scheduler::Priority,
    store::{
        db::DbInner,
        manifest::VersionEdit,
        memtable::Memtable,
        table::{table_path, Table},
        write::{
            pipeline::ExclusiveGuard,
            stall::{self, Backlog},
            StallCondition,
        },
    },
    Error,
};

/// Upper bound between re-checks while waiting on background work.
pub(crate) const BACKGROUND_RECHECK: Duration = Duration::from_millis(50);

impl DbInner {
    /// Switches the memtable once it is full. Called after every write; only
    /// one caller at a time attempts the switch.
    pub(crate) fn maybe_switch_memtable(self: &Arc<Self>) {
        let options = self.options.load_full();
        if options.disable_auto_flush
            || self.state.active_size() < options.write_buffer_size
            || self.errors.check().is_err()
        {
            return;
        }
        if self.switch_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        // Yields to lock_wal rather than waiting out the lock.
        let switched = match self.enter_exclusive(true) {
            Some(guard) => self.switch_memtable(&guard),
            None => Ok(None),
        };
        self.switch_requested.store(false, Ordering::SeqCst);

        match switched {
            Ok(Some(_)) => self.schedule_flush(),
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "Memtable switch failed"),
        }
    }

    /// Freezes the active memtable onto a fresh log. Returns the frozen
    /// memtable's id, or `None` when there was nothing to freeze.
    ///
    /// Any failure here is fatal and sets the background error.
    pub(crate) fn switch_memtable(
        &self,
        _exclusive: &ExclusiveGuard<'_>,
    ) -> Result<Option<u64>> {
        let active = self.state.active();
        if active.is_empty() {
            return Ok(None);
        }

        let number = self.state.next_file_number();
        let rotated = self.log.lock().wal.rotate(number);
        let sealed = match rotated {
            Ok(sealed) => sealed,
            Err(e) => {
                let e = e.into_fatal();
                self.errors.set(e.clone());
                return Err(e);
            }
        };

        let frozen = self.state.install_memtable(Memtable::new(number, number));
        tracing::info!(
            memtable = frozen.id(),
            entries = frozen.len(),
            bytes = frozen.size(),
            sealed_log = sealed,
            new_log = number,
            "Switched memtable"
        );
        self.recalculate_stall();
        Ok(Some(frozen.id()))
    }

    pub(crate) fn schedule_flush(self: &Arc<Self>) {
        let db = self.clone();
        if let Err(e) = self
            .scheduler
            .schedule(Priority::High, "flush", move || db.flush_job())
        {
            tracing::warn!(error = %e, "Could not schedule flush");
        }
    }

    fn flush_job(self: &Arc<Self>) -> Result<()> {
        loop {
            let Some(guard) = self.state.try_start_flush() else {
                return Ok(());
            };
            while let Some(memtable) = self.state.oldest_immutable() {
                if let Err(e) = self.flush_memtable(&memtable) {
                    let e = e.into_fatal();
                    self.errors.set(e.clone());
                    self.notify_background();
                    return Err(e);
                }
            }
            drop(guard);

            // A switch may have queued a memtable after the last check but
            // before the guard was released.
            if self.state.oldest_immutable().is_none() {
                return Ok(());
            }
        }
    }

    fn flush_memtable(self: &Arc<Self>, memtable: &Memtable) -> Result<()> {
        let table_id = self.state.next_file_number();
        let table = Table::write(
            self.fs.as_ref(),
            table_path(&self.sst_dir(), table_id),
            table_id,
            0,
            memtable.entries(),
        )?;

        let log_number = self.state.min_log_without(memtable.id());
        self.state.manifest.lock().log_and_apply(&[
            VersionEdit::AddTable(table.meta().clone()),
            VersionEdit::LogNumber(log_number),
            VersionEdit::NextFileNumber(self.state.next_file_number.load(Ordering::SeqCst)),
            VersionEdit::LastSequence(self.visibility.published().max(memtable.max_sequence())),
        ])?;

        {
            // Flush waiters see the table, the memtable's removal and the new
            // stall condition together.
            let _guard = self.bg_mutex.lock();
            // Readers must find the table before the memtable disappears.
            self.state.levels.write()[0].push(Arc::new(table));
            self.state.remove_immutable(memtable.id());
            self.recalculate_stall();
            self.bg_cv.notify_all();
        }
        let retired = self.log.lock().wal.retire(log_number);

        tracing::info!(
            memtable = memtable.id(),
            table_id,
            entries = memtable.len(),
            ?retired,
            "Flushed memtable to table"
        );

        self.maybe_schedule_compaction();
        Ok(())
    }

    /// Switches the memtable and schedules its flush.
    ///
    /// Fails with `InvalidState` while `lock_wal` holds the lanes.
    pub(crate) fn flush(self: &Arc<Self>, opts: &FlushOptions) -> Result<()> {
        self.errors.check()?;
        if !opts.allow_write_stall {
            self.wait_until_flush_cannot_stall()?;
        }

        let target = {
            let guard = self.enter_exclusive(true).ok_or_else(|| {
                Error::InvalidState("cannot flush while the WAL is locked".to_string())
            })?;
            let frozen = self.switch_memtable(&guard)?;
            frozen.or_else(|| self.state.newest_immutable_id())
        };

        let Some(target) = target else {
            return Ok(());
        };
        self.schedule_flush();
        if opts.wait {
            self.wait_for_flush(target)?;
        }
        Ok(())
    }

    /// Blocks until one more immutable memtable and one more L0 table would
    /// leave writes unstalled.
    ///
    /// Fails with `Incomplete` when no queued or running background work can
    /// shrink the backlog, since waiting would never end.
    fn wait_until_flush_cannot_stall(&self) -> Result<()> {
        let mut guard = self.bg_mutex.lock();
        loop {
            self.errors.check()?;
            let options = self.options.load_full();
            let backlog = self.state.backlog();
            let after = Backlog {
                immutable_memtables: backlog.immutable_memtables + 1,
                level0_tables: backlog.level0_tables + 1,
            };
            let condition = stall::evaluate(&options, &after);
            if condition == StallCondition::Normal {
                return Ok(());
            }

            let draining = backlog.immutable_memtables > 0
                || self.state.compaction_running.load(Ordering::SeqCst)
                || (!options.disable_auto_compactions
                    && backlog.level0_tables >= options.level0_file_num_compaction_trigger);
            if !draining {
                return Err(Error::Incomplete(format!(
                    "flush would stall writes: {:?}",
                    condition
                )));
            }
            self.bg_cv.wait_for(&mut guard, BACKGROUND_RECHECK);
        }
    }

    /// Blocks until memtable `id` and everything older is flushed.
    fn wait_for_flush(&self, id: u64) -> Result<()> {
        let mut guard = self.bg_mutex.lock();
        while self.state.has_unflushed_through(id) {
            self.errors.check()?;
            self.bg_cv.wait_for(&mut guard, BACKGROUND_RECHECK);
        }
        Ok(())
    }

    pub(crate) fn notify_background(&self) {
        let _guard = self.bg_mutex.lock();
        self.bg_cv.notify_all();
    }
}
