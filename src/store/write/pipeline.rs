//! Drives a write from admission to visibility.
//!
//! Every mode runs the same phases for a group: admission against the write
//! controller, sequence allocation plus one log append, memtable insert,
//! publication and completion. The modes differ in who runs which phase:
//!
//! - [`WriteMode::Sequential`]: one lane, the leader runs every phase.
//! - [`WriteMode::Pipelined`]: one lane. After its log append the leader queues
//!   its group on the [`MemtableStage`] and hands the lane on, so the next
//!   group's log phase overlaps this group's insert. Inserts run in stage order,
//!   which is sequence order.
//! - [`WriteMode::ConcurrentWal`]: several lanes whose leaders contend only on
//!   the log mutex.
//!
//! Reads see the [`VisibilityTracker`]'s published sequence, which only ever
//! covers a contiguous prefix of completed groups.
//!
//! [`WriteMode::Sequential`]: crate::config::WriteMode::Sequential
//! [`WriteMode::Pipelined`]: crate::config::WriteMode::Pipelined
//! [`WriteMode::ConcurrentWal`]: crate::config::WriteMode::ConcurrentWal

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::thread::{ParallelInsert, WriteGroup, WriteThread, Writer, WriterState};
use crate::batch::{SequenceNumber, WriteBatch};
use crate::error::Result;
use crate::options::WriteOptions;
use crate::store::db::DbInner;
use crate::store::wal::Wal;
use crate::Error;

/// The log plus the last sequence handed out. Guarded by one mutex so that
/// log order is sequence order.
#[derive(Debug)]
pub(crate) struct LogState {
    pub wal: Wal,
    pub last_allocated: SequenceNumber,
}

#[derive(Debug, Default)]
struct StageQueue {
    next_ticket: u64,
    head: u64,
}

/// Bounded FIFO between the log phase and the memtable phase.
///
/// A ticket is taken while the group still holds log leadership, so ticket
/// order is sequence order. The holder of the head ticket is the memtable
/// writer leader.
#[derive(Debug)]
pub struct MemtableStage {
    capacity: usize,
    queue: Mutex<StageQueue>,
    cv: Condvar,
}

impl MemtableStage {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: Mutex::new(StageQueue::default()),
            cv: Condvar::new(),
        }
    }

    /// Blocks while the stage is full.
    pub fn enqueue(&self) -> u64 {
        let mut q = self.queue.lock();
        while q.next_ticket - q.head >= self.capacity as u64 {
            self.cv.wait(&mut q);
        }
        let ticket = q.next_ticket;
        q.next_ticket += 1;
        ticket
    }

    pub fn wait_turn(&self, ticket: u64) {
        let mut q = self.queue.lock();
        while q.head != ticket {
            self.cv.wait(&mut q);
        }
    }

    pub fn finish(&self, ticket: u64) {
        let mut q = self.queue.lock();
        debug_assert_eq!(q.head, ticket, "stage finished out of order");
        q.head += 1;
        self.cv.notify_all();
    }

    /// Blocks until every queued group has finished.
    pub fn wait_idle(&self) {
        let mut q = self.queue.lock();
        while q.head != q.next_ticket {
            self.cv.wait(&mut q);
        }
    }

    pub fn pending(&self) -> usize {
        let q = self.queue.lock();
        (q.next_ticket - q.head) as usize
    }
}

/// Highest sequence below which every group has been applied.
#[derive(Debug)]
pub struct VisibilityTracker {
    published: AtomicU64,
    finished: Mutex<BTreeMap<SequenceNumber, SequenceNumber>>,
    advanced: Condvar,
}

impl VisibilityTracker {
    pub fn new(start: SequenceNumber) -> Self {
        Self {
            published: AtomicU64::new(start),
            finished: Mutex::new(BTreeMap::new()),
            advanced: Condvar::new(),
        }
    }

    pub fn published(&self) -> SequenceNumber {
        self.published.load(Ordering::Acquire)
    }

    /// Marks `first..=last` applied and advances over any contiguous prefix.
    pub fn publish(&self, first: SequenceNumber, last: SequenceNumber) {
        let mut finished = self.finished.lock();
        finished.insert(first, last);
        let mut current = self.published.load(Ordering::Acquire);
        while let Some(entry) = finished.first_entry() {
            if *entry.key() != current + 1 {
                break;
            }
            current = entry.remove();
        }
        self.published.store(current, Ordering::Release);
        self.advanced.notify_all();
    }

    /// Blocks until `seq` is published.
    pub fn wait_visible(&self, seq: SequenceNumber) {
        let mut finished = self.finished.lock();
        while self.published() < seq {
            self.advanced.wait(&mut finished);
        }
    }
}

/// Barriers held on every lane. Dropping it releases them in lane order.
#[derive(Debug)]
pub(crate) struct ExclusiveGuard<'a> {
    held: Vec<(&'a WriteThread, Arc<Writer>)>,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        for (lane, barrier) in self.held.drain(..) {
            barrier.complete(Ok(()));
            lane.hand_off();
        }
    }
}

impl DbInner {
    pub(crate) fn write_impl(
        self: &Arc<Self>,
        opts: &WriteOptions,
        batch: WriteBatch,
    ) -> Result<SequenceNumber> {
        if opts.sync && opts.disable_wal {
            return Err(Error::InvalidArgument(
                "sync and disable_wal cannot both be set".to_string(),
            ));
        }
        WriteBatch::check_size(batch.size())?;
        self.errors.check()?;
        if batch.is_empty() {
            return Ok(self.visibility.published());
        }

        let count = batch.count() as u64;
        let writer = Arc::new(Writer::new(batch, opts.clone()));
        let lane = self.pick_lane();

        match lane.join(&writer) {
            WriterState::GroupLeader => self.lead_group(lane, &writer)?,
            WriterState::ParallelMemtableWriter => {
                self.insert_parallel(&writer);
                writer.wait_for(|s| s == WriterState::Completed);
                writer.status()?;
            }
            WriterState::Completed => writer.status()?,
            other => {
                return Err(Error::InvalidState(format!(
                    "writer woke in state {:?}",
                    other
                )))
            }
        }

        self.maybe_switch_memtable();
        Ok(writer.sequence() + count - 1)
    }

    fn pick_lane(&self) -> &WriteThread {
        let n = self.next_lane.fetch_add(1, Ordering::Relaxed);
        &self.lanes[n % self.lanes.len()]
    }

    fn lead_group(self: &Arc<Self>, lane: &WriteThread, leader: &Arc<Writer>) -> Result<()> {
        if let Err(e) = self.admit(lane, leader) {
            leader.complete(Err(e.clone()));
            lane.hand_off();
            return Err(e);
        }

        let group = lane.build_group(
            leader,
            self.config.max_write_group_bytes,
            self.config.max_write_group_size,
        );

        let first = match self.write_to_log(&group) {
            Ok(first) => first,
            Err(e) => {
                let status = Err(e);
                group.complete(&status);
                lane.hand_off();
                return status;
            }
        };
        let last = first + group.total_count() - 1;

        match &self.stage {
            Some(stage) => {
                let ticket = stage.enqueue();
                lane.hand_off();
                stage.wait_turn(ticket);
                leader.set_state(WriterState::MemtableWriterLeader);
                let status = self.apply_group(&group);
                self.visibility.publish(first, last);
                stage.finish(ticket);
                group.complete(&status);
                status
            }
            None => {
                let status = self.apply_group(&group);
                self.visibility.publish(first, last);
                lane.hand_off();
                // Another lane may still hold an earlier range.
                self.visibility.wait_visible(last);
                group.complete(&status);
                status
            }
        }
    }

    /// Decides whether the leader may proceed: fails fast, waits out a stop,
    /// or sleeps off a delay.
    fn admit(&self, lane: &WriteThread, leader: &Writer) -> Result<()> {
        self.errors.check()?;
        let opts = leader.options();

        loop {
            if self.controller.is_stopped() && !opts.bypass_stall {
                if opts.no_slowdown {
                    return Err(Error::Incomplete("write stall".to_string()));
                }
                for writer in lane.begin_stall() {
                    writer.complete(Err(Error::Incomplete("write stall".to_string())));
                }
                tracing::debug!(lane = lane.id(), "Write group blocked by stall");
                let waited = self.controller.wait_while_stopped(|| self.errors.check());
                lane.end_stall();
                waited?;
            }

            if !self.controller.needs_delay() {
                return Ok(());
            }
            let bytes = lane.last_group_bytes().max(leader.byte_size()) as u64;
            if opts.no_slowdown || opts.bypass_stall {
                self.controller.charge(bytes);
                return Ok(());
            }
            let delay = self.controller.get_delay(bytes);
            if delay.is_zero() {
                return Ok(());
            }
            tracing::debug!(lane = lane.id(), bytes, ?delay, "Delaying write group");
            std::thread::sleep(delay);
            if !self.controller.is_stopped() {
                return Ok(());
            }
        }
    }

    /// Allocates the group's sequence range and appends its record.
    ///
    /// A recoverable failure hands back the sequences. A fatal one keeps them
    /// allocated and published so the visible prefix stays contiguous.
    fn write_to_log(&self, group: &WriteGroup) -> Result<SequenceNumber> {
        let mut log = self.log.lock();
        let first = log.last_allocated + 1;
        let mut next = first;
        for writer in group.members() {
            writer.assign_sequence(next);
            next += writer.count();
        }
        let last = next - 1;

        let appended = match group.merged_batch(first) {
            Some(merged) if !group.disable_wal() => {
                if group.need_sync() {
                    log.wal.add_record_sync(merged.as_bytes())
                } else {
                    log.wal.add_record(merged.as_bytes())
                }
            }
            _ => Ok(()),
        };

        match appended {
            Ok(()) => {
                log.last_allocated = last;
                Ok(first)
            }
            Err(e) if e.is_fatal() => {
                log.last_allocated = last;
                drop(log);
                self.errors.set(e.clone());
                self.visibility.publish(first, last);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn apply_group(&self, group: &WriteGroup) -> Result<()> {
        let memtable = self.state.active();
        if self.config.allow_concurrent_memtable_write && group.len() > 1 {
            let job = Arc::new(ParallelInsert::new(memtable, group.len()));
            for follower in group.followers() {
                follower.assign_parallel(job.clone());
            }
            let leader = group.leader();
            job.finish(match leader.batch() {
                Some(batch) => job.memtable().insert(leader.sequence(), batch),
                None => Ok(()),
            });
            return job.wait();
        }

        for writer in group.members() {
            if let Some(batch) = writer.batch() {
                memtable.insert(writer.sequence(), batch)?;
            }
        }
        Ok(())
    }

    fn insert_parallel(&self, writer: &Writer) {
        let Some(job) = writer.parallel_job() else {
            return;
        };
        let result = match writer.batch() {
            Some(batch) => job.memtable().insert(writer.sequence(), batch),
            None => Ok(()),
        };
        job.finish(result);
    }

    /// Takes a barrier on every lane, then drains the memtable stage.
    ///
    /// With `yield_if_locked` the attempt is abandoned, and `None` returned,
    /// as soon as a lane turns out to be locked by `lock_wal`.
    pub(crate) fn enter_exclusive(&self, yield_if_locked: bool) -> Option<ExclusiveGuard<'_>> {
        let mut guard = ExclusiveGuard {
            held: Vec::with_capacity(self.lanes.len()),
        };
        for lane in &self.lanes {
            let barrier = Arc::new(if yield_if_locked {
                Writer::opportunistic_barrier()
            } else {
                Writer::barrier()
            });
            match lane.join(&barrier) {
                WriterState::GroupLeader => guard.held.push((lane, barrier)),
                _ => return None,
            }
        }
        if let Some(stage) = &self.stage {
            stage.wait_idle();
        }
        Some(guard)
    }
}
