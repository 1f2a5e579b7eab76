//! Group commit coordination for one write lane.
//!
//! Writers arrive on their own threads and join the lane. The first writer to
//! find no active leader becomes the group leader; later arrivals queue and
//! park. The leader drains compatible queued writers into a [`WriteGroup`],
//! performs the group's work, completes every member and hands leadership to
//! the next queued writer.
//!
//! Each writer moves through [`WriterState`] in one direction only:
//!
//! ```text
//! Init ─┬─> LockedWaiting ─> Waiting ─┬─> GroupLeader ─> MemtableWriterLeader ─┐
//!       ├────────────────────────────>┤                                        ├─> Completed
//!       └─> GroupLeader               └─> ParallelMemtableWriter ──────────────┘
//! ```
//!
//! Writers park on their own condvar, so promotion and completion wake exactly
//! the writer concerned. The lane mutex only guards the queue and flags.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::batch::{SequenceNumber, WriteBatch};
use crate::error::Result;
use crate::options::WriteOptions;
use crate::store::memtable::Memtable;
use crate::Error;

/// Times a low-priority writer may be passed over for leadership.
pub const LOW_PRIORITY_MAX_SKIPS: u32 = 4;

/// Small leaders cap their group at their own size plus `max_bytes / 8`.
const SMALL_LEADER_DIVISOR: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriterState {
    Init,
    /// Arrived while the log was locked.
    LockedWaiting,
    Waiting,
    GroupLeader,
    /// Leader whose group has reached the head of the memtable stage.
    MemtableWriterLeader,
    /// Follower told to insert its own batch into the memtable.
    ParallelMemtableWriter,
    Completed,
}

#[derive(Debug)]
struct Slot {
    state: WriterState,
    sequence: SequenceNumber,
    status: Option<Error>,
    parallel: Option<Arc<ParallelInsert>>,
}

#[derive(Debug)]
pub struct Writer {
    batch: Option<WriteBatch>,
    opts: WriteOptions,
    yield_if_locked: bool,
    skips: AtomicU32,
    slot: Mutex<Slot>,
    cv: Condvar,
}

impl Writer {
    pub fn new(batch: WriteBatch, opts: WriteOptions) -> Self {
        Self::build(Some(batch), opts, false)
    }

    /// A payload-less writer that gives its holder exclusive use of the lane.
    pub fn barrier() -> Self {
        Self::build(None, WriteOptions::new().bypass_stall(true), false)
    }

    /// Like [`barrier`](Self::barrier), but completes with `Incomplete`
    /// instead of waiting when the lane is locked.
    pub fn opportunistic_barrier() -> Self {
        Self::build(None, WriteOptions::new().bypass_stall(true), true)
    }

    fn build(batch: Option<WriteBatch>, opts: WriteOptions, yield_if_locked: bool) -> Self {
        Self {
            batch,
            opts,
            yield_if_locked,
            skips: AtomicU32::new(0),
            slot: Mutex::new(Slot {
                state: WriterState::Init,
                sequence: 0,
                status: None,
                parallel: None,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn is_barrier(&self) -> bool {
        self.batch.is_none()
    }

    pub fn batch(&self) -> Option<&WriteBatch> {
        self.batch.as_ref()
    }

    pub fn options(&self) -> &WriteOptions {
        &self.opts
    }

    /// Number of operations, i.e. sequence numbers consumed.
    pub fn count(&self) -> u64 {
        self.batch.as_ref().map_or(0, |b| b.count() as u64)
    }

    pub fn byte_size(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.size())
    }

    pub fn state(&self) -> WriterState {
        self.slot.lock().state
    }

    pub(crate) fn set_state(&self, state: WriterState) {
        let mut slot = self.slot.lock();
        debug_assert!(
            state >= slot.state,
            "writer state moved backwards: {:?} -> {:?}",
            slot.state,
            state
        );
        slot.state = state;
        self.cv.notify_all();
    }

    /// Parks until the state satisfies `ready` and returns it.
    pub fn wait_for<F>(&self, ready: F) -> WriterState
    where
        F: Fn(WriterState) -> bool,
    {
        let mut slot = self.slot.lock();
        while !ready(slot.state) {
            self.cv.wait(&mut slot);
        }
        slot.state
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.slot.lock().sequence
    }

    pub(crate) fn assign_sequence(&self, seq: SequenceNumber) {
        self.slot.lock().sequence = seq;
    }

    pub(crate) fn complete(&self, status: Result<()>) {
        let mut slot = self.slot.lock();
        slot.status = status.err();
        slot.state = WriterState::Completed;
        self.cv.notify_all();
    }

    /// The final status; meaningful once `Completed`.
    pub fn status(&self) -> Result<()> {
        match &self.slot.lock().status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn assign_parallel(&self, job: Arc<ParallelInsert>) {
        let mut slot = self.slot.lock();
        slot.parallel = Some(job);
        slot.state = WriterState::ParallelMemtableWriter;
        self.cv.notify_all();
    }

    pub(crate) fn parallel_job(&self) -> Option<Arc<ParallelInsert>> {
        self.slot.lock().parallel.clone()
    }
}

/// Countdown shared by the members of a group inserting in parallel.
#[derive(Debug)]
pub struct ParallelInsert {
    memtable: Arc<Memtable>,
    remaining: Mutex<usize>,
    done: Condvar,
    failure: Mutex<Option<Error>>,
}

impl ParallelInsert {
    pub fn new(memtable: Arc<Memtable>, participants: usize) -> Self {
        Self {
            memtable,
            remaining: Mutex::new(participants),
            done: Condvar::new(),
            failure: Mutex::new(None),
        }
    }

    pub fn memtable(&self) -> &Arc<Memtable> {
        &self.memtable
    }

    pub fn finish(&self, result: Result<()>) {
        if let Err(e) = result {
            self.failure.lock().get_or_insert(e);
        }
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    /// Blocks until every participant has finished; returns the first failure.
    pub fn wait(&self) -> Result<()> {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.done.wait(&mut remaining);
        }
        drop(remaining);
        match self.failure.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A leader and the followers it drained, in admission order.
#[derive(Debug)]
pub struct WriteGroup {
    leader: Arc<Writer>,
    followers: Vec<Arc<Writer>>,
    byte_size: usize,
}

impl WriteGroup {
    fn new(leader: Arc<Writer>) -> Self {
        let byte_size = leader.byte_size();
        Self {
            leader,
            followers: Vec::new(),
            byte_size,
        }
    }

    fn push(&mut self, writer: Arc<Writer>) {
        self.byte_size += writer.byte_size();
        self.followers.push(writer);
    }

    pub fn leader(&self) -> &Arc<Writer> {
        &self.leader
    }

    pub fn followers(&self) -> &[Arc<Writer>] {
        &self.followers
    }

    pub fn members(&self) -> impl Iterator<Item = &Arc<Writer>> {
        std::iter::once(&self.leader).chain(self.followers.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.followers.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn total_count(&self) -> u64 {
        self.members().map(|w| w.count()).sum()
    }

    pub fn is_barrier(&self) -> bool {
        self.leader.is_barrier()
    }

    pub fn disable_wal(&self) -> bool {
        self.leader.options().disable_wal
    }

    pub fn need_sync(&self) -> bool {
        self.leader.options().sync
    }

    /// The log payload for the whole group, stamped with `first_seq`.
    pub fn merged_batch(&self, first_seq: SequenceNumber) -> Option<WriteBatch> {
        let mut merged = self.leader.batch()?.clone();
        for follower in &self.followers {
            if let Some(batch) = follower.batch() {
                merged.append(batch);
            }
        }
        merged.set_sequence(first_seq);
        Some(merged)
    }

    /// Completes followers, then the leader, with the same status.
    pub fn complete(&self, status: &Result<()>) {
        for follower in &self.followers {
            follower.complete(status.clone());
        }
        self.leader.complete(status.clone());
    }
}

#[derive(Debug, Default)]
struct LaneQueue {
    pending: VecDeque<Arc<Writer>>,
    locked_waiters: VecDeque<Arc<Writer>>,
    leader_active: bool,
    locked: bool,
    stalled: bool,
}

/// One group-commit lane.
#[derive(Debug)]
pub struct WriteThread {
    id: usize,
    queue: Mutex<LaneQueue>,
    groups_led: AtomicU64,
    last_group_bytes: AtomicUsize,
}

impl WriteThread {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            queue: Mutex::new(LaneQueue::default()),
            groups_led: AtomicU64::new(0),
            last_group_bytes: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Enters `writer` into the lane and parks it until it has a role.
    ///
    /// Returns `GroupLeader`, `ParallelMemtableWriter` or `Completed`.
    pub fn join(&self, writer: &Arc<Writer>) -> WriterState {
        {
            let mut q = self.queue.lock();
            if q.stalled && writer.options().no_slowdown && !writer.is_barrier() {
                drop(q);
                writer.complete(Err(Error::Incomplete("write stall".to_string())));
                return WriterState::Completed;
            }
            if q.locked {
                if writer.yield_if_locked {
                    drop(q);
                    writer.complete(Err(Error::Incomplete("log is locked".to_string())));
                    return WriterState::Completed;
                }
                writer.set_state(WriterState::LockedWaiting);
                q.locked_waiters.push_back(writer.clone());
            } else if !q.leader_active {
                q.leader_active = true;
                writer.set_state(WriterState::GroupLeader);
                return WriterState::GroupLeader;
            } else {
                writer.set_state(WriterState::Waiting);
                q.pending.push_back(writer.clone());
            }
        }
        writer.wait_for(|s| s >= WriterState::GroupLeader)
    }

    /// Drains compatible queued writers behind `leader`.
    pub fn build_group(
        &self,
        leader: &Arc<Writer>,
        max_bytes: usize,
        max_writers: usize,
    ) -> WriteGroup {
        let mut group = WriteGroup::new(leader.clone());
        if leader.is_barrier() {
            return group;
        }

        let leader_size = leader.byte_size();
        let max_size = if leader_size <= max_bytes / SMALL_LEADER_DIVISOR {
            leader_size + max_bytes / SMALL_LEADER_DIVISOR
        } else {
            max_bytes
        };

        {
            let mut q = self.queue.lock();
            while group.len() < max_writers {
                let Some(next) = q.pending.front() else {
                    break;
                };
                if !compatible(leader, next) || group.byte_size() + next.byte_size() > max_size {
                    break;
                }
                if let Some(next) = q.pending.pop_front() {
                    group.push(next);
                }
            }
        }

        self.groups_led.fetch_add(1, Ordering::Relaxed);
        self.last_group_bytes
            .store(group.byte_size(), Ordering::Relaxed);
        tracing::debug!(
            lane = self.id,
            writers = group.len(),
            bytes = group.byte_size(),
            "Formed write group"
        );
        group
    }

    /// Gives up leadership, promoting the next queued writer if allowed.
    pub fn hand_off(&self) {
        let mut q = self.queue.lock();
        if q.locked {
            q.leader_active = false;
            return;
        }
        Self::promote_next(&mut q);
    }

    fn promote_next(q: &mut LaneQueue) {
        let idx = pick_next(&q.pending);
        match q.pending.remove(idx) {
            Some(next) => {
                q.leader_active = true;
                next.set_state(WriterState::GroupLeader);
            }
            None => q.leader_active = false,
        }
    }

    /// Marks the lane stalled and pulls out queued `no_slowdown` writers,
    /// which the caller must complete.
    pub fn begin_stall(&self) -> Vec<Arc<Writer>> {
        let mut q = self.queue.lock();
        q.stalled = true;
        let (failed, kept): (Vec<_>, Vec<_>) = q
            .pending
            .drain(..)
            .partition(|w| w.options().no_slowdown && !w.is_barrier());
        q.pending = kept.into();
        failed
    }

    pub fn end_stall(&self) {
        self.queue.lock().stalled = false;
    }

    /// Holds new arrivals in `LockedWaiting` until [`unlock`](Self::unlock).
    /// Called by the holder of a barrier on this lane.
    pub fn lock(&self) {
        self.queue.lock().locked = true;
    }

    /// Re-admits writers that arrived during the lock, in arrival order.
    pub fn unlock(&self) {
        let mut q = self.queue.lock();
        q.locked = false;
        while let Some(writer) = q.locked_waiters.pop_front() {
            writer.set_state(WriterState::Waiting);
            q.pending.push_back(writer);
        }
        if !q.leader_active {
            Self::promote_next(&mut q);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.queue.lock().locked
    }

    pub fn is_stalled(&self) -> bool {
        self.queue.lock().stalled
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().pending.len()
    }

    pub fn locked_waiter_count(&self) -> usize {
        self.queue.lock().locked_waiters.len()
    }

    /// Write groups formed on this lane. Barriers are not counted.
    pub fn groups_led(&self) -> u64 {
        self.groups_led.load(Ordering::Relaxed)
    }

    pub fn last_group_bytes(&self) -> usize {
        self.last_group_bytes.load(Ordering::Relaxed)
    }
}

fn compatible(leader: &Writer, next: &Writer) -> bool {
    let (lo, no) = (leader.options(), next.options());
    !next.is_barrier()
        && lo.disable_wal == no.disable_wal
        && lo.no_slowdown == no.no_slowdown
        && lo.bypass_stall == no.bypass_stall
        && (lo.sync || !no.sync)
}

/// Index of the writer to promote: the oldest normal-priority writer, unless a
/// low-priority writer ahead of it has been skipped too often.
fn pick_next(pending: &VecDeque<Arc<Writer>>) -> usize {
    let idx = pending
        .iter()
        .position(|w| {
            !w.options().low_priority || w.skips.load(Ordering::Relaxed) >= LOW_PRIORITY_MAX_SKIPS
        })
        .unwrap_or(0);
    for skipped in pending.iter().take(idx) {
        skipped.skips.fetch_add(1, Ordering::Relaxed);
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn writer(opts: WriteOptions, key: &[u8]) -> Arc<Writer> {
        let mut batch = WriteBatch::new();
        batch.put(key, b"value");
        Arc::new(Writer::new(batch, opts))
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Queues `writer` on a helper thread and waits until it is parked.
    fn enqueue(lane: &Arc<WriteThread>, writer: &Arc<Writer>) -> thread::JoinHandle<WriterState> {
        let before = lane.pending_len() + lane.locked_waiter_count();
        let handle = {
            let lane = lane.clone();
            let writer = writer.clone();
            thread::spawn(move || lane.join(&writer))
        };
        wait_until(|| lane.pending_len() + lane.locked_waiter_count() > before);
        handle
    }

    #[test]
    fn test_first_writer_leads() {
        let lane = WriteThread::new(0);
        let w = writer(WriteOptions::new(), b"a");
        assert_eq!(lane.join(&w), WriterState::GroupLeader);
        assert_eq!(w.state(), WriterState::GroupLeader);

        let group = lane.build_group(&w, 1 << 20, 16);
        assert_eq!(group.len(), 1);
        group.complete(&Ok(()));
        lane.hand_off();
        assert_eq!(w.state(), WriterState::Completed);
        assert!(w.status().is_ok());
    }

    #[test]
    fn test_group_drains_compatible_followers_in_order() {
        let lane = Arc::new(WriteThread::new(0));
        let leader = writer(WriteOptions::new().sync(true), b"l");
        assert_eq!(lane.join(&leader), WriterState::GroupLeader);

        let f1 = writer(WriteOptions::new(), b"f1");
        let f2 = writer(WriteOptions::new().sync(true), b"f2");
        let odd = writer(WriteOptions::new().disable_wal(true), b"x");
        let after = writer(WriteOptions::new(), b"f3");
        let handles: Vec<_> = [&f1, &f2, &odd, &after]
            .iter()
            .map(|w| enqueue(&lane, w))
            .collect();

        let group = lane.build_group(&leader, 1 << 20, 16);
        let keys: Vec<_> = group
            .followers()
            .iter()
            .map(|w| w.batch().unwrap().iter().next().unwrap().unwrap().key().to_vec())
            .collect();
        assert_eq!(keys, vec![b"f1".to_vec(), b"f2".to_vec()]);
        assert_eq!(group.total_count(), 3);

        let merged = group.merged_batch(10).unwrap();
        assert_eq!(merged.sequence(), 10);
        assert_eq!(merged.count(), 3);

        group.complete(&Err(Error::Incomplete("shared".into())));
        lane.hand_off();
        assert!(f1.status().unwrap_err().is_incomplete());
        assert!(f2.status().unwrap_err().is_incomplete());

        // The incompatible writer leads the next group, alone.
        wait_until(|| odd.state() == WriterState::GroupLeader);
        let group = lane.build_group(&odd, 1 << 20, 16);
        assert_eq!(group.len(), 1);
        group.complete(&Ok(()));
        lane.hand_off();

        wait_until(|| after.state() == WriterState::GroupLeader);
        lane.build_group(&after, 1 << 20, 16).complete(&Ok(()));
        lane.hand_off();

        let states: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            states,
            vec![
                WriterState::Completed,
                WriterState::Completed,
                WriterState::GroupLeader,
                WriterState::GroupLeader
            ]
        );
    }

    #[test]
    fn test_non_sync_leader_excludes_sync_follower() {
        let lane = Arc::new(WriteThread::new(0));
        let leader = writer(WriteOptions::new(), b"l");
        lane.join(&leader);
        let sync = writer(WriteOptions::new().sync(true), b"s");
        let _h = enqueue(&lane, &sync);

        let group = lane.build_group(&leader, 1 << 20, 16);
        assert_eq!(group.len(), 1);
        group.complete(&Ok(()));
        lane.hand_off();
        wait_until(|| sync.state() == WriterState::GroupLeader);
        lane.build_group(&sync, 1 << 20, 16).complete(&Ok(()));
        lane.hand_off();
    }

    #[test]
    fn test_group_caps() {
        let lane = Arc::new(WriteThread::new(0));
        let leader = writer(WriteOptions::new(), b"l");
        lane.join(&leader);
        let followers: Vec<_> = (0..4)
            .map(|i| writer(WriteOptions::new(), format!("f{}", i).as_bytes()))
            .collect();
        let _handles: Vec<_> = followers.iter().map(|w| enqueue(&lane, w)).collect();

        assert_eq!(lane.build_group(&leader, 1 << 20, 3).len(), 3);
        assert_eq!(lane.pending_len(), 2);

        // A byte cap smaller than two batches keeps the next leader alone.
        for w in &followers[..2] {
            w.complete(Ok(()));
        }
        leader.complete(Ok(()));
        lane.hand_off();
        let next = &followers[2];
        wait_until(|| next.state() == WriterState::GroupLeader);
        let one_batch = next.byte_size();
        let group = lane.build_group(next, one_batch + 1, 16);
        assert_eq!(group.len(), 1);
        group.complete(&Ok(()));
        lane.hand_off();
        wait_until(|| followers[3].state() == WriterState::GroupLeader);
        lane.build_group(&followers[3], 1 << 20, 16).complete(&Ok(()));
        lane.hand_off();
    }

    #[test]
    fn test_barrier_is_never_merged() {
        let lane = Arc::new(WriteThread::new(0));
        let leader = writer(WriteOptions::new(), b"l");
        lane.join(&leader);
        let barrier = Arc::new(Writer::barrier());
        let _h = enqueue(&lane, &barrier);

        assert_eq!(lane.build_group(&leader, 1 << 20, 16).len(), 1);
        leader.complete(Ok(()));
        lane.hand_off();
        wait_until(|| barrier.state() == WriterState::GroupLeader);
        let group = lane.build_group(&barrier, 1 << 20, 16);
        assert!(group.is_barrier());
        assert_eq!(group.total_count(), 0);
        assert!(group.merged_batch(1).is_none());
    }

    #[test]
    fn test_low_priority_yields_until_max_skips() {
        let lane = Arc::new(WriteThread::new(0));
        let leader = writer(WriteOptions::new(), b"l");
        lane.join(&leader);

        let low = writer(WriteOptions::new().low_priority(true), b"low");
        let _hl = enqueue(&lane, &low);
        let mut normals = Vec::new();
        for i in 0..=LOW_PRIORITY_MAX_SKIPS {
            let w = writer(
                WriteOptions::new().disable_wal(true),
                format!("n{}", i).as_bytes(),
            );
            let h = enqueue(&lane, &w);
            normals.push((w, h));
        }

        // Each hand-off promotes the next normal writer past `low`.
        let mut current = leader.clone();
        for (w, _) in normals.iter().take(LOW_PRIORITY_MAX_SKIPS as usize) {
            current.complete(Ok(()));
            lane.hand_off();
            wait_until(|| w.state() == WriterState::GroupLeader);
            assert_eq!(low.state(), WriterState::Waiting);
            current = w.clone();
        }

        // Skipped often enough: `low` leads now despite a normal writer queued.
        current.complete(Ok(()));
        lane.hand_off();
        wait_until(|| low.state() == WriterState::GroupLeader);
        let last = &normals[LOW_PRIORITY_MAX_SKIPS as usize].0;
        assert_eq!(last.state(), WriterState::Waiting);

        low.complete(Ok(()));
        lane.hand_off();
        wait_until(|| last.state() == WriterState::GroupLeader);
        last.complete(Ok(()));
        lane.hand_off();
    }

    #[test]
    fn test_stall_fails_no_slowdown_writers() {
        let lane = Arc::new(WriteThread::new(0));
        let leader = writer(WriteOptions::new(), b"l");
        lane.join(&leader);

        let slow = writer(WriteOptions::new(), b"slow");
        let fast = writer(WriteOptions::new().no_slowdown(true), b"fast");
        let h_slow = enqueue(&lane, &slow);
        let h_fast = enqueue(&lane, &fast);

        let failed = lane.begin_stall();
        assert_eq!(failed.len(), 1);
        assert!(Arc::ptr_eq(&failed[0], &fast));
        for w in failed {
            w.complete(Err(Error::Incomplete("write stall".into())));
        }
        assert_eq!(h_fast.join().unwrap(), WriterState::Completed);

        // New no_slowdown arrivals fail without queueing.
        let late = writer(WriteOptions::new().no_slowdown(true), b"late");
        assert_eq!(lane.join(&late), WriterState::Completed);
        assert!(late.status().unwrap_err().is_incomplete());

        lane.end_stall();
        assert!(!lane.is_stalled());
        leader.complete(Ok(()));
        lane.hand_off();
        assert_eq!(h_slow.join().unwrap(), WriterState::GroupLeader);
    }

    #[test]
    fn test_lock_holds_arrivals_until_unlock() {
        let lane = Arc::new(WriteThread::new(0));
        let barrier = Arc::new(Writer::barrier());
        assert_eq!(lane.join(&barrier), WriterState::GroupLeader);
        lane.lock();
        barrier.complete(Ok(()));
        lane.hand_off();

        let a = writer(WriteOptions::new(), b"a");
        let b = writer(WriteOptions::new(), b"b");
        let ha = enqueue(&lane, &a);
        let hb = enqueue(&lane, &b);
        assert_eq!(a.state(), WriterState::LockedWaiting);
        assert_eq!(lane.locked_waiter_count(), 2);

        let opportunistic = Arc::new(Writer::opportunistic_barrier());
        assert_eq!(lane.join(&opportunistic), WriterState::Completed);

        lane.unlock();
        assert_eq!(ha.join().unwrap(), WriterState::GroupLeader);
        assert_eq!(b.state(), WriterState::Waiting);
        let group = lane.build_group(&a, 1 << 20, 16);
        assert_eq!(group.len(), 2);
        group.complete(&Ok(()));
        lane.hand_off();
        assert_eq!(hb.join().unwrap(), WriterState::Completed);
    }

    #[test]
    fn test_parallel_insert_countdown() {
        let mem = Arc::new(Memtable::new(1, 1));
        let job = Arc::new(ParallelInsert::new(mem, 3));
        let workers: Vec<_> = (0..2)
            .map(|i| {
                let job = job.clone();
                thread::spawn(move || {
                    if i == 1 {
                        job.finish(Err(Error::InvalidData("bad".into())));
                    } else {
                        job.finish(Ok(()));
                    }
                })
            })
            .collect();
        job.finish(Ok(()));
        for w in workers {
            w.join().unwrap();
        }
        assert!(matches!(job.wait(), Err(Error::InvalidData(_))));
    }
}
