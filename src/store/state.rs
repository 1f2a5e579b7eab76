use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::manifest::Manifest;
use super::memtable::Memtable;
use super::metrics::StateMetrics;
use super::table::Table;
use super::write::Backlog;

/// L0 holds flushed memtables, L1 the output of compaction.
pub const NUM_LEVELS: usize = 2;

#[derive(Debug)]
pub struct Memtables {
    pub active: Arc<Memtable>,
    /// Oldest first.
    pub immutables: VecDeque<Arc<Memtable>>,
}

/// All mutable state for the engine, each part behind its own lock.
#[derive(Debug)]
pub struct DbState {
    pub memtables: RwLock<Memtables>,
    /// Per level, newest table last.
    pub levels: RwLock<Vec<Vec<Arc<Table>>>>,
    pub manifest: Mutex<Manifest>,
    pub next_file_number: AtomicU64,

    pub flush_running: AtomicBool,
    pub compaction_running: Arc<AtomicBool>,
}

impl DbState {
    pub fn new(
        active: Memtable,
        levels: Vec<Vec<Arc<Table>>>,
        manifest: Manifest,
        next_file_number: u64,
    ) -> Self {
        Self {
            memtables: RwLock::new(Memtables {
                active: Arc::new(active),
                immutables: VecDeque::new(),
            }),
            levels: RwLock::new(levels),
            manifest: Mutex::new(manifest),
            next_file_number: AtomicU64::new(next_file_number),
            flush_running: AtomicBool::new(false),
            compaction_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Allocates a number for a log or table file.
    pub fn next_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    pub fn active(&self) -> Arc<Memtable> {
        self.memtables.read().active.clone()
    }

    pub fn active_size(&self) -> usize {
        self.memtables.read().active.size()
    }

    /// Freezes the active memtable behind `next` and returns it.
    pub fn install_memtable(&self, next: Memtable) -> Arc<Memtable> {
        let mut memtables = self.memtables.write();
        let old = std::mem::replace(&mut memtables.active, Arc::new(next));
        old.freeze();
        memtables.immutables.push_back(old.clone());
        old
    }

    pub fn oldest_immutable(&self) -> Option<Arc<Memtable>> {
        self.memtables.read().immutables.front().cloned()
    }

    pub fn newest_immutable_id(&self) -> Option<u64> {
        self.memtables.read().immutables.back().map(|m| m.id())
    }

    /// Whether a memtable with id `<= id` still awaits flush.
    pub fn has_unflushed_through(&self, id: u64) -> bool {
        self.memtables
            .read()
            .immutables
            .front()
            .is_some_and(|m| m.id() <= id)
    }

    /// Smallest log number still backing a memtable other than `id`.
    pub fn min_log_without(&self, id: u64) -> u64 {
        let memtables = self.memtables.read();
        memtables
            .immutables
            .iter()
            .filter(|m| m.id() != id)
            .map(|m| m.first_log())
            .chain(std::iter::once(memtables.active.first_log()))
            .min()
            .unwrap_or_default()
    }

    pub fn remove_immutable(&self, id: u64) {
        self.memtables.write().immutables.retain(|m| m.id() != id);
    }

    pub fn immutable_count(&self) -> usize {
        self.memtables.read().immutables.len()
    }

    pub fn level0_count(&self) -> usize {
        self.levels.read().first().map_or(0, Vec::len)
    }

    pub fn backlog(&self) -> Backlog {
        Backlog {
            immutable_memtables: self.immutable_count(),
            level0_tables: self.level0_count(),
        }
    }

    /// Try to start the flush job (returns guard if successful)
    pub fn try_start_flush(&self) -> Option<FlushGuard<'_>> {
        if self.flush_running.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(FlushGuard { state: self })
    }

    /// Claims the compaction slot; the returned flag is released by its holder.
    pub fn try_start_compaction(&self) -> Option<Arc<AtomicBool>> {
        if self.compaction_running.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(self.compaction_running.clone())
    }

    pub fn metrics(&self) -> StateMetrics {
        let (active_memtable_size, immutable_memtables) = {
            let memtables = self.memtables.read();
            (memtables.active.size(), memtables.immutables.len())
        };
        let level_counts = self.levels.read().iter().map(Vec::len).collect();
        StateMetrics {
            active_memtable_size,
            immutable_memtables,
            level_counts,
            flush_running: self.flush_running.load(Ordering::SeqCst),
            compaction_running: self.compaction_running.load(Ordering::SeqCst),
            next_file_number: self.next_file_number.load(Ordering::SeqCst),
        }
    }
}

/// RAII guard for the flush job
pub struct FlushGuard<'a> {
    state: &'a DbState,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.state.flush_running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FileSystem, OsFileSystem};
    use crate::tmpfs::TempDir;

    fn state(dir: &TempDir) -> DbState {
        let fs: Arc<dyn FileSystem> = Arc::new(OsFileSystem);
        let (manifest, _) = Manifest::open(&fs, dir.path()).unwrap();
        DbState::new(
            Memtable::new(3, 1),
            vec![Vec::new(); NUM_LEVELS],
            manifest,
            4,
        )
    }

    #[test]
    fn test_install_and_remove_immutables() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        state.active().add(1, b"k", Some(b"v"));

        let frozen = state.install_memtable(Memtable::new(4, 4));
        assert!(frozen.is_frozen());
        assert_eq!(frozen.id(), 3);
        state.install_memtable(Memtable::new(5, 5));
        assert_eq!(state.backlog().immutable_memtables, 2);
        assert_eq!(state.newest_immutable_id(), Some(4));
        assert!(state.has_unflushed_through(3));

        // Log 1 backs memtable 3; without it, log 4 is the oldest needed.
        assert_eq!(state.min_log_without(3), 4);
        state.remove_immutable(3);
        assert!(!state.has_unflushed_through(3));
        assert_eq!(state.min_log_without(4), 5);
        state.remove_immutable(4);
        assert_eq!(state.immutable_count(), 0);
    }

    #[test]
    fn test_single_flush_and_compaction_slots() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);

        let guard = state.try_start_flush().unwrap();
        assert!(state.try_start_flush().is_none());
        drop(guard);
        assert!(state.try_start_flush().is_some());

        let running = state.try_start_compaction().unwrap();
        assert!(state.try_start_compaction().is_none());
        running.store(false, Ordering::SeqCst);
        assert!(state.metrics().level_counts == vec![0, 0]);
        assert!(state.try_start_compaction().is_some());
    }

    #[test]
    fn test_file_numbers_are_unique() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        assert_eq!(state.next_file_number(), 4);
        assert_eq!(state.next_file_number(), 5);
    }
}
