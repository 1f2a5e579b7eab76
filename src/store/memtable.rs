//! Memtable on a concurrent skip list.
//!
//! Entries are keyed by [`InternalKey`]: user key ascending, then sequence
//! descending, so the newest visible version of a key is the first entry at or
//! after `(key, snapshot)`. Deletes are stored as `None` tombstones.
//!
//! `crossbeam-skiplist::SkipMap` allows inserts from several threads at once,
//! which is what parallel memtable writers rely on: group members insert their
//! own batches into the same table without further locking.
//!
//! A memtable remembers the first log number whose records it contains. Once it
//! is flushed, logs below the smallest such number among the remaining
//! memtables can be deleted.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::batch::{BatchOp, SequenceNumber, WriteBatch};
use crate::error::Result;
use crate::Error;

/// Per-entry bookkeeping charged on top of key and value bytes.
const ENTRY_OVERHEAD: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub sequence: SequenceNumber,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Vec<u8>>, sequence: SequenceNumber) -> Self {
        Self {
            user_key: user_key.into(),
            sequence,
        }
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// One versioned entry; `None` is a tombstone.
pub type Entry = (InternalKey, Option<Vec<u8>>);

#[derive(Debug)]
pub struct Memtable {
    id: u64,
    first_log: u64,
    data: SkipMap<InternalKey, Option<Vec<u8>>>,
    size: AtomicUsize,
    max_sequence: AtomicU64,
    frozen: AtomicBool,
}

impl Memtable {
    pub fn new(id: u64, first_log: u64) -> Self {
        Self {
            id,
            first_log,
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
            max_sequence: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn first_log(&self) -> u64 {
        self.first_log
    }

    /// Inserts every op of `batch`, op `i` at `first_seq + i`.
    pub fn insert(&self, first_seq: SequenceNumber, batch: &WriteBatch) -> Result<()> {
        if self.is_frozen() {
            return Err(Error::InvalidState(format!(
                "memtable {} is frozen",
                self.id
            )));
        }
        // Decode everything first so a bad op leaves the memtable untouched.
        let ops = batch.iter().collect::<Result<Vec<_>>>()?;
        for (offset, op) in ops.into_iter().enumerate() {
            let seq = first_seq + offset as u64;
            match op {
                BatchOp::Put { key, value } => self.add(seq, key, Some(value)),
                BatchOp::Delete { key } => self.add(seq, key, None),
            }
        }
        Ok(())
    }

    pub fn add(&self, seq: SequenceNumber, key: &[u8], value: Option<&[u8]>) {
        let entry_size = key.len() + value.map_or(0, |v| v.len()) + ENTRY_OVERHEAD;
        self.data
            .insert(InternalKey::new(key, seq), value.map(|v| v.to_vec()));
        self.size.fetch_add(entry_size, Ordering::SeqCst);
        self.max_sequence.fetch_max(seq, Ordering::SeqCst);
    }

    /// Looks up the newest version of `key` at or below `snapshot`.
    ///
    /// `Some(None)` means the key was deleted; `None` means this memtable has
    /// no version of it.
    pub fn get(&self, key: &[u8], snapshot: SequenceNumber) -> Option<Option<Vec<u8>>> {
        let bound = InternalKey::new(key, snapshot);
        let entry = self.data.range(bound..).next()?;
        if entry.key().user_key.as_slice() == key {
            Some(entry.value().clone())
        } else {
            None
        }
    }

    /// Every entry in internal key order.
    pub fn entries(&self) -> Vec<Entry> {
        self.data
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn max_sequence(&self) -> SequenceNumber {
        self.max_sequence.load(Ordering::SeqCst)
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_versions_and_snapshots() {
        let mem = Memtable::new(1, 1);
        mem.add(1, b"k", Some(b"v1"));
        mem.add(5, b"k", Some(b"v5"));
        mem.add(9, b"k", None);

        assert_eq!(mem.get(b"k", 0), None);
        assert_eq!(mem.get(b"k", 4), Some(Some(b"v1".to_vec())));
        assert_eq!(mem.get(b"k", 8), Some(Some(b"v5".to_vec())));
        assert_eq!(mem.get(b"k", 9), Some(None));
        assert_eq!(mem.get(b"other", 100), None);
        assert_eq!(mem.max_sequence(), 9);
    }

    #[test]
    fn test_malformed_batch_inserts_nothing() {
        let mem = Memtable::new(1, 1);
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1").put(b"b", b"2");
        let mut bytes = batch.as_bytes().to_vec();
        bytes.truncate(bytes.len() - 1);

        let err = mem.insert(10, &WriteBatch::from_raw(bytes)).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)), "{:?}", err);
        assert!(mem.is_empty());
        assert_eq!(mem.get(b"a", 100), None);
        assert_eq!(mem.max_sequence(), 0);
    }

    #[test]
    fn test_insert_batch_assigns_sequences() {
        let mem = Memtable::new(1, 1);
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1").put(b"b", b"2").delete(b"a");
        mem.insert(10, &batch).unwrap();

        let keys: Vec<_> = mem
            .entries()
            .into_iter()
            .map(|(k, _)| (k.user_key, k.sequence))
            .collect();
        assert_eq!(
            keys,
            vec![(b"a".to_vec(), 12), (b"a".to_vec(), 10), (b"b".to_vec(), 11)]
        );
        assert_eq!(mem.get(b"a", u64::MAX), Some(None));
    }

    #[test]
    fn test_frozen_rejects_inserts() {
        let mem = Memtable::new(3, 1);
        mem.freeze();
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");
        assert!(matches!(mem.insert(1, &batch), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_concurrent_inserts() {
        let mem = Arc::new(Memtable::new(1, 1));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let mem = mem.clone();
                thread::spawn(move || {
                    for i in 0..100u64 {
                        let key = format!("t{}-{}", t, i);
                        mem.add(t * 1000 + i + 1, key.as_bytes(), Some(b"v"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mem.len(), 400);
        assert!(mem.size() >= 400 * ENTRY_OVERHEAD);
    }
}
