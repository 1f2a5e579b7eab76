//! The storage engine.
//!
//! Writers enter through [`Db::write`]. Each write joins a lane of the write
//! thread, where one leader per group appends a single merged record to the
//! log and inserts the group into the active memtable. Admission is gated by
//! the [`WriteController`](write::WriteController), whose stop and delay
//! tokens the stall evaluator hands out as immutable memtables and L0 tables
//! pile up. Background flushes and compactions drain that backlog.

pub mod compaction;
pub mod db;
pub(crate) mod error_handler;
pub mod flush;
pub mod manifest;
pub mod memtable;
pub mod metrics;
pub mod recovery;
pub mod state;
pub mod table;
pub mod wal;
pub mod write;


pub use db::Db;

use crate::batch::{SequenceNumber, WriteBatch};
use crate::error::Result;
use crate::options::WriteOptions;

pub trait Store: Send + Sync {
    /// Applies a batch atomically, returning the sequence of its last operation.
    fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> Result<SequenceNumber>;

    /// Retrieves the newest visible value for a key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Pushes buffered log writes to the OS. With `sync`, also fsyncs them.
    fn flush_wal(&self, sync: bool) -> Result<()>;

    /// Inserts or updates a single key with default options.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<SequenceNumber> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(&WriteOptions::default(), batch)
    }

    fn delete(&self, key: &[u8]) -> Result<SequenceNumber> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(&WriteOptions::default(), batch)
    }
}
