pub mod batch;
pub mod config;
pub mod error;
pub mod flock;
pub mod fs;
pub mod options;
pub mod scheduler;
pub mod store;
#[cfg(test)]
pub(crate) mod tmpfs;

pub use batch::{SequenceNumber, WriteBatch};
pub use config::{ColumnFamilyOptions, DbConfig, WriteMode};
pub use error::{Error, Result};
pub use options::{FlushOptions, WriteOptions};
pub use store::compaction::CompactionJob;
pub use store::write::StallCondition;
pub use store::{Db, Store};
