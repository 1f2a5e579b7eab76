use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::fs::{FileSystem, OsFileSystem};
use crate::store::write::stall::{DelayPolicy, HalvingDelayPolicy};
use crate::Error;

/// How the write pipeline is organized. Fixed at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// One lane; the group leader writes the log and the memtable.
    Sequential,
    /// One lane for the log, with memtable application handed to a FIFO stage.
    Pipelined,
    /// Several independent lanes whose appends serialize on the log mutex.
    ConcurrentWal,
}

impl WriteMode {
    pub const ALL: [WriteMode; 3] = [
        WriteMode::Sequential,
        WriteMode::Pipelined,
        WriteMode::ConcurrentWal,
    ];
}

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Initial capacity of the in-process log buffer (default: 64KB)
    pub wal_buffer_size: usize,

    /// Writes only buffer log records; the caller drives flush_wal (default: false)
    pub manual_wal_flush: bool,

    /// Pipeline organization (default: Sequential)
    pub write_mode: WriteMode,

    /// Number of lanes in ConcurrentWal mode (default: 2)
    pub concurrent_wal_lanes: usize,

    /// Followers insert their own batches into the memtable (default: true)
    pub allow_concurrent_memtable_write: bool,

    /// Byte cap for a merged write group (default: 1MB)
    pub max_write_group_bytes: usize,

    /// Writer cap for a write group (default: 64)
    pub max_write_group_size: usize,

    /// Groups allowed to wait for the memtable stage in Pipelined mode (default: 4)
    pub max_pending_memtable_groups: usize,

    /// Base rate for delayed writes in bytes/sec (default: 16MB/s)
    pub delayed_write_rate: u64,

    /// Floor for the delayed write rate in bytes/sec (default: 16KB/s)
    pub min_delayed_write_rate: u64,

    /// Concurrent flush jobs (default: 1)
    pub max_background_flushes: usize,

    /// Concurrent compaction jobs (default: 1)
    pub max_background_compactions: usize,

    /// How often to log engine metrics; zero disables the task (default: 30s)
    pub metrics_interval: Duration,

    /// File system used for logs, tables and the manifest
    pub fs: Arc<dyn FileSystem>,

    /// Maps stall pressure to a delayed write rate
    pub delay_policy: Arc<dyn DelayPolicy>,

    /// Initial mutable options
    pub cf_options: ColumnFamilyOptions,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            wal_buffer_size: 64 * 1024, // 64KB
            manual_wal_flush: false,
            write_mode: WriteMode::Sequential,
            concurrent_wal_lanes: 2,
            allow_concurrent_memtable_write: true,
            max_write_group_bytes: 1024 * 1024, // 1MB
            max_write_group_size: 64,
            max_pending_memtable_groups: 4,
            delayed_write_rate: 16 * 1024 * 1024,
            min_delayed_write_rate: 16 * 1024,
            max_background_flushes: 1,
            max_background_compactions: 1,
            metrics_interval: Duration::from_secs(30),
            fs: Arc::new(OsFileSystem),
            delay_policy: Arc::new(HalvingDelayPolicy),
            cf_options: ColumnFamilyOptions::default(),
        }
    }
}

impl DbConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn wal_buffer_size(mut self, size: usize) -> Self {
        self.wal_buffer_size = size;
        self
    }

    pub fn manual_wal_flush(mut self, enabled: bool) -> Self {
        self.manual_wal_flush = enabled;
        self
    }

    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn concurrent_wal_lanes(mut self, lanes: usize) -> Self {
        self.concurrent_wal_lanes = lanes;
        self
    }

    pub fn allow_concurrent_memtable_write(mut self, enabled: bool) -> Self {
        self.allow_concurrent_memtable_write = enabled;
        self
    }

    pub fn max_write_group_bytes(mut self, bytes: usize) -> Self {
        self.max_write_group_bytes = bytes;
        self
    }

    pub fn max_write_group_size(mut self, writers: usize) -> Self {
        self.max_write_group_size = writers;
        self
    }

    pub fn max_pending_memtable_groups(mut self, groups: usize) -> Self {
        self.max_pending_memtable_groups = groups;
        self
    }

    pub fn delayed_write_rate(mut self, rate: u64) -> Self {
        self.delayed_write_rate = rate;
        self
    }

    pub fn min_delayed_write_rate(mut self, rate: u64) -> Self {
        self.min_delayed_write_rate = rate;
        self
    }

    pub fn max_background_flushes(mut self, jobs: usize) -> Self {
        self.max_background_flushes = jobs;
        self
    }

    pub fn max_background_compactions(mut self, jobs: usize) -> Self {
        self.max_background_compactions = jobs;
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Route all file I/O through `fs`
    pub fn fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn delay_policy(mut self, policy: Arc<dyn DelayPolicy>) -> Self {
        self.delay_policy = policy;
        self
    }

    pub fn cf_options(mut self, options: ColumnFamilyOptions) -> Self {
        self.cf_options = options;
        self
    }

    /// Number of write lanes implied by the write mode.
    pub fn lane_count(&self) -> usize {
        match self.write_mode {
            WriteMode::ConcurrentWal => self.concurrent_wal_lanes.max(1),
            WriteMode::Sequential | WriteMode::Pipelined => 1,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_write_group_size == 0 {
            return Err(Error::InvalidArgument(
                "max_write_group_size must be at least 1".to_string(),
            ));
        }
        if self.max_pending_memtable_groups == 0 {
            return Err(Error::InvalidArgument(
                "max_pending_memtable_groups must be at least 1".to_string(),
            ));
        }
        if self.delayed_write_rate == 0 || self.min_delayed_write_rate == 0 {
            return Err(Error::InvalidArgument(
                "delayed write rates must be positive".to_string(),
            ));
        }
        if self.min_delayed_write_rate > self.delayed_write_rate {
            return Err(Error::InvalidArgument(
                "min_delayed_write_rate exceeds delayed_write_rate".to_string(),
            ));
        }
        self.cf_options.validate()
    }
}

/// Options that may change while the engine runs.
///
/// The engine keeps the current value behind an atomically swappable pointer.
/// Background jobs hold the snapshot they started with; stall decisions always
/// read the live one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFamilyOptions {
    /// Active memtable size that triggers a switch (default: 64MB)
    pub write_buffer_size: usize,

    /// Unflushed memtables (immutable ones included) that stop writes (default: 2)
    pub max_write_buffer_number: usize,

    /// L0 tables that trigger a compaction (default: 4)
    pub level0_file_num_compaction_trigger: usize,

    /// L0 tables that delay writes (default: 20)
    pub level0_slowdown_writes_trigger: usize,

    /// L0 tables that stop writes (default: 36)
    pub level0_stop_writes_trigger: usize,

    /// Ignore backlog when admitting writes (default: false)
    pub disable_write_stall: bool,

    /// Never schedule compactions on their own (default: false)
    pub disable_auto_compactions: bool,

    /// Never switch memtables on size alone (default: false)
    pub disable_auto_flush: bool,
}

impl Default for ColumnFamilyOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: 64 * 1024 * 1024, // 64MB
            max_write_buffer_number: 2,
            level0_file_num_compaction_trigger: 4,
            level0_slowdown_writes_trigger: 20,
            level0_stop_writes_trigger: 36,
            disable_write_stall: false,
            disable_auto_compactions: false,
            disable_auto_flush: false,
        }
    }
}

impl ColumnFamilyOptions {
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn max_write_buffer_number(mut self, count: usize) -> Self {
        self.max_write_buffer_number = count;
        self
    }

    pub fn level0_file_num_compaction_trigger(mut self, count: usize) -> Self {
        self.level0_file_num_compaction_trigger = count;
        self
    }

    pub fn level0_slowdown_writes_trigger(mut self, count: usize) -> Self {
        self.level0_slowdown_writes_trigger = count;
        self
    }

    pub fn level0_stop_writes_trigger(mut self, count: usize) -> Self {
        self.level0_stop_writes_trigger = count;
        self
    }

    pub fn disable_write_stall(mut self, disabled: bool) -> Self {
        self.disable_write_stall = disabled;
        self
    }

    pub fn disable_auto_compactions(mut self, disabled: bool) -> Self {
        self.disable_auto_compactions = disabled;
        self
    }

    pub fn disable_auto_flush(mut self, disabled: bool) -> Self {
        self.disable_auto_flush = disabled;
        self
    }

    /// Returns a copy with every `(name, value)` pair applied.
    ///
    /// Names match the field names. Booleans accept `true`/`false`/`1`/`0`.
    /// Any unknown name or unparsable value fails the whole call.
    pub fn apply(&self, changes: &[(&str, &str)]) -> Result<Self> {
        let mut updated = self.clone();
        for &(name, value) in changes {
            match name {
                "write_buffer_size" => updated.write_buffer_size = parse_usize(name, value)?,
                "max_write_buffer_number" => {
                    updated.max_write_buffer_number = parse_usize(name, value)?
                }
                "level0_file_num_compaction_trigger" => {
                    updated.level0_file_num_compaction_trigger = parse_usize(name, value)?
                }
                "level0_slowdown_writes_trigger" => {
                    updated.level0_slowdown_writes_trigger = parse_usize(name, value)?
                }
                "level0_stop_writes_trigger" => {
                    updated.level0_stop_writes_trigger = parse_usize(name, value)?
                }
                "disable_write_stall" => updated.disable_write_stall = parse_bool(name, value)?,
                "disable_auto_compactions" => {
                    updated.disable_auto_compactions = parse_bool(name, value)?
                }
                "disable_auto_flush" => updated.disable_auto_flush = parse_bool(name, value)?,
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "unknown option: {}",
                        name
                    )))
                }
            }
        }
        updated.validate()?;
        Ok(updated)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.write_buffer_size == 0 {
            return Err(Error::InvalidArgument(
                "write_buffer_size must be positive".to_string(),
            ));
        }
        if self.max_write_buffer_number < 1 {
            return Err(Error::InvalidArgument(
                "max_write_buffer_number must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_usize(name: &str, value: &str) -> Result<usize> {
    value.trim().parse::<usize>().map_err(|_| {
        Error::InvalidArgument(format!("invalid value for {}: {:?}", name, value))
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(Error::InvalidArgument(format!(
            "invalid value for {}: {:?}",
            name, value
        ))),
    }
}
