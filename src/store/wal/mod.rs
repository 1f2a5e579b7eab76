//! Write-ahead log.
//!
//! Every admitted write group is appended here, as one record, before it reaches
//! the memtable. A record holds the group's merged [`WriteBatch`] stamped with
//! the group's first sequence number, so replay restores both data and
//! sequence.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|   magic, version, log number
//! +------------------+
//! | Record 1         |   len:u32 | batch | crc32:u32
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! # Lifecycle
//!
//! A new log is created on open and on every memtable switch. Older logs stay on
//! disk until every memtable that holds their data is flushed, then
//! [`Wal::retire`] deletes them.
//!
//! [`WriteBatch`]: crate::batch::WriteBatch

pub mod header;
pub mod record;
pub mod writer;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use header::{Header, HEADER_SIZE};
use record::{RecordReader, RECORD_OVERHEAD};
use writer::LogWriter;

use crate::error::Result;
use crate::fs::FileSystem;
use crate::Error;

#[derive(Debug, Clone, Copy)]
pub struct WalOptions {
    pub buffer_size: usize,
    pub manual_flush: bool,
}

/// The current log plus the older logs that still back unflushed memtables.
pub struct Wal {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    opts: WalOptions,
    current: LogWriter,
    older: VecDeque<u64>,
    bytes_written: u64,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("dir", &self.dir)
            .field("current", &self.current)
            .field("older", &self.older)
            .finish()
    }
}

pub fn log_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{}.wal", number))
}

/// Log numbers found in `dir`, ascending.
pub fn list_logs(fs: &dyn FileSystem, dir: &Path) -> Result<Vec<u64>> {
    let mut numbers: Vec<u64> = fs
        .list(dir)?
        .iter()
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("wal"))
        .filter_map(|p| p.file_stem()?.to_str()?.parse::<u64>().ok())
        .collect();
    numbers.sort_unstable();
    Ok(numbers)
}

/// Records recovered from one log file.
#[derive(Debug)]
pub struct LogReplay {
    pub number: u64,
    pub records: Vec<Vec<u8>>,
    /// Set when replay stopped at a torn or corrupt record.
    pub tail_error: Option<Error>,
}

pub fn replay(fs: &dyn FileSystem, path: &Path) -> Result<LogReplay> {
    let data = fs.read(path)?;
    let header = Header::decode(&data)?;

    let mut records = Vec::new();
    let mut tail_error = None;
    for record in RecordReader::new(&data[HEADER_SIZE..]) {
        match record {
            Ok(payload) => records.push(payload.to_vec()),
            Err(e) => tail_error = Some(e),
        }
    }

    Ok(LogReplay {
        number: header.log_number,
        records,
        tail_error,
    })
}

impl Wal {
    /// Starts a fresh log `number`; `older` lists recovered logs still needed.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        dir: PathBuf,
        number: u64,
        opts: WalOptions,
        older: Vec<u64>,
    ) -> Result<Self> {
        let current = LogWriter::create(
            fs.as_ref(),
            log_path(&dir, number),
            number,
            opts.buffer_size,
            opts.manual_flush,
        )?;
        Ok(Self {
            fs,
            dir,
            opts,
            current,
            older: older.into(),
            bytes_written: 0,
        })
    }

    pub fn current_number(&self) -> u64 {
        self.current.number()
    }

    pub fn current_path(&self) -> &Path {
        self.current.path()
    }

    /// Every log still on disk, oldest first.
    pub fn live_logs(&self) -> Vec<u64> {
        let mut logs: Vec<u64> = self.older.iter().copied().collect();
        logs.push(self.current.number());
        logs
    }

    pub fn buffer_is_empty(&self) -> bool {
        self.current.buffer_is_empty()
    }

    /// Total record bytes accepted since open, framing included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        self.current.add_record(payload)?;
        self.bytes_written += (payload.len() + RECORD_OVERHEAD) as u64;
        Ok(())
    }

    pub fn add_record_sync(&mut self, payload: &[u8]) -> Result<()> {
        self.current.add_record_sync(payload)?;
        self.bytes_written += (payload.len() + RECORD_OVERHEAD) as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.current.flush_buffer()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.current.sync()
    }

    pub fn recover(&mut self) -> Result<()> {
        self.current.recover()
    }

    /// Seals the current log and starts log `number`. Any failure is fatal.
    pub fn rotate(&mut self, number: u64) -> Result<u64> {
        self.current.sync().map_err(Error::into_fatal)?;
        let next = LogWriter::create(
            self.fs.as_ref(),
            log_path(&self.dir, number),
            number,
            self.opts.buffer_size,
            self.opts.manual_flush,
        )?;
        let sealed = std::mem::replace(&mut self.current, next);
        self.older.push_back(sealed.number());
        Ok(sealed.number())
    }

    /// Deletes sealed logs numbered below `min_live`.
    pub fn retire(&mut self, min_live: u64) -> Vec<u64> {
        let mut retired = Vec::new();
        while let Some(&number) = self.older.front() {
            if number >= min_live {
                break;
            }
            self.older.pop_front();
            match self.fs.remove(&log_path(&self.dir, number)) {
                Ok(()) => tracing::info!(log = number, "Deleted log file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(log = number, error = %e, "Failed to delete log file"),
            }
            retired.push(number);
        }
        retired
    }
}
