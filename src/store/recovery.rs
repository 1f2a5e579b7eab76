//! Rebuilds engine state from the directory on open.
//!
//! Order matters: the manifest names the live tables and the oldest log that
//! may still hold unflushed data; those logs are replayed into a fresh
//! memtable, and only then is a new log started for incoming writes.

use std::path::Path;
use std::sync::Arc;

use crate::{
    batch::{SequenceNumber, WriteBatch},
    config::DbConfig,
    error::Result,
    flock::{FileLock, LOCK_FILE},
    store::{
        manifest::Manifest,
        memtable::Memtable,
        state::{DbState, NUM_LEVELS},
        table::{table_path, Table},
        wal::{self, Wal, WalOptions},
    },
    Error,
};

pub(crate) const WAL_DIR: &str = "wal";
pub(crate) const SST_DIR: &str = "sst";

pub(crate) struct Recovered {
    pub state: DbState,
    pub wal: Wal,
    pub last_sequence: SequenceNumber,
    pub lock: FileLock,
}

pub(crate) fn recover(config: &DbConfig) -> Result<Recovered> {
    let fs = config.fs.clone();
    let wal_dir = config.dir.join(WAL_DIR);
    let sst_dir = config.dir.join(SST_DIR);
    fs.create_dir_all(&config.dir)?;
    fs.create_dir_all(&wal_dir)?;
    fs.create_dir_all(&sst_dir)?;

    let lock =
        FileLock::lock(config.dir.join(LOCK_FILE)).map_err(|e| Error::LockError(Arc::new(e)))?;

    let (manifest, manifest_state) = Manifest::open(&fs, &config.dir)?;

    let mut levels = vec![Vec::new(); NUM_LEVELS];
    let mut max_file = 0;
    for meta in manifest_state.tables.values() {
        let level = meta.level as usize;
        if level >= NUM_LEVELS {
            return Err(Error::InvalidData(format!(
                "table {} is on unknown level {}",
                meta.id, meta.level
            )));
        }
        max_file = max_file.max(meta.id);
        let table = Table::load(fs.as_ref(), table_path(&sst_dir, meta.id), meta.clone())?;
        levels[level].push(Arc::new(table));
    }

    let mut logs = Vec::new();
    for number in wal::list_logs(fs.as_ref(), &wal_dir)? {
        max_file = max_file.max(number);
        if number < manifest_state.log_number {
            remove_log(config, &wal_dir, number);
        } else {
            logs.push(number);
        }
    }

    let mut next_file = manifest_state.next_file_number.max(max_file + 1).max(1);
    let new_log = next_file;
    next_file += 1;

    let (memtable, last_sequence) =
        replay_logs(config, &wal_dir, &logs, new_log, manifest_state.last_sequence)?;

    // Logs that yielded nothing need not outlive recovery.
    let older = if memtable.is_empty() {
        for &number in &logs {
            remove_log(config, &wal_dir, number);
        }
        Vec::new()
    } else {
        logs.clone()
    };

    let wal = Wal::open(
        fs.clone(),
        wal_dir,
        new_log,
        WalOptions {
            buffer_size: config.wal_buffer_size,
            manual_flush: config.manual_wal_flush,
        },
        older,
    )?;

    tracing::info!(
        dir = %config.dir.display(),
        tables = manifest_state.tables.len(),
        replayed_logs = ?logs,
        recovered_entries = memtable.len(),
        last_sequence,
        log = new_log,
        "Recovered database"
    );

    Ok(Recovered {
        state: DbState::new(memtable, levels, manifest, next_file),
        wal,
        last_sequence,
        lock,
    })
}

/// Replays `logs` in order into one memtable. A torn or corrupt record ends
/// replay; nothing after it was acknowledged as durable.
fn replay_logs(
    config: &DbConfig,
    wal_dir: &Path,
    logs: &[u64],
    new_log: u64,
    mut last_sequence: SequenceNumber,
) -> Result<(Memtable, SequenceNumber)> {
    let first_log = logs.first().copied().unwrap_or(new_log);
    let memtable = Memtable::new(new_log, first_log);

    for &number in logs {
        let replay = match wal::replay(config.fs.as_ref(), &wal::log_path(wal_dir, number)) {
            Ok(replay) => replay,
            Err(e) => {
                tracing::warn!(log = number, error = %e, "Unreadable log header, stopping replay");
                break;
            }
        };
        for record in &replay.records {
            let batch = WriteBatch::from_bytes(record.clone())?;
            if batch.is_empty() {
                continue;
            }
            memtable.insert(batch.sequence(), &batch)?;
            last_sequence = last_sequence.max(batch.sequence() + batch.count() as u64 - 1);
        }
        if let Some(e) = replay.tail_error {
            tracing::warn!(
                log = number,
                error = %e,
                records = replay.records.len(),
                "Log ends in a damaged record, stopping replay"
            );
            break;
        }
    }

    Ok((memtable, last_sequence))
}

fn remove_log(config: &DbConfig, wal_dir: &Path, number: u64) {
    let path = wal::log_path(wal_dir, number);
    match config.fs.remove(&path) {
        Ok(()) => tracing::info!(log = number, "Deleted obsolete log file"),
        Err(e) => tracing::warn!(log = number, error = %e, "Failed to delete obsolete log file"),
    }
}
