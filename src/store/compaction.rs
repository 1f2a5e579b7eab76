//! Merges L0 and L1 into a single L1 table.
//!
//! The policy is deliberately simple. It exists so that background progress
//! changes the L0 count, which is what the write stall reacts to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{
    config::ColumnFamilyOptions,
    error::Result,
    scheduler::Priority,
    store::{
        db::DbInner,
        manifest::VersionEdit,
        memtable::Entry,
        table::{table_path, Table},
    },
};

/// A picked compaction, holding the engine's single compaction slot until it
/// is run or dropped.
#[derive(Debug)]
pub struct CompactionJob {
    inputs: Vec<Arc<Table>>,
    options: Arc<ColumnFamilyOptions>,
    running: Arc<AtomicBool>,
}

impl CompactionJob {
    /// The options snapshot taken when the job was picked.
    pub fn options(&self) -> &ColumnFamilyOptions {
        &self.options
    }

    pub fn input_ids(&self) -> Vec<u64> {
        self.inputs.iter().map(|t| t.id()).collect()
    }
}

impl Drop for CompactionJob {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl DbInner {
    /// Picks L0 plus L1 once L0 reaches the trigger, or whenever L0 is
    /// non-empty if `force` is set.
    pub(crate) fn pick_compaction(&self, force: bool) -> Option<CompactionJob> {
        let options = self.options.load_full();
        let level0 = self.state.level0_count();
        if level0 == 0 || (!force && level0 < options.level0_file_num_compaction_trigger) {
            return None;
        }
        let running = self.state.try_start_compaction()?;

        let inputs: Vec<Arc<Table>> = self.state.levels.read().iter().flatten().cloned().collect();
        tracing::debug!(inputs = inputs.len(), level0, "Picked compaction");
        Some(CompactionJob {
            inputs,
            options,
            running,
        })
    }

    pub(crate) fn maybe_schedule_compaction(self: &Arc<Self>) {
        if self.options.load().disable_auto_compactions {
            return;
        }
        let Some(job) = self.pick_compaction(false) else {
            return;
        };
        let db = self.clone();
        if let Err(e) = self
            .scheduler
            .schedule(Priority::Low, "compaction", move || db.run_compaction(job))
        {
            tracing::warn!(error = %e, "Could not schedule compaction");
        }
    }

    /// Runs `job` and installs its output. A failure is a fatal background
    /// error.
    pub(crate) fn run_compaction(&self, job: CompactionJob) -> Result<()> {
        self.compact(&job).map_err(|e| {
            let e = e.into_fatal();
            self.errors.set(e.clone());
            self.notify_background();
            e
        })
    }

    fn compact(&self, job: &CompactionJob) -> Result<()> {
        let entries = merge(&job.inputs);

        let output = if entries.is_empty() {
            None
        } else {
            let id = self.state.next_file_number();
            Some(Arc::new(Table::write(
                self.fs.as_ref(),
                table_path(&self.sst_dir(), id),
                id,
                1,
                entries,
            )?))
        };

        let mut edits: Vec<VersionEdit> = job
            .inputs
            .iter()
            .map(|t| VersionEdit::DeleteTable {
                level: t.meta().level,
                id: t.id(),
            })
            .collect();
        if let Some(table) = &output {
            edits.push(VersionEdit::AddTable(table.meta().clone()));
        }
        self.state.manifest.lock().log_and_apply(&edits)?;

        let input_ids = job.input_ids();
        {
            let mut levels = self.state.levels.write();
            for level in levels.iter_mut() {
                level.retain(|t| !input_ids.contains(&t.id()));
            }
            if let Some(table) = &output {
                levels[1].push(table.clone());
            }
        }
        for table in &job.inputs {
            if let Err(e) = self.fs.remove(table.path()) {
                tracing::warn!(table_id = table.id(), error = %e, "Failed to delete table file");
            }
        }

        tracing::info!(
            inputs = ?input_ids,
            output = output.as_ref().map(|t| t.id()),
            "Compaction installed"
        );

        // Live options, never the job's snapshot.
        self.recalculate_stall();
        self.notify_background();
        Ok(())
    }
}

/// Newest version of each key across `inputs`, tombstones dropped.
fn merge(inputs: &[Arc<Table>]) -> Vec<Entry> {
    let mut all: Vec<Entry> = inputs
        .iter()
        .flat_map(|t| t.entries().iter().cloned())
        .collect();
    all.sort_by(|a, b| a.0.cmp(&b.0));
    all.dedup_by(|later, earlier| later.0.user_key == earlier.0.user_key);
    all.retain(|(_, value)| value.is_some());
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memtable::InternalKey;
    use crate::{fs::OsFileSystem, tmpfs::TempDir};

    fn table(dir: &TempDir, id: u64, entries: Vec<Entry>) -> Arc<Table> {
        Arc::new(
            Table::write(&OsFileSystem, table_path(dir.path(), id), id, 0, entries).unwrap(),
        )
    }

    #[test]
    fn test_merge_keeps_newest_and_drops_tombstones() {
        let dir = TempDir::new().unwrap();
        let old = table(
            &dir,
            1,
            vec![
                (InternalKey::new(b"a".to_vec(), 1), Some(b"a1".to_vec())),
                (InternalKey::new(b"b".to_vec(), 2), Some(b"b2".to_vec())),
            ],
        );
        let new = table(
            &dir,
            2,
            vec![
                (InternalKey::new(b"a".to_vec(), 5), Some(b"a5".to_vec())),
                (InternalKey::new(b"b".to_vec(), 6), None),
                (InternalKey::new(b"c".to_vec(), 4), Some(b"c4".to_vec())),
            ],
        );

        let merged = merge(&[old, new]);
        assert_eq!(
            merged,
            vec![
                (InternalKey::new(b"a".to_vec(), 5), Some(b"a5".to_vec())),
                (InternalKey::new(b"c".to_vec(), 4), Some(b"c4".to_vec())),
            ]
        );
    }
}
