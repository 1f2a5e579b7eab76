use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use crate::{
    error::Result,
    scheduler::{BackgroundTask, Context},
    store::db::DbInner,
};

/// Point-in-time view of the engine's backlog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMetrics {
    pub active_memtable_size: usize,
    pub immutable_memtables: usize,
    pub level_counts: Vec<usize>,
    pub flush_running: bool,
    pub compaction_running: bool,
    pub next_file_number: u64,
}

/// Periodically logs [`StateMetrics`]. Holds the engine weakly so a closed
/// engine is not kept alive by its own scheduler.
pub struct MetricsTask {
    db: Weak<DbInner>,
    interval: Duration,
}

impl MetricsTask {
    pub fn new(db: &Arc<DbInner>) -> Self {
        Self {
            db: Arc::downgrade(db),
            interval: db.config.metrics_interval,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let Some(db) = self.db.upgrade() else {
            return Ok(());
        };
        let metrics = db.state.metrics();
        let stall = db.stall.condition();
        let published = db.visibility.published();

        tracing::info!(
            active_memtable_size = metrics.active_memtable_size,
            immutable_memtables = metrics.immutable_memtables,
            flush_running = metrics.flush_running,
            compaction_running = metrics.compaction_running,
            level_counts = ?metrics.level_counts,
            ?stall,
            delayed_write_rate = db.controller.delayed_write_rate(),
            published_sequence = published,
            "Engine metrics"
        );

        Ok(())
    }
}
