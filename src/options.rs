/// Per-call write options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// fsync the log before acknowledging.
    pub sync: bool,
    /// Skip the log; the write lives only in the memtable until flushed.
    pub disable_wal: bool,
    /// Fail with `Incomplete` instead of waiting out a stall.
    pub no_slowdown: bool,
    /// Yield leadership to normal-priority writers when possible.
    pub low_priority: bool,
    /// Ignore stop/delay conditions. Reserved for internal writers.
    pub bypass_stall: bool,
    /// Accepted for compatibility; there is a single column family.
    pub ignore_missing_column_families: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn disable_wal(mut self, disabled: bool) -> Self {
        self.disable_wal = disabled;
        self
    }

    pub fn no_slowdown(mut self, enabled: bool) -> Self {
        self.no_slowdown = enabled;
        self
    }

    pub fn low_priority(mut self, enabled: bool) -> Self {
        self.low_priority = enabled;
        self
    }

    pub fn bypass_stall(mut self, enabled: bool) -> Self {
        self.bypass_stall = enabled;
        self
    }
}

/// Options for an explicit memtable flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOptions {
    /// Block until the switched memtable is persisted.
    pub wait: bool,
    /// When false, wait for backlog to drain first so the switch cannot stop writes.
    pub allow_write_stall: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            wait: true,
            allow_write_stall: false,
        }
    }
}

impl FlushOptions {
    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn allow_write_stall(mut self, allow: bool) -> Self {
        self.allow_write_stall = allow;
        self
    }
}
