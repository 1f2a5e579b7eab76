//! The concurrent write path: admission control, group commit and the
//! pipeline that carries a group from the log into the memtable.

pub mod controller;
pub mod pipeline;
pub mod stall;
pub mod thread;

pub use controller::{DelayWriteToken, StopWriteToken, WriteController};
pub use stall::{Backlog, DelayPolicy, HalvingDelayPolicy, StallCause, StallCondition};
pub use thread::{WriterState, LOW_PRIORITY_MAX_SKIPS};
