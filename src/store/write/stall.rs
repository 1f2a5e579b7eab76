//! Maps background backlog to a write stall condition.
//!
//! The evaluator is a pure function of the live options and two counters:
//! immutable memtables waiting for flush and tables in L0. Its result is held
//! on the [`WriteController`] as a token, so re-evaluating replaces the
//! previous condition atomically from the writers' point of view.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;

use super::controller::{DelayWriteToken, StopWriteToken, WriteController};
use crate::config::ColumnFamilyOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallCause {
    MemtableLimit,
    Level0Files,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallCondition {
    Normal,
    /// `excess` is how far the backlog is past the slowdown threshold, from 0.
    Delayed { cause: StallCause, excess: usize },
    Stopped { cause: StallCause },
}

/// Backlog counters the evaluator reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backlog {
    pub immutable_memtables: usize,
    pub level0_tables: usize,
}

pub fn evaluate(opts: &ColumnFamilyOptions, backlog: &Backlog) -> StallCondition {
    if opts.disable_write_stall {
        return StallCondition::Normal;
    }

    let imm = backlog.immutable_memtables;
    let l0 = backlog.level0_tables;

    if imm >= opts.max_write_buffer_number {
        return StallCondition::Stopped {
            cause: StallCause::MemtableLimit,
        };
    }
    if l0 >= opts.level0_stop_writes_trigger {
        return StallCondition::Stopped {
            cause: StallCause::Level0Files,
        };
    }
    if opts.max_write_buffer_number > 3 && imm + 1 >= opts.max_write_buffer_number {
        return StallCondition::Delayed {
            cause: StallCause::MemtableLimit,
            excess: imm + 1 - opts.max_write_buffer_number,
        };
    }
    if l0 >= opts.level0_slowdown_writes_trigger {
        return StallCondition::Delayed {
            cause: StallCause::Level0Files,
            excess: l0 - opts.level0_slowdown_writes_trigger,
        };
    }
    StallCondition::Normal
}

/// Chooses the delayed write rate for a `Delayed` condition.
pub trait DelayPolicy: Send + Sync + Debug {
    fn delayed_write_rate(&self, base_rate: u64, min_rate: u64, excess: usize) -> u64;
}

/// Halves the rate for every unit of excess backlog, down to `min_rate`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HalvingDelayPolicy;

impl DelayPolicy for HalvingDelayPolicy {
    fn delayed_write_rate(&self, base_rate: u64, min_rate: u64, excess: usize) -> u64 {
        let shift = excess.min(63) as u32;
        (base_rate >> shift).max(min_rate)
    }
}

#[derive(Debug)]
enum Held {
    Normal,
    Delay(DelayWriteToken),
    Stop(StopWriteToken),
}

#[derive(Debug)]
struct Current {
    condition: StallCondition,
    held: Held,
}

/// Holds the token matching the most recent evaluation.
#[derive(Debug)]
pub struct StallEvaluator {
    policy: Arc<dyn DelayPolicy>,
    base_rate: u64,
    min_rate: u64,
    current: Mutex<Current>,
}

impl StallEvaluator {
    pub fn new(policy: Arc<dyn DelayPolicy>, base_rate: u64, min_rate: u64) -> Self {
        Self {
            policy,
            base_rate,
            min_rate,
            current: Mutex::new(Current {
                condition: StallCondition::Normal,
                held: Held::Normal,
            }),
        }
    }

    pub fn condition(&self) -> StallCondition {
        self.current.lock().condition
    }

    /// Re-evaluates against `live` options and swaps the controller token.
    pub fn recalculate(
        &self,
        controller: &WriteController,
        live: &ColumnFamilyOptions,
        backlog: Backlog,
    ) -> StallCondition {
        let condition = evaluate(live, &backlog);
        let mut current = self.current.lock();

        let held = match condition {
            StallCondition::Normal => Held::Normal,
            StallCondition::Stopped { .. } => {
                match std::mem::replace(&mut current.held, Held::Normal) {
                    Held::Stop(token) => Held::Stop(token),
                    _ => Held::Stop(controller.get_stop_token()),
                }
            }
            StallCondition::Delayed { excess, .. } => {
                let rate = self
                    .policy
                    .delayed_write_rate(self.base_rate, self.min_rate, excess);
                Held::Delay(controller.get_delay_token(rate))
            }
        };
        // The old token is released only after the new one is taken.
        let previous = std::mem::replace(&mut current.held, held);
        drop(previous);

        if current.condition != condition {
            match condition {
                StallCondition::Stopped { cause } => tracing::warn!(
                    ?cause,
                    immutable_memtables = backlog.immutable_memtables,
                    level0_tables = backlog.level0_tables,
                    "Stopping writes"
                ),
                StallCondition::Delayed { cause, excess } => tracing::info!(
                    ?cause,
                    excess,
                    rate = controller.delayed_write_rate(),
                    "Delaying writes"
                ),
                StallCondition::Normal => tracing::info!(
                    immutable_memtables = backlog.immutable_memtables,
                    level0_tables = backlog.level0_tables,
                    "Write stall cleared"
                ),
            }
        }
        current.condition = condition;
        condition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backlog(imm: usize, l0: usize) -> Backlog {
        Backlog {
            immutable_memtables: imm,
            level0_tables: l0,
        }
    }

    fn opts() -> ColumnFamilyOptions {
        ColumnFamilyOptions::default()
            .max_write_buffer_number(5)
            .level0_slowdown_writes_trigger(4)
            .level0_stop_writes_trigger(8)
    }

    #[test]
    fn test_evaluate_thresholds() {
        let o = opts();
        assert_eq!(evaluate(&o, &backlog(0, 0)), StallCondition::Normal);
        assert_eq!(
            evaluate(&o, &backlog(5, 0)),
            StallCondition::Stopped {
                cause: StallCause::MemtableLimit
            }
        );
        assert_eq!(
            evaluate(&o, &backlog(0, 8)),
            StallCondition::Stopped {
                cause: StallCause::Level0Files
            }
        );
        assert_eq!(
            evaluate(&o, &backlog(4, 0)),
            StallCondition::Delayed {
                cause: StallCause::MemtableLimit,
                excess: 0
            }
        );
        assert_eq!(
            evaluate(&o, &backlog(0, 6)),
            StallCondition::Delayed {
                cause: StallCause::Level0Files,
                excess: 2
            }
        );
    }

    #[test]
    fn test_small_buffer_count_never_delays_on_memtables() {
        let o = opts().max_write_buffer_number(3);
        assert_eq!(evaluate(&o, &backlog(2, 0)), StallCondition::Normal);
        assert!(matches!(
            evaluate(&o, &backlog(3, 0)),
            StallCondition::Stopped { .. }
        ));
    }

    #[test]
    fn test_disabled_wins() {
        let o = opts().disable_write_stall(true);
        assert_eq!(evaluate(&o, &backlog(100, 100)), StallCondition::Normal);
    }

    #[test]
    fn test_halving_policy() {
        let p = HalvingDelayPolicy;
        assert_eq!(p.delayed_write_rate(1024, 64, 0), 1024);
        assert_eq!(p.delayed_write_rate(1024, 64, 2), 256);
        assert_eq!(p.delayed_write_rate(1024, 64, 10), 64);
        assert_eq!(p.delayed_write_rate(1024, 64, 500), 64);
    }

    #[test]
    fn test_recalculate_swaps_tokens() {
        let controller = WriteController::new(1 << 20);
        let evaluator = StallEvaluator::new(Arc::new(HalvingDelayPolicy), 1 << 20, 1024);
        let o = opts();

        evaluator.recalculate(&controller, &o, backlog(5, 0));
        assert!(controller.is_stopped());
        // Re-evaluating the same stop keeps exactly one hold.
        evaluator.recalculate(&controller, &o, backlog(6, 0));
        assert!(controller.is_stopped());

        evaluator.recalculate(&controller, &o, backlog(0, 6));
        assert!(!controller.is_stopped());
        assert!(controller.needs_delay());
        assert_eq!(controller.delayed_write_rate(), 1 << 18);

        let disabled = o.clone().disable_write_stall(true);
        assert_eq!(
            evaluator.recalculate(&controller, &disabled, backlog(5, 8)),
            StallCondition::Normal
        );
        assert!(!controller.is_stopped());
        assert!(!controller.needs_delay());
        assert_eq!(evaluator.condition(), StallCondition::Normal);
    }
}
