use crate::models::*;
use serde::{Deserialize, Serialize};

/// Top-level event enum that flows from the core to the persistence /
/// reporting collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    Order(OrderEvent),
    Feed(FeedEvent),
    /// Periodic account snapshot (one per synchronized tick).
    Account(AccountState),
    System(SystemEvent),
}

/// Order lifecycle events. Append-only; every state transition emits
/// exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderEvent {
    Submitted(Order),
    Filled {
        order_id: OrderId,
        fill: FillReport,
    },
    Cancelled {
        order_id: OrderId,
        reason: String,
    },
    Rejected {
        order_id: OrderId,
        reason: RejectReason,
    },
}

/// Feed diagnostics. All non-fatal; the fatal clock-skew case is an error,
/// not an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedEvent {
    /// A feed produced no bar within the patience window.
    Stalled { symbol: String },
    /// A live poller overwrote un-consumed slot bars `count` times.
    Backpressure { symbol: String, count: u64 },
    /// The symbol's daily history is shorter than the configured minimum,
    /// so daily-dependent features are disabled for this run.
    DailyHistoryShort {
        symbol: String,
        days: usize,
        required: usize,
    },
    /// End-of-run synchronizer counters.
    Diagnostics {
        gap_polls: u64,
        mismatch_polls: u64,
        duplicates_suppressed: u64,
    },
}

/// System lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SystemEvent {
    Started { run_id: RunId, message: String },
    Stopped { message: String },
    Checkpoint { ticks_processed: u64 },
    Error { message: String },
}
