use crate::events::EngineEvent;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Feed Source Trait
// ---------------------------------------------------------------------------

/// Errors that can occur while pulling bars from a feed.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// A feed's timestamp moved backwards. Fatal: every downstream
    /// invariant (ordering, duplicate suppression, bracket atomicity)
    /// assumes monotonic time.
    #[error("clock skew on {symbol}: {observed} is before {previous}")]
    ClockSkew {
        symbol: String,
        previous: DateTime<Utc>,
        observed: DateTime<Utc>,
    },
    /// The underlying source failed (transport, decode, ...). Recoverable;
    /// the synchronizer retries on the next poll.
    #[error("feed source error on {symbol}: {message}")]
    Source { symbol: String, message: String },
    #[error("symbol {0} is already registered")]
    DuplicateSymbol(String),
}

/// Produces bars for one symbol, strictly in timestamp order.
///
/// `next()` returns `Ok(None)` when no bar is available yet; whether that
/// blocks or polls is the collaborator's choice.
#[async_trait]
pub trait FeedSource: Send {
    fn symbol(&self) -> &str;

    async fn next(&mut self) -> Result<Option<Bar>, FeedError>;
}

// ---------------------------------------------------------------------------
// Strategy Trait
// ---------------------------------------------------------------------------

/// Capability flags the strategy may check before using optional features.
///
/// Insufficient daily history is a capability, not an error: the run
/// continues with the dependent feature disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Per symbol: whether enough completed daily bars exist for
    /// daily-derived features.
    pub daily_history: BTreeMap<String, bool>,
}

impl Capabilities {
    pub fn daily_ready(&self, symbol: &str) -> bool {
        self.daily_history.get(symbol).copied().unwrap_or(false)
    }
}

/// The strategy collaborator. One entry point; receives immutable snapshots
/// and answers with order actions. Signal detection itself is out of scope
/// for the core.
#[async_trait]
pub trait Strategy: Send {
    /// Unique identifier for this strategy.
    fn id(&self) -> &str;

    /// Called once before the first tick.
    async fn on_start(&mut self, _capabilities: &Capabilities) {}

    /// Called on every synchronized tick.
    async fn on_tick(
        &mut self,
        tick: &SynchronizedTick,
        account: &AccountState,
        capabilities: &Capabilities,
    ) -> Vec<OrderAction>;

    /// Called once after the last tick.
    async fn on_stop(&mut self) {}
}

// ---------------------------------------------------------------------------
// Event Sink Trait
// ---------------------------------------------------------------------------

/// The persistence / reporting collaborator: an append-only stream of
/// engine events. The core never performs file I/O itself; `checkpoint`
/// asks the sink to durably flush whatever it has accumulated.
pub trait EventSink: Send {
    fn record(&mut self, event: &EngineEvent);

    /// Flush accumulated events durably. Called at checkpoints and at
    /// shutdown, after in-flight fills have completed.
    fn checkpoint(&mut self) {}
}

/// A sink that discards everything. Useful in tests and sizing-only runs.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&mut self, _event: &EngineEvent) {}
}
