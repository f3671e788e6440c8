use crate::daily::DailyHistory;
use chrono::{DateTime, Utc};
use fxsim_core::{Bar, FeedError, FeedSource, SynchronizedTick};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Non-fatal counters surfaced to the orchestrator and to logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncDiagnostics {
    /// Polls that failed because at least one feed had no bar buffered.
    pub gap_polls: u64,
    /// Polls that failed because buffered timestamps disagreed.
    pub mismatch_polls: u64,
    /// Redelivered bars absorbed by duplicate-tick prevention.
    pub duplicates_suppressed: u64,
}

struct FeedSlot {
    symbol: String,
    source: Box<dyn FeedSource>,
    /// Head-of-line buffer: at most one pending bar.
    buffered: Option<Bar>,
    /// Highest timestamp ever accepted from this source, for the
    /// monotonicity guard.
    last_accepted: Option<DateTime<Utc>>,
}

/// Aligns N independent per-symbol feeds into one synchronized timeline.
///
/// `poll()` emits a tick only when every registered feed has buffered a bar
/// and all buffered timestamps agree; otherwise it returns `None` and the
/// caller retries later. A logical timestamp is emitted at most once per
/// run; redelivered bars at or before the last emitted timestamp are
/// absorbed silently (debug-logged). The only fatal condition is a feed
/// whose timestamps move backwards.
pub struct FeedSynchronizer {
    slots: Vec<FeedSlot>,
    last_emitted: Option<DateTime<Utc>>,
    diagnostics: SyncDiagnostics,
    daily: BTreeMap<String, DailyHistory>,
}

impl FeedSynchronizer {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            last_emitted: None,
            diagnostics: SyncDiagnostics::default(),
            daily: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, source: Box<dyn FeedSource>) -> Result<(), FeedError> {
        let symbol = source.symbol().to_string();
        if self.slots.iter().any(|s| s.symbol == symbol) {
            return Err(FeedError::DuplicateSymbol(symbol));
        }
        self.slots.push(FeedSlot {
            symbol,
            source,
            buffered: None,
            last_accepted: None,
        });
        Ok(())
    }

    pub fn symbols(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.symbol.clone()).collect()
    }

    pub fn diagnostics(&self) -> SyncDiagnostics {
        self.diagnostics
    }

    /// Derived daily aggregate for a symbol (completed UTC days only).
    pub fn daily(&self, symbol: &str) -> Option<&DailyHistory> {
        self.daily.get(symbol)
    }

    pub fn last_emitted(&self) -> Option<DateTime<Utc>> {
        self.last_emitted
    }

    /// Try to emit the next synchronized tick.
    pub async fn poll(&mut self) -> Result<Option<SynchronizedTick>, FeedError> {
        if self.slots.is_empty() {
            return Ok(None);
        }
        self.refill().await?;

        let empty: Vec<&str> = self
            .slots
            .iter()
            .filter(|s| s.buffered.is_none())
            .map(|s| s.symbol.as_str())
            .collect();
        if !empty.is_empty() {
            self.diagnostics.gap_polls += 1;
            debug!(missing = ?empty, "poll incomplete: feeds without a buffered bar");
            return Ok(None);
        }

        let timestamps: Vec<DateTime<Utc>> = self
            .slots
            .iter()
            .filter_map(|s| s.buffered.as_ref().map(|b| b.timestamp))
            .collect();
        let Some(min_ts) = timestamps.iter().min().copied() else {
            return Ok(None);
        };
        if timestamps.iter().any(|t| *t != min_ts) {
            let ahead: Vec<&str> = self
                .slots
                .iter()
                .filter(|s| s.buffered.as_ref().is_some_and(|b| b.timestamp > min_ts))
                .map(|s| s.symbol.as_str())
                .collect();
            self.diagnostics.mismatch_polls += 1;
            warn!(
                %min_ts,
                ahead = ?ahead,
                "poll incomplete: buffered timestamps disagree"
            );
            return Ok(None);
        }

        // All feeds agree: pop atomically and record the emission.
        let bars: Vec<Bar> = self
            .slots
            .iter_mut()
            .filter_map(|s| s.buffered.take())
            .collect();
        for bar in &bars {
            self.daily
                .entry(bar.symbol.clone())
                .or_default()
                .observe(bar);
        }
        self.last_emitted = Some(min_ts);
        Ok(Some(SynchronizedTick::new(min_ts, bars)))
    }

    /// Fill each empty slot with the next fresh bar, enforcing monotonic
    /// time and absorbing redeliveries of already-emitted timestamps. A
    /// slot keeps pulling past duplicates so a redelivery never costs a
    /// whole poll.
    async fn refill(&mut self) -> Result<(), FeedError> {
        let last_emitted = self.last_emitted;
        for slot in &mut self.slots {
            while slot.buffered.is_none() {
                let bar = match slot.source.next().await {
                    Ok(Some(bar)) => bar,
                    Ok(None) => break,
                    Err(err @ FeedError::ClockSkew { .. }) => return Err(err),
                    Err(err) => {
                        // Transport trouble is a gap, retried next poll.
                        warn!(symbol = %slot.symbol, error = %err, "feed source error");
                        break;
                    }
                };

                if let Some(previous) = slot.last_accepted {
                    if bar.timestamp < previous {
                        return Err(FeedError::ClockSkew {
                            symbol: slot.symbol.clone(),
                            previous,
                            observed: bar.timestamp,
                        });
                    }
                }

                // Redelivery of an already-emitted (or already-accepted)
                // timestamp: absorb, never re-process.
                let already_emitted = last_emitted.is_some_and(|t| bar.timestamp <= t);
                let already_accepted = slot.last_accepted == Some(bar.timestamp);
                if already_emitted || already_accepted {
                    self.diagnostics.duplicates_suppressed += 1;
                    debug!(
                        symbol = %slot.symbol,
                        timestamp = %bar.timestamp,
                        "duplicate bar suppressed"
                    );
                    continue;
                }

                slot.last_accepted = Some(bar.timestamp);
                slot.buffered = Some(bar);
            }
        }
        Ok(())
    }
}

impl Default for FeedSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}
