use crate::summary::{summarize, RunSummary};
use chrono::{DateTime, Utc};
use fxsim_broker::{BrokerError, LeveragedBroker, LeveragedBrokerConfig, SubmitOutcome};
use fxsim_core::*;
use fxsim_feed::daily::DEFAULT_MIN_DAILY_DAYS;
use fxsim_feed::FeedSynchronizer;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors that abort a run. Everything recoverable (gaps, rejections,
/// short daily history, duplicates) is a value or a diagnostic, never an
/// error here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// Two ticks arrived out of order. The synchronizer makes this
    /// unreachable; seeing it means a core invariant broke upstream.
    #[error("tick ordering violated: {observed} not after {previous}")]
    OutOfOrderTick {
        previous: DateTime<Utc>,
        observed: DateTime<Utc>,
    },
}

/// Configuration for a batch (backtest) run.
#[derive(Debug, Clone)]
pub struct BatchRunConfig {
    pub broker: LeveragedBrokerConfig,
    /// Completed daily bars required before daily features are enabled.
    pub min_daily_days: usize,
    /// Consecutive empty polls before the input is considered drained.
    pub max_idle_polls: u32,
}

impl Default for BatchRunConfig {
    fn default() -> Self {
        Self {
            broker: LeveragedBrokerConfig::default(),
            min_daily_days: DEFAULT_MIN_DAILY_DAYS,
            max_idle_polls: 3,
        }
    }
}

pub(crate) fn capabilities(sync: &FeedSynchronizer, min_days: usize) -> Capabilities {
    let mut caps = Capabilities::default();
    for symbol in sync.symbols() {
        let ready = sync
            .daily(&symbol)
            .map(|d| d.sufficient(min_days))
            .unwrap_or(false);
        caps.daily_history.insert(symbol, ready);
    }
    caps
}

/// Apply one synchronized tick: broker first (fills against the new bars),
/// then the strategy, then its order actions, then an account snapshot.
pub(crate) async fn process_tick(
    tick: &SynchronizedTick,
    broker: &mut LeveragedBroker,
    strategy: &mut dyn Strategy,
    sink: &mut dyn EventSink,
    capabilities: &Capabilities,
    last_tick: &mut Option<DateTime<Utc>>,
) -> Result<(), EngineError> {
    if let Some(previous) = *last_tick {
        if tick.timestamp <= previous {
            return Err(EngineError::OutOfOrderTick {
                previous,
                observed: tick.timestamp,
            });
        }
    }
    *last_tick = Some(tick.timestamp);

    broker.apply_tick(tick)?;
    for event in broker.drain_events() {
        sink.record(&EngineEvent::Order(event));
    }

    let actions = strategy.on_tick(tick, broker.account(), capabilities).await;
    for action in actions {
        match action {
            OrderAction::Submit(request) => match broker.submit(request)? {
                SubmitOutcome::Accepted(id) => {
                    debug!(order_id = %id, "order accepted");
                }
                SubmitOutcome::Rejected { order_id, reason } => {
                    warn!(order_id = %order_id, %reason, "order rejected");
                }
            },
            OrderAction::Cancel(id) => {
                if let Err(err) = broker.cancel(id, "strategy cancel") {
                    warn!(order_id = %id, error = %err, "cancel failed");
                }
            }
        }
        for event in broker.drain_events() {
            sink.record(&EngineEvent::Order(event));
        }
    }

    sink.record(&EngineEvent::Account(broker.account().clone()));
    Ok(())
}

pub(crate) fn record_run_tail(
    sink: &mut dyn EventSink,
    synchronizer: &FeedSynchronizer,
    min_daily_days: usize,
) {
    for symbol in synchronizer.symbols() {
        let days = synchronizer
            .daily(&symbol)
            .map(|d| d.completed_days())
            .unwrap_or(0);
        if days < min_daily_days {
            sink.record(&EngineEvent::Feed(FeedEvent::DailyHistoryShort {
                symbol,
                days,
                required: min_daily_days,
            }));
        }
    }
    let diag = synchronizer.diagnostics();
    sink.record(&EngineEvent::Feed(FeedEvent::Diagnostics {
        gap_polls: diag.gap_polls,
        mismatch_polls: diag.mismatch_polls,
        duplicates_suppressed: diag.duplicates_suppressed,
    }));
}

/// Run a deterministic backtest over registered feeds until the input is
/// drained. Identical inputs yield byte-identical ledger fingerprints.
pub async fn run_batch(
    mut synchronizer: FeedSynchronizer,
    strategy: &mut dyn Strategy,
    sink: &mut dyn EventSink,
    config: BatchRunConfig,
) -> Result<RunSummary, EngineError> {
    let run_id = Uuid::new_v4();
    sink.record(&EngineEvent::System(SystemEvent::Started {
        run_id,
        message: format!("batch run, symbols {:?}", synchronizer.symbols()),
    }));
    info!(%run_id, symbols = ?synchronizer.symbols(), "starting batch run");

    let mut broker = LeveragedBroker::new(config.broker.clone());
    strategy
        .on_start(&capabilities(&synchronizer, config.min_daily_days))
        .await;

    let mut last_tick: Option<DateTime<Utc>> = None;
    let mut ticks: u64 = 0;
    let mut idle_polls: u32 = 0;
    let mut max_drawdown = Decimal::ZERO;

    loop {
        match synchronizer.poll().await? {
            Some(tick) => {
                idle_polls = 0;
                let caps = capabilities(&synchronizer, config.min_daily_days);
                process_tick(&tick, &mut broker, strategy, sink, &caps, &mut last_tick).await?;
                ticks += 1;
                max_drawdown = max_drawdown.max(broker.account().current_drawdown());
            }
            None => {
                idle_polls += 1;
                if idle_polls >= config.max_idle_polls {
                    break;
                }
            }
        }
    }

    strategy.on_stop().await;
    record_run_tail(sink, &synchronizer, config.min_daily_days);
    sink.record(&EngineEvent::System(SystemEvent::Stopped {
        message: format!("batch run drained after {ticks} ticks"),
    }));
    sink.checkpoint();

    info!(%run_id, ticks, "batch run finished");
    Ok(summarize(
        run_id,
        config.broker.initial_cash,
        broker.account(),
        broker.trade_log(),
        ticks,
        max_drawdown,
    ))
}
