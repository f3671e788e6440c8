use crate::orchestrator::{capabilities, process_tick, record_run_tail, EngineError};
use crate::summary::{summarize, RunSummary};
use chrono::{DateTime, Utc};
use fxsim_broker::{LeveragedBroker, LeveragedBrokerConfig};
use fxsim_core::*;
use fxsim_feed::daily::DEFAULT_MIN_DAILY_DAYS;
use fxsim_feed::{spawn_poller, FeedSynchronizer, LiveFeed, PollerConfig, SlotBuffer};
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

/// Configuration for a live run.
#[derive(Debug, Clone)]
pub struct LiveRunConfig {
    pub broker: LeveragedBrokerConfig,
    pub min_daily_days: usize,
    pub poller: PollerConfig,
    /// Consumer-side sleep when a poll yields nothing.
    pub idle_backoff: Duration,
    /// Checkpoint the sink every N processed ticks.
    pub checkpoint_every: u64,
}

impl Default for LiveRunConfig {
    fn default() -> Self {
        Self {
            broker: LeveragedBrokerConfig::default(),
            min_daily_days: DEFAULT_MIN_DAILY_DAYS,
            poller: PollerConfig::default(),
            idle_backoff: Duration::from_millis(200),
            checkpoint_every: 50,
        }
    }
}

/// Run live: one polling task per feed source, a single consumer loop, and
/// cooperative shutdown. The current tick is always processed to completion
/// before the loop honors the shutdown signal, and the sink is checkpointed
/// before returning, so no torn ledger state survives an orderly exit.
pub async fn run_live(
    sources: Vec<Box<dyn FeedSource>>,
    strategy: &mut dyn Strategy,
    sink: &mut dyn EventSink,
    shutdown: watch::Receiver<bool>,
    config: LiveRunConfig,
) -> Result<RunSummary, EngineError> {
    let run_id = Uuid::new_v4();

    // Pollers listen on an internal channel so a fatal feed error can stop
    // them even though the external shutdown sender belongs to the caller.
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut external = shutdown.clone();
    let forward = stop_tx.clone();
    tokio::spawn(async move {
        while external.changed().await.is_ok() {
            if *external.borrow() {
                let _ = forward.send(true);
                break;
            }
        }
    });

    let mut synchronizer = FeedSynchronizer::new();
    let mut slots: Vec<SlotBuffer> = Vec::new();
    let mut handles = Vec::new();
    for source in sources {
        let slot = SlotBuffer::new(source.symbol());
        handles.push(spawn_poller(
            source,
            slot.clone(),
            config.poller.clone(),
            stop_rx.clone(),
        ));
        synchronizer.register(Box::new(LiveFeed::new(slot.clone())))?;
        slots.push(slot);
    }

    sink.record(&EngineEvent::System(SystemEvent::Started {
        run_id,
        message: format!("live run, symbols {:?}", synchronizer.symbols()),
    }));
    info!(%run_id, symbols = ?synchronizer.symbols(), "starting live run");

    let mut broker = LeveragedBroker::new(config.broker.clone());
    strategy
        .on_start(&capabilities(&synchronizer, config.min_daily_days))
        .await;

    let mut last_tick: Option<DateTime<Utc>> = None;
    let mut ticks: u64 = 0;
    let mut max_drawdown = Decimal::ZERO;
    let mut stall_reported = vec![false; slots.len()];

    let run_result: Result<(), EngineError> = loop {
        if *shutdown.borrow() {
            break Ok(());
        }

        match synchronizer.poll().await {
            Ok(Some(tick)) => {
                let caps = capabilities(&synchronizer, config.min_daily_days);
                if let Err(err) =
                    process_tick(&tick, &mut broker, strategy, sink, &caps, &mut last_tick).await
                {
                    break Err(err);
                }
                ticks += 1;
                max_drawdown = max_drawdown.max(broker.account().current_drawdown());
                if config.checkpoint_every > 0 && ticks % config.checkpoint_every == 0 {
                    sink.checkpoint();
                    sink.record(&EngineEvent::System(SystemEvent::Checkpoint {
                        ticks_processed: ticks,
                    }));
                }
            }
            Ok(None) => {
                tokio::time::sleep(config.idle_backoff).await;
            }
            Err(err) => break Err(err.into()),
        }

        for (i, slot) in slots.iter().enumerate() {
            let stalled = slot.is_stalled();
            if stalled && !stall_reported[i] {
                sink.record(&EngineEvent::Feed(FeedEvent::Stalled {
                    symbol: slot.symbol().to_string(),
                }));
            }
            stall_reported[i] = stalled;
        }
    };

    // Stop pollers and wait for them before touching final state.
    let _ = stop_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    strategy.on_stop().await;

    for slot in &slots {
        let count = slot.backpressure_count();
        if count > 0 {
            sink.record(&EngineEvent::Feed(FeedEvent::Backpressure {
                symbol: slot.symbol().to_string(),
                count,
            }));
        }
    }
    record_run_tail(sink, &synchronizer, config.min_daily_days);

    match run_result {
        Ok(()) => {
            sink.record(&EngineEvent::System(SystemEvent::Stopped {
                message: format!("live run stopped after {ticks} ticks"),
            }));
            sink.checkpoint();
            info!(%run_id, ticks, "live run stopped");
            Ok(summarize(
                run_id,
                config.broker.initial_cash,
                broker.account(),
                broker.trade_log(),
                ticks,
                max_drawdown,
            ))
        }
        Err(err) => {
            error!(%run_id, error = %err, "live run aborted");
            sink.record(&EngineEvent::System(SystemEvent::Error {
                message: err.to_string(),
            }));
            sink.checkpoint();
            Err(err)
        }
    }
}
