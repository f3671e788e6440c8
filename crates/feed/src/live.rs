use async_trait::async_trait;
use fxsim_core::{Bar, FeedError, FeedSource};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Live-mode poller settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// How often the poller asks the source for a new bar.
    pub poll_interval: Duration,
    /// How long a feed may stay silent before it is reported stalled
    /// (diagnostic only, never fatal).
    pub patience: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            patience: Duration::from_secs(60),
        }
    }
}

/// Single-slot buffer between one feed poller (producer) and the
/// synchronizer (the only consumer).
///
/// Never more than one bar is pending. If a new bar arrives before the
/// previous one was consumed, that is a backpressure violation: the
/// displaced bar is logged and counted, never dropped silently.
#[derive(Clone)]
pub struct SlotBuffer {
    symbol: Arc<str>,
    slot: Arc<Mutex<Option<Bar>>>,
    failure: Arc<Mutex<Option<FeedError>>>,
    backpressure: Arc<AtomicU64>,
    stalled: Arc<AtomicBool>,
}

impl SlotBuffer {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.into(),
            slot: Arc::new(Mutex::new(None)),
            failure: Arc::new(Mutex::new(None)),
            backpressure: Arc::new(AtomicU64::new(0)),
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub async fn push(&self, bar: Bar) {
        let mut slot = self.slot.lock().await;
        if let Some(displaced) = slot.replace(bar) {
            self.backpressure.fetch_add(1, Ordering::Relaxed);
            warn!(
                symbol = %self.symbol,
                displaced_timestamp = %displaced.timestamp,
                "backpressure: bar displaced before consumption"
            );
        }
    }

    pub async fn take(&self) -> Option<Bar> {
        self.slot.lock().await.take()
    }

    async fn fail(&self, err: FeedError) {
        *self.failure.lock().await = Some(err);
    }

    pub fn backpressure_count(&self) -> u64 {
        self.backpressure.load(Ordering::Relaxed)
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Relaxed)
    }

    fn set_stalled(&self, value: bool) {
        self.stalled.store(value, Ordering::Relaxed);
    }
}

/// Consumer-side adapter: a `FeedSource` over a `SlotBuffer`, suitable for
/// registration with the synchronizer. Surfaces a fatal poller error
/// (clock skew) on the next `next()` call.
pub struct LiveFeed {
    slot: SlotBuffer,
}

impl LiveFeed {
    pub fn new(slot: SlotBuffer) -> Self {
        Self { slot }
    }
}

#[async_trait]
impl FeedSource for LiveFeed {
    fn symbol(&self) -> &str {
        self.slot.symbol()
    }

    async fn next(&mut self) -> Result<Option<Bar>, FeedError> {
        if let Some(err) = self.slot.failure.lock().await.take() {
            return Err(err);
        }
        Ok(self.slot.take().await)
    }
}

/// Spawn the polling task for one feed. The task owns the external source,
/// pushes into the slot, tracks staleness, and exits cooperatively when the
/// shutdown signal flips.
pub fn spawn_poller(
    mut source: Box<dyn FeedSource>,
    slot: SlotBuffer,
    config: PollerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_bar_at = Instant::now();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(symbol = %slot.symbol(), "poller shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(config.poll_interval) => {
                    match source.next().await {
                        Ok(Some(bar)) => {
                            slot.push(bar).await;
                            slot.set_stalled(false);
                            last_bar_at = Instant::now();
                        }
                        Ok(None) => {
                            if last_bar_at.elapsed() >= config.patience && !slot.is_stalled() {
                                warn!(
                                    symbol = %slot.symbol(),
                                    patience_secs = config.patience.as_secs(),
                                    "feed stalled: no bar within patience window"
                                );
                                slot.set_stalled(true);
                            }
                        }
                        Err(err @ FeedError::ClockSkew { .. }) => {
                            slot.fail(err).await;
                            break;
                        }
                        Err(err) => {
                            warn!(symbol = %slot.symbol(), error = %err, "feed source error");
                        }
                    }
                }
            }
        }
    })
}
