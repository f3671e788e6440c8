use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Broker-assigned order identifier, sequential within a run so that two
/// identical runs produce identical ledgers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a bracket group (entry + TP/SL children).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BracketId(pub u64);

/// Identifier of a whole run (not part of the deterministic ledger).
pub type RunId = Uuid;

// ---------------------------------------------------------------------------
// Market Data
// ---------------------------------------------------------------------------

/// A single OHLCV bar. Immutable once emitted by a feed.
///
/// Timestamps are `DateTime<Utc>` in the type itself; the constructors below
/// are the only supported entry points for non-UTC inputs, so a naive local
/// datetime can never leak into the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    /// Build a bar from a Unix timestamp in seconds (always UTC).
    pub fn from_epoch_seconds(
        symbol: &str,
        epoch_seconds: i64,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Option<Self> {
        let timestamp = Utc.timestamp_opt(epoch_seconds, 0).single()?;
        Some(Self {
            symbol: symbol.to_string(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        })
    }

    /// Interpret a naive datetime as UTC. Use only for inputs documented to
    /// already be UTC; never for local wall-clock values.
    pub fn timestamp_from_naive_utc(naive: NaiveDateTime) -> DateTime<Utc> {
        Utc.from_utc_datetime(&naive)
    }

    /// Whether the bar's [low, high] range touches `price` (inclusive).
    pub fn touches(&self, price: Decimal) -> bool {
        self.low <= price && price <= self.high
    }
}

/// One synchronized cross-symbol event: exactly one bar per registered
/// symbol, all sharing the same logical timestamp.
///
/// Bars are kept in a `BTreeMap` so iteration order is deterministic, which
/// the byte-identical-ledger property depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizedTick {
    pub timestamp: DateTime<Utc>,
    pub bars: BTreeMap<String, Bar>,
}

impl SynchronizedTick {
    pub fn new(timestamp: DateTime<Utc>, bars: impl IntoIterator<Item = Bar>) -> Self {
        let bars = bars.into_iter().map(|b| (b.symbol.clone(), b)).collect();
        Self { timestamp, bars }
    }

    pub fn bar(&self, symbol: &str) -> Option<&Bar> {
        self.bars.get(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.bars.keys().map(|s| s.as_str())
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// The kind of order. Closed enumeration; fill rules dispatch on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

/// The lifecycle state of an order.
///
/// Transitions: `Pending -> Filled`, `Pending -> Cancelled`,
/// `Pending -> Rejected`. All three non-pending states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

/// Why an order was rejected. A rejection is a recorded outcome, not an
/// error path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Required margin exceeded free margin at submit time.
    Margin,
    /// Size was zero or negative.
    NonPositiveSize,
    /// Limit/stop order submitted without a price.
    MissingPrice,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Margin => write!(f, "Margin"),
            RejectReason::NonPositiveSize => write!(f, "NonPositiveSize"),
            RejectReason::MissingPrice => write!(f, "MissingPrice"),
        }
    }
}

/// Role of an order within a bracket group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketRole {
    Entry,
    TakeProfit,
    StopLoss,
}

/// Execution details recorded when an order fills. Spread and slippage are
/// kept separate so the cost of each can be audited after the fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillReport {
    /// The price the trade was actually booked at, costs included.
    pub execution_price: Decimal,
    /// Half-spread applied against the trader, in price units.
    pub spread_cost: Decimal,
    /// Slippage applied against the trader, in price units.
    pub slippage_cost: Decimal,
    /// Commission charged on notional, in account currency.
    pub commission: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// A caller-facing request to open an order, optionally with bracket
/// children attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    /// Limit or stop price. `None` for market orders.
    pub price: Option<Decimal>,
    pub size: Decimal,
    /// Take-profit price for the attached child limit order.
    pub tp_price: Option<Decimal>,
    /// Stop-loss price for the attached child stop order.
    pub sl_price: Option<Decimal>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, size: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Market,
            price: None,
            size,
            tp_price: None,
            sl_price: None,
        }
    }

    pub fn limit(symbol: &str, side: Side, size: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Limit,
            price: Some(price),
            size,
            tp_price: None,
            sl_price: None,
        }
    }

    pub fn stop(symbol: &str, side: Side, size: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Stop,
            price: Some(price),
            size,
            tp_price: None,
            sl_price: None,
        }
    }

    /// Attach take-profit and stop-loss children, turning this request into
    /// a bracket entry.
    pub fn with_bracket(mut self, tp_price: Decimal, sl_price: Decimal) -> Self {
        self.tp_price = Some(tp_price);
        self.sl_price = Some(sl_price);
        self
    }
}

/// A broker-owned order. Created from an `OrderRequest` at submit and
/// mutated only by the broker's fill logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    /// Limit or stop price. `None` for market orders.
    pub price: Option<Decimal>,
    pub size: Decimal,
    pub status: OrderStatus,
    pub role: BracketRole,
    pub bracket: Option<BracketId>,
    pub fill: Option<FillReport>,
    pub reject_reason: Option<RejectReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_active(&self) -> bool {
        self.status == OrderStatus::Pending
    }
}

/// One entry order plus up to two child orders (TP limit, SL stop).
///
/// Once the entry fills, at most one of the children may ultimately fill;
/// the broker cancels the sibling in the same tick the first child fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketGroup {
    pub id: BracketId,
    pub entry: OrderId,
    pub take_profit: Option<OrderId>,
    pub stop_loss: Option<OrderId>,
}

impl BracketGroup {
    /// The other child of `child`, if both children exist.
    pub fn sibling_of(&self, child: OrderId) -> Option<OrderId> {
        if self.take_profit == Some(child) {
            self.stop_loss
        } else if self.stop_loss == Some(child) {
            self.take_profit
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Positions & Trades
// ---------------------------------------------------------------------------

/// A currently open (netted, per-symbol) position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Mark the position to the given price.
    pub fn update_pnl(&mut self, current_price: Decimal) {
        let price_diff = match self.side {
            Side::Buy => current_price - self.avg_entry_price,
            Side::Sell => self.avg_entry_price - current_price,
        };
        self.unrealized_pnl = price_diff * self.size;
    }
}

/// A completed round trip with realized PnL, for the reporting collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub commission: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
}

impl Trade {
    pub fn net_pnl(&self) -> Decimal {
        self.pnl - self.commission
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Snapshot of the account state.
///
/// Invariant: `margin_used <= equity` at all times. Placing an order
/// reserves `size * price / leverage`, never full notional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub cash: Decimal,
    pub equity: Decimal,
    pub margin_used: Decimal,
    pub leverage: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub high_water_mark: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl AccountState {
    pub fn new(initial_cash: Decimal, leverage: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            cash: initial_cash,
            equity: initial_cash,
            margin_used: Decimal::ZERO,
            leverage,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            high_water_mark: initial_cash,
            timestamp,
        }
    }

    /// Margin still available for new reservations.
    pub fn free_margin(&self) -> Decimal {
        self.cash - self.margin_used
    }

    pub fn current_drawdown(&self) -> Decimal {
        self.high_water_mark - self.equity
    }
}

// ---------------------------------------------------------------------------
// Strategy actions
// ---------------------------------------------------------------------------

/// What a strategy may ask the core to do on a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderAction {
    Submit(OrderRequest),
    Cancel(OrderId),
}
