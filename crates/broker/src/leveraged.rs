use chrono::{DateTime, Utc};
use fxsim_core::*;
use fxsim_risk::CostProfile;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Configuration for the simulated leveraged broker.
#[derive(Debug, Clone)]
pub struct LeveragedBrokerConfig {
    pub initial_cash: Decimal,
    /// Notional / margin ratio (e.g. 100 for 100:1).
    pub leverage: Decimal,
    /// Commission as a flat fraction of notional, charged on every fill.
    pub commission_rate: Decimal,
    pub costs: CostProfile,
}

impl Default for LeveragedBrokerConfig {
    fn default() -> Self {
        Self {
            initial_cash: Decimal::new(100_000, 0),
            leverage: Decimal::new(100, 0),
            commission_rate: Decimal::new(2, 5), // 0.00002 of notional
            costs: CostProfile::realistic(),
        }
    }
}

/// Unrecoverable broker failures. Margin rejections are *not* here: they
/// are a recorded order outcome (`SubmitOutcome::Rejected`).
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("order not found: {0}")]
    OrderNotFound(OrderId),
    #[error("order {0} is already terminal")]
    OrderNotActive(OrderId),
    /// Market order on a symbol the broker has never seen a bar for; there
    /// is no reference price to fill or margin-check against.
    #[error("no market data seen yet for symbol {0}")]
    UnknownSymbol(String),
    /// A core invariant broke (both bracket children filled, margin over
    /// equity after close-out, ...). The run must abort.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// Result of submitting an order request. Rejections carry the id the
/// rejected order was recorded under in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(OrderId),
    Rejected {
        order_id: OrderId,
        reason: RejectReason,
    },
}

impl SubmitOutcome {
    pub fn order_id(&self) -> OrderId {
        match self {
            SubmitOutcome::Accepted(id) => *id,
            SubmitOutcome::Rejected { order_id, .. } => *order_id,
        }
    }
}

/// A simulated broker with leveraged margin accounting.
///
/// Fills pending orders against incoming synchronized ticks, owns the
/// order/trade ledger, and emits an `OrderEvent` for every state
/// transition. All internal collections are ordered so identical inputs
/// replay to identical ledgers.
pub struct LeveragedBroker {
    config: LeveragedBrokerConfig,
    account: AccountState,
    orders: BTreeMap<OrderId, Order>,
    /// Pending order ids in submission order; evaluation order on a tick.
    open_order_ids: Vec<OrderId>,
    brackets: BTreeMap<BracketId, BracketGroup>,
    positions: BTreeMap<String, Position>,
    trades: Vec<Trade>,
    /// Margin reserved per pending entry order.
    reservations: BTreeMap<OrderId, Decimal>,
    last_bars: BTreeMap<String, Bar>,
    events: Vec<OrderEvent>,
    next_order_id: u64,
    next_bracket_id: u64,
    next_trade_id: u64,
    /// Simulation clock: timestamp of the last applied tick.
    clock: DateTime<Utc>,
}

impl LeveragedBroker {
    pub fn new(config: LeveragedBrokerConfig) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let account = AccountState::new(config.initial_cash, config.leverage, epoch);
        Self {
            config,
            account,
            orders: BTreeMap::new(),
            open_order_ids: Vec::new(),
            brackets: BTreeMap::new(),
            positions: BTreeMap::new(),
            trades: Vec::new(),
            reservations: BTreeMap::new(),
            last_bars: BTreeMap::new(),
            events: Vec::new(),
            next_order_id: 1,
            next_bracket_id: 1,
            next_trade_id: 1,
            clock: epoch,
        }
    }

    pub fn account(&self) -> &AccountState {
        &self.account
    }

    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn bracket(&self, id: BracketId) -> Option<&BracketGroup> {
        self.brackets.get(&id)
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn trade_log(&self) -> &[Trade] {
        &self.trades
    }

    /// Drain accumulated order events, in the order they occurred.
    pub fn drain_events(&mut self) -> Vec<OrderEvent> {
        std::mem::take(&mut self.events)
    }

    fn alloc_order_id(&mut self) -> OrderId {
        let id = OrderId(self.next_order_id);
        self.next_order_id += 1;
        id
    }

    /// Submit an order request. A bracket entry (tp/sl prices set) also
    /// creates the two child orders; children stay unevaluable until the
    /// entry fills.
    pub fn submit(&mut self, req: OrderRequest) -> Result<SubmitOutcome, BrokerError> {
        let id = self.alloc_order_id();
        let mut order = Order {
            id,
            symbol: req.symbol.clone(),
            side: req.side,
            kind: req.kind,
            price: req.price,
            size: req.size,
            status: OrderStatus::Pending,
            role: BracketRole::Entry,
            bracket: None,
            fill: None,
            reject_reason: None,
            created_at: self.clock,
            updated_at: self.clock,
        };

        if req.size <= Decimal::ZERO {
            return Ok(self.reject(order, RejectReason::NonPositiveSize));
        }
        if matches!(req.kind, OrderKind::Limit | OrderKind::Stop) && req.price.is_none() {
            return Ok(self.reject(order, RejectReason::MissingPrice));
        }

        // Reference price for the margin check: the order's own price, or
        // the last seen close for market orders.
        let reference_price = match req.price {
            Some(p) => p,
            None => {
                self.last_bars
                    .get(&req.symbol)
                    .ok_or_else(|| BrokerError::UnknownSymbol(req.symbol.clone()))?
                    .close
            }
        };

        // Margin check up front: reserve notional / leverage, never the
        // full notional, and never massage cash to pass.
        let required_margin = req.size * reference_price / self.config.leverage;
        if required_margin > self.account.free_margin() {
            debug!(
                order_id = %id,
                %required_margin,
                free_margin = %self.account.free_margin(),
                "order rejected for margin"
            );
            return Ok(self.reject(order, RejectReason::Margin));
        }

        let is_bracket = req.tp_price.is_some() || req.sl_price.is_some();
        let bracket_id = if is_bracket {
            let bracket_id = BracketId(self.next_bracket_id);
            self.next_bracket_id += 1;
            order.bracket = Some(bracket_id);
            Some(bracket_id)
        } else {
            None
        };

        self.reservations.insert(id, required_margin);
        self.events.push(OrderEvent::Submitted(order.clone()));
        self.orders.insert(id, order);
        self.open_order_ids.push(id);

        if let Some(bracket_id) = bracket_id {
            // Children close the entry, so they are on the opposite side.
            // The stop-loss is created (and thus evaluated) before the
            // take-profit: on a bar that touches both, the loss wins.
            let child_side = req.side.opposite();
            let sl = req.sl_price.map(|price| {
                self.make_child(
                    &req,
                    child_side,
                    OrderKind::Stop,
                    price,
                    BracketRole::StopLoss,
                    bracket_id,
                )
            });
            let tp = req.tp_price.map(|price| {
                self.make_child(
                    &req,
                    child_side,
                    OrderKind::Limit,
                    price,
                    BracketRole::TakeProfit,
                    bracket_id,
                )
            });

            self.brackets.insert(
                bracket_id,
                BracketGroup {
                    id: bracket_id,
                    entry: id,
                    take_profit: tp,
                    stop_loss: sl,
                },
            );
        }
        self.refresh_account()?;

        // Market orders fill against the last seen bar immediately.
        if req.kind == OrderKind::Market {
            let bar = self
                .last_bars
                .get(&req.symbol)
                .cloned()
                .ok_or_else(|| BrokerError::UnknownSymbol(req.symbol.clone()))?;
            self.fill_market(id, &bar)?;
        }

        Ok(SubmitOutcome::Accepted(id))
    }

    fn make_child(
        &mut self,
        req: &OrderRequest,
        side: Side,
        kind: OrderKind,
        price: Decimal,
        role: BracketRole,
        bracket_id: BracketId,
    ) -> OrderId {
        let id = self.alloc_order_id();
        let child = Order {
            id,
            symbol: req.symbol.clone(),
            side,
            kind,
            price: Some(price),
            size: req.size,
            status: OrderStatus::Pending,
            role,
            bracket: Some(bracket_id),
            fill: None,
            reject_reason: None,
            created_at: self.clock,
            updated_at: self.clock,
        };
        self.events.push(OrderEvent::Submitted(child.clone()));
        self.orders.insert(id, child);
        self.open_order_ids.push(id);
        id
    }

    fn reject(&mut self, mut order: Order, reason: RejectReason) -> SubmitOutcome {
        let id = order.id;
        order.status = OrderStatus::Rejected;
        order.reject_reason = Some(reason.clone());
        order.updated_at = self.clock;
        self.events.push(OrderEvent::Submitted(order.clone()));
        self.events.push(OrderEvent::Rejected {
            order_id: id,
            reason: reason.clone(),
        });
        self.orders.insert(id, order);
        SubmitOutcome::Rejected {
            order_id: id,
            reason,
        }
    }

    /// Cancel a pending order. Cancelling a bracket entry cancels its
    /// children as well.
    pub fn cancel(&mut self, id: OrderId, reason: &str) -> Result<(), BrokerError> {
        let order = self
            .orders
            .get(&id)
            .ok_or(BrokerError::OrderNotFound(id))?;
        if !order.is_active() {
            return Err(BrokerError::OrderNotActive(id));
        }
        let bracket = order.bracket;
        let role = order.role;

        self.mark_cancelled(id, reason);

        if role == BracketRole::Entry {
            if let Some(group) = bracket.and_then(|b| self.brackets.get(&b)).cloned() {
                for child in [group.stop_loss, group.take_profit].into_iter().flatten() {
                    if self.orders.get(&child).is_some_and(|o| o.is_active()) {
                        self.mark_cancelled(child, "entry cancelled");
                    }
                }
            }
        }
        self.refresh_account()
    }

    fn mark_cancelled(&mut self, id: OrderId, reason: &str) {
        if let Some(order) = self.orders.get_mut(&id) {
            order.status = OrderStatus::Cancelled;
            order.updated_at = self.clock;
        }
        self.open_order_ids.retain(|o| *o != id);
        self.reservations.remove(&id);
        self.events.push(OrderEvent::Cancelled {
            order_id: id,
            reason: reason.to_string(),
        });
    }

    /// Advance all open orders against a synchronized tick and mark
    /// positions to the new closes.
    pub fn apply_tick(&mut self, tick: &SynchronizedTick) -> Result<(), BrokerError> {
        self.clock = tick.timestamp;
        for (symbol, bar) in &tick.bars {
            self.last_bars.insert(symbol.clone(), bar.clone());
            if let Some(pos) = self.positions.get_mut(symbol) {
                pos.update_pnl(bar.close);
            }
        }
        self.refresh_account()?;

        // Snapshot ids up front: fills mutate the open list (sibling
        // cancellation), and orders submitted mid-tick by fills must not be
        // evaluated against the bar that created them.
        let candidates: Vec<OrderId> = self.open_order_ids.clone();
        for id in candidates {
            let order = match self.orders.get(&id) {
                Some(o) if o.is_active() => o.clone(),
                _ => continue,
            };
            let Some(bar) = tick.bars.get(&order.symbol).cloned() else {
                continue;
            };
            if !self.evaluable(&order, tick.timestamp) {
                continue;
            }

            match order.kind {
                OrderKind::Market => self.fill_market(id, &bar)?,
                OrderKind::Limit => self.try_fill_limit(&order, &bar)?,
                OrderKind::Stop => self.try_fill_stop(&order, &bar)?,
            }
        }

        self.refresh_account()?;
        self.enforce_margin()?;
        Ok(())
    }

    /// Bracket children are dormant until the tick *after* their entry
    /// filled; entry and exit never share a bar.
    fn evaluable(&self, order: &Order, now: DateTime<Utc>) -> bool {
        if order.role == BracketRole::Entry {
            return true;
        }
        let Some(group) = order.bracket.and_then(|b| self.brackets.get(&b)) else {
            return false;
        };
        match self.orders.get(&group.entry) {
            Some(entry) if entry.status == OrderStatus::Filled => entry
                .fill
                .as_ref()
                .map(|f| f.timestamp < now)
                .unwrap_or(false),
            _ => false,
        }
    }

    fn fill_market(&mut self, id: OrderId, bar: &Bar) -> Result<(), BrokerError> {
        let order = self
            .orders
            .get(&id)
            .ok_or(BrokerError::OrderNotFound(id))?
            .clone();
        let half_spread = self.config.costs.half_spread(&order.symbol);
        let slippage = self
            .config
            .costs
            .slippage_price(OrderKind::Market, order.side);
        let adverse = half_spread + slippage;
        let execution_price = match order.side {
            Side::Buy => bar.close + adverse,
            Side::Sell => bar.close - adverse,
        };
        self.fill(id, execution_price, half_spread, slippage)
    }

    /// Limit fill rule: the bar's [low, high] range must include the limit
    /// price; a gap through the limit does not fill. Execution is the limit
    /// price worsened by half the spread, never better than the limit.
    fn try_fill_limit(&mut self, order: &Order, bar: &Bar) -> Result<(), BrokerError> {
        let limit = order
            .price
            .ok_or_else(|| BrokerError::InvariantViolation("limit order without price".into()))?;
        if !bar.touches(limit) {
            return Ok(());
        }
        let half_spread = self.config.costs.half_spread(&order.symbol);
        let execution_price = match order.side {
            Side::Buy => limit + half_spread,
            Side::Sell => limit - half_spread,
        };
        self.fill(order.id, execution_price, half_spread, Decimal::ZERO)
    }

    /// Stop fill rule: triggered when the bar trades through the stop, and
    /// filled at the *worst* price touched within the bar (buy: high,
    /// sell: low) with slippage added further against the trader.
    fn try_fill_stop(&mut self, order: &Order, bar: &Bar) -> Result<(), BrokerError> {
        let stop = order
            .price
            .ok_or_else(|| BrokerError::InvariantViolation("stop order without price".into()))?;
        let slippage = self.config.costs.slippage_price(OrderKind::Stop, order.side);
        let execution_price = match order.side {
            Side::Buy => {
                if bar.high < stop {
                    return Ok(());
                }
                bar.high + slippage
            }
            Side::Sell => {
                if bar.low > stop {
                    return Ok(());
                }
                bar.low - slippage
            }
        };
        self.fill(order.id, execution_price, Decimal::ZERO, slippage)
    }

    fn fill(
        &mut self,
        id: OrderId,
        execution_price: Decimal,
        spread_cost: Decimal,
        slippage_cost: Decimal,
    ) -> Result<(), BrokerError> {
        let order = self
            .orders
            .get_mut(&id)
            .ok_or(BrokerError::OrderNotFound(id))?;
        if order.status != OrderStatus::Pending {
            return Err(BrokerError::InvariantViolation(format!(
                "fill on non-pending order {id}"
            )));
        }
        let commission =
            (execution_price * order.size * self.config.commission_rate).abs();
        let report = FillReport {
            execution_price,
            spread_cost,
            slippage_cost,
            commission,
            timestamp: self.clock,
        };
        order.status = OrderStatus::Filled;
        order.fill = Some(report.clone());
        order.updated_at = self.clock;
        let order = order.clone();

        self.open_order_ids.retain(|o| *o != id);
        self.reservations.remove(&id);
        self.events.push(OrderEvent::Filled {
            order_id: id,
            fill: report.clone(),
        });
        debug!(order_id = %id, price = %execution_price, "order filled");

        self.apply_to_position(&order, &report);
        self.account.cash -= commission;

        // Bracket exclusivity: the sibling dies in this same step, so there
        // is no tick boundary where both children are live after one fills.
        if order.role != BracketRole::Entry {
            let group = order
                .bracket
                .and_then(|b| self.brackets.get(&b))
                .cloned()
                .ok_or_else(|| {
                    BrokerError::InvariantViolation(format!("bracket child {id} without group"))
                })?;
            if let Some(sibling) = group.sibling_of(id) {
                match self.orders.get(&sibling).map(|o| o.status) {
                    Some(OrderStatus::Filled) => {
                        return Err(BrokerError::InvariantViolation(format!(
                            "both children of bracket {:?} filled",
                            group.id
                        )));
                    }
                    Some(OrderStatus::Pending) => {
                        self.mark_cancelled(sibling, "sibling filled");
                    }
                    _ => {}
                }
            }
        }

        self.refresh_account()
    }

    /// Netting position update, realizing PnL on reductions.
    fn apply_to_position(&mut self, order: &Order, fill: &FillReport) {
        let price = fill.execution_price;
        match self.positions.get_mut(&order.symbol) {
            Some(pos) if pos.side != order.side => {
                let close_qty = order.size.min(pos.size);
                let remaining = order.size - close_qty;

                let price_diff = match pos.side {
                    Side::Buy => price - pos.avg_entry_price,
                    Side::Sell => pos.avg_entry_price - price,
                };
                let pnl = price_diff * close_qty;
                self.trades.push(Trade {
                    id: self.next_trade_id,
                    symbol: order.symbol.clone(),
                    side: pos.side,
                    size: close_qty,
                    entry_price: pos.avg_entry_price,
                    exit_price: price,
                    pnl,
                    commission: fill.commission,
                    entry_time: pos.opened_at,
                    exit_time: fill.timestamp,
                });
                self.next_trade_id += 1;

                self.account.cash += pnl;
                self.account.realized_pnl += pnl;

                if close_qty >= pos.size {
                    self.positions.remove(&order.symbol);
                } else {
                    pos.size -= close_qty;
                    pos.update_pnl(price);
                }

                if remaining > Decimal::ZERO {
                    self.positions.insert(
                        order.symbol.clone(),
                        Position {
                            symbol: order.symbol.clone(),
                            side: order.side,
                            size: remaining,
                            avg_entry_price: price,
                            unrealized_pnl: Decimal::ZERO,
                            opened_at: fill.timestamp,
                        },
                    );
                }
            }
            Some(pos) => {
                let total_cost = pos.avg_entry_price * pos.size + price * order.size;
                pos.size += order.size;
                pos.avg_entry_price = total_cost / pos.size;
                pos.update_pnl(price);
            }
            None => {
                self.positions.insert(
                    order.symbol.clone(),
                    Position {
                        symbol: order.symbol.clone(),
                        side: order.side,
                        size: order.size,
                        avg_entry_price: price,
                        unrealized_pnl: Decimal::ZERO,
                        opened_at: fill.timestamp,
                    },
                );
            }
        }
    }

    /// Recompute derived account figures: margin in use (pending entry
    /// reservations plus open-position margin), unrealized PnL, equity.
    fn refresh_account(&mut self) -> Result<(), BrokerError> {
        let reserved: Decimal = self.reservations.values().copied().sum();
        let position_margin: Decimal = self
            .positions
            .values()
            .map(|p| p.avg_entry_price * p.size / self.config.leverage)
            .sum();
        let unrealized: Decimal = self.positions.values().map(|p| p.unrealized_pnl).sum();

        self.account.margin_used = reserved + position_margin;
        self.account.unrealized_pnl = unrealized;
        self.account.equity = self.account.cash + unrealized;
        self.account.timestamp = self.clock;
        if self.account.equity > self.account.high_water_mark {
            self.account.high_water_mark = self.account.equity;
        }
        Ok(())
    }

    /// Close-out: if adverse marks push used margin above equity, flatten
    /// everything at the current close and cancel all working orders. This
    /// keeps `margin_used <= equity` true at every tick boundary.
    fn enforce_margin(&mut self) -> Result<(), BrokerError> {
        if self.account.margin_used <= self.account.equity {
            return Ok(());
        }
        warn!(
            margin_used = %self.account.margin_used,
            equity = %self.account.equity,
            "margin exceeded equity; closing out"
        );

        for id in self.open_order_ids.clone() {
            self.mark_cancelled(id, "margin close-out");
        }
        let symbols: Vec<String> = self.positions.keys().cloned().collect();
        for symbol in symbols {
            let Some(pos) = self.positions.get(&symbol).cloned() else {
                continue;
            };
            let Some(bar) = self.last_bars.get(&symbol).cloned() else {
                continue;
            };
            let id = self.alloc_order_id();
            let order = Order {
                id,
                symbol: symbol.clone(),
                side: pos.side.opposite(),
                kind: OrderKind::Market,
                price: None,
                size: pos.size,
                status: OrderStatus::Pending,
                role: BracketRole::Entry,
                bracket: None,
                fill: None,
                reject_reason: None,
                created_at: self.clock,
                updated_at: self.clock,
            };
            self.events.push(OrderEvent::Submitted(order.clone()));
            self.orders.insert(id, order);
            self.fill_market(id, &bar)?;
        }

        self.refresh_account()?;
        if self.account.margin_used > self.account.equity {
            return Err(BrokerError::InvariantViolation(format!(
                "margin {} still exceeds equity {} after close-out",
                self.account.margin_used, self.account.equity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn bar(symbol: &str, epoch: i64, low: Decimal, high: Decimal, close: Decimal) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timestamp: Utc.timestamp_opt(epoch, 0).unwrap(),
            open: close,
            high,
            low,
            close,
            volume: dec!(1000),
        }
    }

    fn tick(bars: Vec<Bar>) -> SynchronizedTick {
        let ts = bars[0].timestamp;
        SynchronizedTick::new(ts, bars)
    }

    fn free_broker() -> LeveragedBroker {
        LeveragedBroker::new(LeveragedBrokerConfig {
            initial_cash: dec!(100000),
            leverage: dec!(100),
            commission_rate: Decimal::ZERO,
            costs: CostProfile::optimistic(),
        })
    }

    #[test]
    fn limit_fills_only_when_bar_touches() {
        let mut broker = free_broker();
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_000, dec!(1.25), dec!(1.26), dec!(1.255))]))
            .unwrap();

        let outcome = broker
            .submit(OrderRequest::limit("EURUSD", Side::Buy, dec!(1000), dec!(1.2500)))
            .unwrap();
        let SubmitOutcome::Accepted(id) = outcome else {
            panic!("expected acceptance");
        };

        // Gapped over the limit: stays pending.
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_060, dec!(1.2550), dec!(1.2600), dec!(1.258))]))
            .unwrap();
        assert_eq!(broker.order(id).unwrap().status, OrderStatus::Pending);

        // Range includes the limit: fills at the limit price (no costs).
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_120, dec!(1.2490), dec!(1.2510), dec!(1.25))]))
            .unwrap();
        let order = broker.order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.fill.as_ref().unwrap().execution_price, dec!(1.2500));
    }

    #[test]
    fn limit_fill_pays_half_spread_against_trader() {
        let mut broker = LeveragedBroker::new(LeveragedBrokerConfig {
            initial_cash: dec!(100000),
            leverage: dec!(100),
            commission_rate: Decimal::ZERO,
            costs: CostProfile::realistic(), // spread 0.00015
        });
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_000, dec!(1.25), dec!(1.26), dec!(1.255))]))
            .unwrap();
        let id = broker
            .submit(OrderRequest::limit("EURUSD", Side::Buy, dec!(1000), dec!(1.2500)))
            .unwrap()
            .order_id();
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_060, dec!(1.2490), dec!(1.2510), dec!(1.25))]))
            .unwrap();
        let fill = broker.order(id).unwrap().fill.clone().unwrap();
        // Worse than the limit for a buyer, never better.
        assert_eq!(fill.execution_price, dec!(1.250075));
        assert_eq!(fill.spread_cost, dec!(0.000075));
        assert_eq!(fill.slippage_cost, Decimal::ZERO);
    }

    #[test]
    fn stop_fills_at_worst_of_bar_plus_slippage() {
        let mut broker = LeveragedBroker::new(LeveragedBrokerConfig {
            initial_cash: dec!(100000),
            leverage: dec!(100),
            commission_rate: Decimal::ZERO,
            costs: CostProfile::conservative(), // stop slippage 0.0005
        });
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_000, dec!(1.10), dec!(1.11), dec!(1.105))]))
            .unwrap();
        // Sell stop below the market, e.g. protecting a long.
        let id = broker
            .submit(OrderRequest::stop("EURUSD", Side::Sell, dec!(1000), dec!(1.1000)))
            .unwrap()
            .order_id();
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_060, dec!(1.0950), dec!(1.1050), dec!(1.098))]))
            .unwrap();
        let fill = broker.order(id).unwrap().fill.clone().unwrap();
        // Worst touched price is the low, slippage pushes it lower still.
        assert_eq!(fill.execution_price, dec!(1.0945));
        assert!(fill.execution_price < dec!(1.1000));
    }

    #[test]
    fn margin_reserved_is_notional_over_leverage() {
        // Equity 100k, leverage 100: a 500k notional at price 1.0 needs
        // 5k margin and passes; a follow-up needing 96k on top fails.
        let mut broker = free_broker();
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_000, dec!(0.99), dec!(1.01), dec!(1.0))]))
            .unwrap();

        let first = broker
            .submit(OrderRequest::market("EURUSD", Side::Buy, dec!(500000)))
            .unwrap();
        assert!(matches!(first, SubmitOutcome::Accepted(_)));
        assert_eq!(broker.account().margin_used, dec!(5000));

        let second = broker
            .submit(OrderRequest::limit("EURUSD", Side::Buy, dec!(9600000), dec!(1.0)))
            .unwrap();
        match second {
            SubmitOutcome::Rejected { reason, order_id } => {
                assert_eq!(reason, RejectReason::Margin);
                assert_eq!(broker.order(order_id).unwrap().status, OrderStatus::Rejected);
            }
            other => panic!("expected margin rejection, got {other:?}"),
        }
    }

    #[test]
    fn bracket_exit_cancels_sibling_in_same_step() {
        let mut broker = free_broker();
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_000, dec!(1.0990), dec!(1.1010), dec!(1.1000))]))
            .unwrap();

        let entry = broker
            .submit(
                OrderRequest::market("EURUSD", Side::Buy, dec!(1000))
                    .with_bracket(dec!(1.1050), dec!(1.0950)),
            )
            .unwrap()
            .order_id();
        assert_eq!(broker.order(entry).unwrap().status, OrderStatus::Filled);

        let group = broker.bracket(broker.order(entry).unwrap().bracket.unwrap()).unwrap().clone();
        let tp = group.take_profit.unwrap();
        let sl = group.stop_loss.unwrap();

        // TP touched, SL untouched.
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_060, dec!(1.1020), dec!(1.1060), dec!(1.1055))]))
            .unwrap();

        assert_eq!(broker.order(tp).unwrap().status, OrderStatus::Filled);
        assert_eq!(broker.order(sl).unwrap().status, OrderStatus::Cancelled);
        // Position closed, a trade recorded.
        assert!(broker.position("EURUSD").is_none());
        assert_eq!(broker.trade_log().len(), 1);
        assert_eq!(broker.trade_log()[0].exit_price, dec!(1.1050));
    }

    #[test]
    fn bracket_children_wait_for_entry_fill() {
        let mut broker = free_broker();
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_000, dec!(1.0990), dec!(1.1010), dec!(1.1000))]))
            .unwrap();

        // Buy limit well below the market; TP/SL prices would both be
        // touched by the next bar, but must not fill while the entry is
        // pending.
        let entry = broker
            .submit(
                OrderRequest::limit("EURUSD", Side::Buy, dec!(1000), dec!(1.0900))
                    .with_bracket(dec!(1.1005), dec!(1.0995)),
            )
            .unwrap()
            .order_id();

        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_060, dec!(1.0990), dec!(1.1010), dec!(1.1000))]))
            .unwrap();

        let group = broker.bracket(broker.order(entry).unwrap().bracket.unwrap()).unwrap().clone();
        assert_eq!(broker.order(entry).unwrap().status, OrderStatus::Pending);
        assert_eq!(
            broker.order(group.take_profit.unwrap()).unwrap().status,
            OrderStatus::Pending
        );
        assert_eq!(
            broker.order(group.stop_loss.unwrap()).unwrap().status,
            OrderStatus::Pending
        );
    }

    #[test]
    fn ambiguous_bar_resolves_to_stop_loss() {
        let mut broker = free_broker();
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_000, dec!(1.0990), dec!(1.1010), dec!(1.1000))]))
            .unwrap();
        let entry = broker
            .submit(
                OrderRequest::market("EURUSD", Side::Buy, dec!(1000))
                    .with_bracket(dec!(1.1050), dec!(1.0950)),
            )
            .unwrap()
            .order_id();

        // One wide bar touches both children; the pessimistic rule books
        // the loss.
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_060, dec!(1.0900), dec!(1.1100), dec!(1.1000))]))
            .unwrap();

        let group = broker.bracket(broker.order(entry).unwrap().bracket.unwrap()).unwrap().clone();
        assert_eq!(
            broker.order(group.stop_loss.unwrap()).unwrap().status,
            OrderStatus::Filled
        );
        assert_eq!(
            broker.order(group.take_profit.unwrap()).unwrap().status,
            OrderStatus::Cancelled
        );
    }

    #[test]
    fn commission_charged_on_notional() {
        let mut broker = LeveragedBroker::new(LeveragedBrokerConfig {
            initial_cash: dec!(100000),
            leverage: dec!(100),
            commission_rate: dec!(0.0001),
            costs: CostProfile::optimistic(),
        });
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_000, dec!(0.99), dec!(1.01), dec!(1.0))]))
            .unwrap();
        let id = broker
            .submit(OrderRequest::market("EURUSD", Side::Buy, dec!(10000)))
            .unwrap()
            .order_id();
        let fill = broker.order(id).unwrap().fill.clone().unwrap();
        assert_eq!(fill.commission, dec!(1.00000)); // 10000 * 1.0 * 0.0001
        assert_eq!(broker.account().cash, dec!(99999.00000));
    }

    #[test]
    fn cancelling_entry_cancels_children() {
        let mut broker = free_broker();
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_000, dec!(1.0990), dec!(1.1010), dec!(1.1000))]))
            .unwrap();
        let entry = broker
            .submit(
                OrderRequest::limit("EURUSD", Side::Buy, dec!(1000), dec!(1.0900))
                    .with_bracket(dec!(1.1000), dec!(1.0800)),
            )
            .unwrap()
            .order_id();
        broker.cancel(entry, "caller cancel").unwrap();

        let group = broker.bracket(broker.order(entry).unwrap().bracket.unwrap()).unwrap().clone();
        for id in [entry, group.take_profit.unwrap(), group.stop_loss.unwrap()] {
            assert_eq!(broker.order(id).unwrap().status, OrderStatus::Cancelled);
        }
        assert_eq!(broker.account().margin_used, Decimal::ZERO);
    }

    #[test]
    fn margin_released_when_position_closes() {
        let mut broker = free_broker();
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_000, dec!(0.99), dec!(1.01), dec!(1.0))]))
            .unwrap();
        broker
            .submit(
                OrderRequest::market("EURUSD", Side::Buy, dec!(100000))
                    .with_bracket(dec!(1.0100), dec!(0.9900)),
            )
            .unwrap();
        assert_eq!(broker.account().margin_used, dec!(1000));

        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_060, dec!(1.0050), dec!(1.0150), dec!(1.0120))]))
            .unwrap();
        assert!(broker.position("EURUSD").is_none());
        assert_eq!(broker.account().margin_used, Decimal::ZERO);
        assert!(broker.account().margin_used <= broker.account().equity);
    }

    #[test]
    fn adverse_marks_trigger_margin_close_out() {
        let mut broker = free_broker();
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_000, dec!(0.99), dec!(1.01), dec!(1.0))]))
            .unwrap();

        // 9M notional at 100x reserves 90k of the 100k cash.
        broker
            .submit(OrderRequest::market("EURUSD", Side::Buy, dec!(9000000)))
            .unwrap();
        assert_eq!(broker.account().margin_used, dec!(90000));
        let working = broker
            .submit(OrderRequest::limit("EURUSD", Side::Buy, dec!(1000), dec!(0.95)))
            .unwrap()
            .order_id();

        // Adverse close: equity 86.5k drops below the 90k in use.
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_060, dec!(0.9980), dec!(1.0005), dec!(0.9985))]))
            .unwrap();

        assert!(broker.position("EURUSD").is_none());
        assert_eq!(broker.order(working).unwrap().status, OrderStatus::Cancelled);
        assert_eq!(broker.account().margin_used, Decimal::ZERO);
        assert_eq!(broker.account().equity, dec!(86500));
        assert!(broker.account().margin_used <= broker.account().equity);
        assert_eq!(broker.trade_log().len(), 1);
        assert_eq!(broker.trade_log()[0].pnl, dec!(-13500));
    }

    #[test]
    fn events_cover_every_transition() {
        let mut broker = free_broker();
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_000, dec!(1.0990), dec!(1.1010), dec!(1.1000))]))
            .unwrap();
        broker
            .submit(
                OrderRequest::market("EURUSD", Side::Buy, dec!(1000))
                    .with_bracket(dec!(1.1050), dec!(1.0950)),
            )
            .unwrap();
        broker
            .apply_tick(&tick(vec![bar("EURUSD", 1_700_000_060, dec!(1.1020), dec!(1.1060), dec!(1.1055))]))
            .unwrap();

        let events = broker.drain_events();
        let submitted = events
            .iter()
            .filter(|e| matches!(e, OrderEvent::Submitted(_)))
            .count();
        let filled = events
            .iter()
            .filter(|e| matches!(e, OrderEvent::Filled { .. }))
            .count();
        let cancelled = events
            .iter()
            .filter(|e| matches!(e, OrderEvent::Cancelled { .. }))
            .count();
        assert_eq!(submitted, 3); // entry + two children
        assert_eq!(filled, 2); // entry + take-profit
        assert_eq!(cancelled, 1); // stop-loss
        assert!(broker.drain_events().is_empty());
    }
}
