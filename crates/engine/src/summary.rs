use fxsim_core::{AccountState, RunId, Trade};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Aggregate outcome of one run, for the caller. Detailed history lives in
/// the event ledger; this is the at-a-glance view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub ticks_processed: u64,
    pub initial_cash: Decimal,
    pub final_equity: Decimal,
    pub net_profit: Decimal,
    pub total_commission: Decimal,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub max_drawdown: Decimal,
}

pub(crate) fn summarize(
    run_id: RunId,
    initial_cash: Decimal,
    account: &AccountState,
    trades: &[Trade],
    ticks_processed: u64,
    max_drawdown: Decimal,
) -> RunSummary {
    let winning_trades = trades.iter().filter(|t| t.net_pnl() > Decimal::ZERO).count();
    let losing_trades = trades.iter().filter(|t| t.net_pnl() < Decimal::ZERO).count();
    let total_commission = trades.iter().map(|t| t.commission).sum();

    RunSummary {
        run_id,
        ticks_processed,
        initial_cash,
        final_equity: account.equity,
        net_profit: account.equity - initial_cash,
        total_commission,
        total_trades: trades.len(),
        winning_trades,
        losing_trades,
        max_drawdown,
    }
}
