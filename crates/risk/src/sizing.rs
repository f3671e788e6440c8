use crate::costs::CostProfile;
use fxsim_core::{OrderKind, Side};
use rust_decimal::Decimal;
use tracing::debug;

/// The capital figure a risk fraction is applied to.
///
/// This is an explicit, caller-supplied choice because the two variants
/// produce materially different growth curves: `FixedInitial` risks the
/// same absolute amount every trade (linear growth), `CurrentEquity`
/// compounds. The documented default for live use is `FixedInitial`;
/// compounding is opt-in, never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskCapitalBasis {
    FixedInitial(Decimal),
    CurrentEquity(Decimal),
}

impl RiskCapitalBasis {
    pub fn amount(&self) -> Decimal {
        match self {
            RiskCapitalBasis::FixedInitial(v) => *v,
            RiskCapitalBasis::CurrentEquity(v) => *v,
        }
    }
}

/// Outcome of sizing. `Untradeable` means the inputs admit no defensible
/// size (zero adjusted stop distance, or no margin headroom); it is not an
/// error and must not be silently replaced with a default size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    Units(Decimal),
    Untradeable,
}

/// Contract violations. Unlike `Size::Untradeable`, these indicate a bug
/// in the caller.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SizingError {
    #[error("raw stop distance must be positive, got {0}")]
    NonPositiveStop(Decimal),
    #[error("risk fraction must be positive, got {0}")]
    NonPositiveRiskFraction(Decimal),
    #[error("price must be positive, got {0}")]
    NonPositivePrice(Decimal),
}

/// Size an order from a risk budget and a stop distance, bounded by
/// available margin.
///
/// `risk_amount = basis * risk_fraction`; the stop distance is widened by
/// the cost model's stop slippage before dividing, so the budget covers the
/// realistic worst-case exit, not the nominal one. The result is floored to
/// whole units and clamped to `free_margin * leverage / price`.
pub fn position_size(
    basis: RiskCapitalBasis,
    risk_fraction: Decimal,
    raw_stop_distance: Decimal,
    stop_side: Side,
    costs: &CostProfile,
    leverage: Decimal,
    price: Decimal,
    free_margin: Decimal,
) -> Result<Size, SizingError> {
    if raw_stop_distance <= Decimal::ZERO {
        return Err(SizingError::NonPositiveStop(raw_stop_distance));
    }
    if risk_fraction <= Decimal::ZERO {
        return Err(SizingError::NonPositiveRiskFraction(risk_fraction));
    }
    if price <= Decimal::ZERO {
        return Err(SizingError::NonPositivePrice(price));
    }

    let risk_amount = basis.amount() * risk_fraction;
    // Cost profiles are plain deserializable values, so a negative slippage
    // override can cancel the whole stop distance. No defensible size then.
    let adjusted_stop = raw_stop_distance + costs.slippage_price(OrderKind::Stop, stop_side);
    if adjusted_stop <= Decimal::ZERO {
        return Ok(Size::Untradeable);
    }
    let risk_size = (risk_amount / adjusted_stop).floor();
    let margin_cap = (free_margin * leverage / price).floor();
    let size = risk_size.min(margin_cap);

    debug!(
        %risk_amount,
        %adjusted_stop,
        %risk_size,
        %margin_cap,
        "position sized"
    );

    if size <= Decimal::ZERO {
        Ok(Size::Untradeable)
    } else {
        Ok(Size::Units(size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn risk_budget_divided_by_adjusted_stop() {
        // 100k * 1% = 1000 at risk; stop 0.0050 + 0.0005 slippage = 0.0055.
        let size = position_size(
            RiskCapitalBasis::FixedInitial(dec!(100000)),
            dec!(0.01),
            dec!(0.0050),
            Side::Sell,
            &CostProfile::conservative(),
            dec!(100),
            dec!(1.1000),
            dec!(100000),
        )
        .unwrap();
        assert_eq!(size, Size::Units(dec!(181818))); // floor(1000 / 0.0055)
    }

    #[test]
    fn margin_cap_clamps_size() {
        // Risk budget alone would allow 200k units, but only 1000 of free
        // margin at 100x and price 1.0 caps notional at 100k units.
        let size = position_size(
            RiskCapitalBasis::FixedInitial(dec!(100000)),
            dec!(0.01),
            dec!(0.0050),
            Side::Sell,
            &CostProfile::optimistic(),
            dec!(100),
            dec!(1.0),
            dec!(1000),
        )
        .unwrap();
        assert_eq!(size, Size::Units(dec!(100000)));
    }

    #[test]
    fn fixed_vs_equity_basis_differ() {
        let costs = CostProfile::optimistic();
        let fixed = position_size(
            RiskCapitalBasis::FixedInitial(dec!(100000)),
            dec!(0.01),
            dec!(0.01),
            Side::Sell,
            &costs,
            dec!(100),
            dec!(1.0),
            dec!(1000000),
        )
        .unwrap();
        let compounded = position_size(
            RiskCapitalBasis::CurrentEquity(dec!(150000)),
            dec!(0.01),
            dec!(0.01),
            Side::Sell,
            &costs,
            dec!(100),
            dec!(1.0),
            dec!(1000000),
        )
        .unwrap();
        assert_eq!(fixed, Size::Units(dec!(100000)));
        assert_eq!(compounded, Size::Units(dec!(150000)));
    }

    #[test]
    fn non_positive_stop_is_a_contract_violation() {
        let err = position_size(
            RiskCapitalBasis::FixedInitial(dec!(100000)),
            dec!(0.01),
            dec!(0),
            Side::Sell,
            &CostProfile::realistic(),
            dec!(100),
            dec!(1.0),
            dec!(100000),
        )
        .unwrap_err();
        assert_eq!(err, SizingError::NonPositiveStop(dec!(0)));
    }

    #[test]
    fn negative_slippage_cancelling_stop_is_untradeable() {
        let mut costs = CostProfile::optimistic();
        costs.stop_slippage = dec!(-0.0050);
        let size = position_size(
            RiskCapitalBasis::FixedInitial(dec!(100000)),
            dec!(0.01),
            dec!(0.0050),
            Side::Sell,
            &costs,
            dec!(100),
            dec!(1.0),
            dec!(100000),
        )
        .unwrap();
        assert_eq!(size, Size::Untradeable);
    }

    #[test]
    fn no_free_margin_means_untradeable() {
        let size = position_size(
            RiskCapitalBasis::FixedInitial(dec!(100000)),
            dec!(0.01),
            dec!(0.0050),
            Side::Sell,
            &CostProfile::realistic(),
            dec!(100),
            dec!(1.0),
            Decimal::ZERO,
        )
        .unwrap();
        assert_eq!(size, Size::Untradeable);
    }
}
