use fxsim_core::{OrderKind, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A deterministic execution-cost preset: spread and slippage in price
/// units per (symbol, order kind).
///
/// Profiles are plain serde values so the same simulation can be re-run
/// under several cost assumptions and the outcomes compared side by side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostProfile {
    pub name: String,
    pub description: Option<String>,
    /// Full bid/ask spread in price units; half is charged per fill.
    pub default_spread: Decimal,
    /// Adverse slippage applied to market fills, in price units.
    pub market_slippage: Decimal,
    /// Adverse slippage applied to stop fills, in price units. Stops are
    /// the worst offenders in practice (5+ pips from the nominal price).
    pub stop_slippage: Decimal,
    /// Per-symbol spread overrides (wider crosses, exotics).
    #[serde(default)]
    pub spreads: BTreeMap<String, Decimal>,
}

impl CostProfile {
    /// Zero costs. Upper bound on what a strategy could ever earn.
    pub fn optimistic() -> Self {
        Self {
            name: "optimistic".to_string(),
            description: Some("No spread, no slippage".to_string()),
            default_spread: Decimal::ZERO,
            spreads: BTreeMap::new(),
            market_slippage: Decimal::ZERO,
            stop_slippage: Decimal::ZERO,
        }
    }

    /// Typical major-pair retail conditions.
    pub fn realistic() -> Self {
        Self {
            name: "realistic".to_string(),
            description: Some("Typical major-pair spread and modest slippage".to_string()),
            default_spread: dec!(0.00015),
            spreads: BTreeMap::new(),
            market_slippage: dec!(0.0001),
            stop_slippage: dec!(0.0002),
        }
    }

    /// Stressed conditions: wide spread, stop fills 5 pips off.
    pub fn conservative() -> Self {
        Self {
            name: "conservative".to_string(),
            description: Some("Wide spread and heavy stop slippage".to_string()),
            default_spread: dec!(0.0003),
            spreads: BTreeMap::new(),
            market_slippage: dec!(0.0002),
            stop_slippage: dec!(0.0005),
        }
    }

    /// All shipped presets, ready for a comparison run.
    pub fn presets() -> Vec<Self> {
        vec![Self::optimistic(), Self::realistic(), Self::conservative()]
    }

    /// Full spread for a symbol, honoring per-symbol overrides.
    pub fn spread_price(&self, symbol: &str) -> Decimal {
        self.spreads
            .get(symbol)
            .copied()
            .unwrap_or(self.default_spread)
    }

    /// Half the spread: the per-fill cost, always against the trader.
    pub fn half_spread(&self, symbol: &str) -> Decimal {
        self.spread_price(symbol) / dec!(2)
    }

    /// Adverse slippage for the given order kind, in price units. The side
    /// determines direction, not magnitude; the broker applies the sign.
    pub fn slippage_price(&self, kind: OrderKind, _side: Side) -> Decimal {
        match kind {
            OrderKind::Market => self.market_slippage,
            OrderKind::Stop => self.stop_slippage,
            // Limit fills are price-capped; no slippage past the limit.
            OrderKind::Limit => Decimal::ZERO,
        }
    }
}

/// Run the same closure under each profile and collect named outcomes.
/// This is the first-class comparison surface: one scenario, N cost
/// assumptions, side-by-side results.
pub fn compare<T, F>(profiles: &[CostProfile], mut run: F) -> Vec<(String, T)>
where
    F: FnMut(&CostProfile) -> T,
{
    profiles
        .iter()
        .map(|p| (p.name.clone(), run(p)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimistic_is_free() {
        let p = CostProfile::optimistic();
        assert_eq!(p.spread_price("EURUSD"), Decimal::ZERO);
        assert_eq!(
            p.slippage_price(OrderKind::Stop, Side::Sell),
            Decimal::ZERO
        );
    }

    #[test]
    fn per_symbol_spread_override() {
        let mut p = CostProfile::realistic();
        p.spreads.insert("GBPJPY".to_string(), dec!(0.03));
        assert_eq!(p.spread_price("GBPJPY"), dec!(0.03));
        assert_eq!(p.spread_price("EURUSD"), dec!(0.00015));
        assert_eq!(p.half_spread("GBPJPY"), dec!(0.015));
    }

    #[test]
    fn limit_orders_never_slip() {
        for p in CostProfile::presets() {
            assert_eq!(
                p.slippage_price(OrderKind::Limit, Side::Buy),
                Decimal::ZERO,
                "profile {}",
                p.name
            );
        }
    }

    #[test]
    fn stop_slippage_orders_presets() {
        let optimistic = CostProfile::optimistic();
        let realistic = CostProfile::realistic();
        let conservative = CostProfile::conservative();
        assert!(optimistic.stop_slippage < realistic.stop_slippage);
        assert!(realistic.stop_slippage < conservative.stop_slippage);
    }

    #[test]
    fn compare_runs_every_profile() {
        let outcomes = compare(&CostProfile::presets(), |p| {
            p.half_spread("EURUSD") + p.slippage_price(OrderKind::Market, Side::Buy)
        });
        let names: Vec<&str> = outcomes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["optimistic", "realistic", "conservative"]);
        assert!(outcomes[0].1 < outcomes[2].1);
    }

    #[test]
    fn profile_round_trips_through_toml() {
        let p = CostProfile::conservative();
        let text = toml::to_string(&p).unwrap();
        let back: CostProfile = toml::from_str(&text).unwrap();
        assert_eq!(p, back);
    }
}
