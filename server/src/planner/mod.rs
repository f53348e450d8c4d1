//! Turns current holdings and a target allocation into the smallest list of swaps that
//! brings the portfolio back within the rebalancing threshold.
//!
//! Everything here is pure: balances and prices are fetched by the caller right before
//! planning and never cached.

use std::{cmp::Ordering, collections::BTreeMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Remainders below this many USD count as exhausted when matching sellers and buyers.
const EPSILON_USD: f64 = 1e-9;

/// One planned swap, sized in both USD and the sell token's whole units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Swap {
    pub sell: String,
    pub buy: String,
    pub value_usd: f64,
    pub sell_amount: f64,
}

/// Where one symbol stands relative to its target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub symbol: String,
    pub current_usd: f64,
    pub target_usd: f64,
    pub current_pct: f64,
    pub target_pct: f64,
    pub deviation_usd: f64,
    pub deviation_pct: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub total_usd: f64,
    pub allocations: Vec<Allocation>,
    pub swaps: Vec<Swap>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RebalancingPlanner {
    dust_threshold_usd: f64,
}

impl Default for RebalancingPlanner {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl RebalancingPlanner {
    pub fn new(dust_threshold_usd: f64) -> Self {
        Self {
            dust_threshold_usd: dust_threshold_usd.max(0.0),
        }
    }

    /// Current allocation of every target symbol. A missing price values the holding at zero.
    pub fn allocations(
        &self,
        balances: &BTreeMap<String, f64>,
        prices: &BTreeMap<String, f64>,
        targets: &BTreeMap<String, f64>,
    ) -> (f64, Vec<Allocation>) {
        let values: Vec<(&String, f64, f64)> = targets
            .iter()
            .map(|(symbol, target_pct)| {
                let amount = balances.get(symbol).copied().unwrap_or(0.0);
                let price = prices.get(symbol).copied().unwrap_or(0.0);
                let value = if amount.is_finite() && price.is_finite() {
                    (amount * price).max(0.0)
                } else {
                    0.0
                };
                (symbol, value, *target_pct)
            })
            .collect();

        let total_usd: f64 = values.iter().map(|(_, value, _)| value).sum();
        let allocations = values
            .into_iter()
            .map(|(symbol, current_usd, target_pct)| {
                let target_usd = total_usd * target_pct / 100.0;
                let deviation_usd = current_usd - target_usd;
                let (current_pct, deviation_pct) = if total_usd > 0.0 {
                    (
                        current_usd / total_usd * 100.0,
                        deviation_usd / total_usd * 100.0,
                    )
                } else {
                    (0.0, 0.0)
                };
                Allocation {
                    symbol: symbol.clone(),
                    current_usd,
                    target_usd,
                    current_pct,
                    target_pct,
                    deviation_usd,
                    deviation_pct,
                }
            })
            .collect();

        (total_usd, allocations)
    }

    /// The swaps needed to reach `targets`, or none if every symbol is already within
    /// `threshold_pct` of its target.
    pub fn plan(
        &self,
        balances: &BTreeMap<String, f64>,
        prices: &BTreeMap<String, f64>,
        targets: &BTreeMap<String, f64>,
        threshold_pct: f64,
    ) -> Plan {
        let (total_usd, allocations) = self.allocations(balances, prices, targets);
        let swaps = if total_usd > 0.0 {
            self.match_swaps(&allocations, prices, threshold_pct)
        } else {
            Vec::new()
        };
        Plan {
            total_usd,
            allocations,
            swaps,
        }
    }

    fn match_swaps(
        &self,
        allocations: &[Allocation],
        prices: &BTreeMap<String, f64>,
        threshold_pct: f64,
    ) -> Vec<Swap> {
        let max_deviation = allocations
            .iter()
            .map(|allocation| allocation.deviation_pct.abs())
            .fold(0.0, f64::max);
        if max_deviation < threshold_pct {
            debug!(
                "Largest deviation {:.2}% is below the {:.2}% threshold",
                max_deviation, threshold_pct
            );
            return Vec::new();
        }

        let mut ranked: Vec<&Allocation> = allocations.iter().collect();
        ranked.sort_by(|a, b| {
            b.deviation_usd
                .partial_cmp(&a.deviation_usd)
                .unwrap_or(Ordering::Equal)
        });

        // Sellers from the front, buyers from the back.
        let mut sellers: Vec<(&str, f64)> = ranked
            .iter()
            .filter(|allocation| allocation.deviation_usd > EPSILON_USD)
            .map(|allocation| (allocation.symbol.as_str(), allocation.deviation_usd))
            .collect();
        let mut buyers: Vec<(&str, f64)> = ranked
            .iter()
            .rev()
            .filter(|allocation| allocation.deviation_usd < -EPSILON_USD)
            .map(|allocation| (allocation.symbol.as_str(), -allocation.deviation_usd))
            .collect();

        let mut swaps = Vec::new();
        let (mut seller, mut buyer) = (0, 0);
        while seller < sellers.len() && buyer < buyers.len() {
            let (sell_symbol, surplus) = sellers[seller];
            let (buy_symbol, deficit) = buyers[buyer];
            let value_usd = surplus.min(deficit);

            let price = prices.get(sell_symbol).copied().unwrap_or(0.0);
            if value_usd >= self.dust_threshold_usd && price > 0.0 {
                swaps.push(Swap {
                    sell: sell_symbol.to_owned(),
                    buy: buy_symbol.to_owned(),
                    value_usd,
                    sell_amount: value_usd / price,
                });
            } else {
                debug!(
                    "Skipping {:.4} USD swap from {} to {}",
                    value_usd, sell_symbol, buy_symbol
                );
            }

            sellers[seller].1 -= value_usd;
            buyers[buyer].1 -= value_usd;
            let seller_done = sellers[seller].1 <= EPSILON_USD;
            let buyer_done = buyers[buyer].1 <= EPSILON_USD;
            // Every round retires at least one side, which bounds the swap count.
            if seller_done || !buyer_done {
                seller += 1;
            }
            if buyer_done || !seller_done {
                buyer += 1;
            }
        }

        swaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries
            .iter()
            .map(|(symbol, value)| ((*symbol).to_owned(), *value))
            .collect()
    }

    #[test]
    fn overweight_eth_sells_ten_dollars_into_usdc() {
        let balances = map(&[("ETH", 0.03), ("USDC", 40.0)]);
        let prices = map(&[("ETH", 2_000.0), ("USDC", 1.0)]);
        let targets = map(&[("ETH", 50.0), ("USDC", 50.0)]);

        let plan = RebalancingPlanner::default().plan(&balances, &prices, &targets, 5.0);
        assert_eq!(plan.swaps.len(), 1);
        let swap = &plan.swaps[0];
        assert_eq!(swap.sell, "ETH");
        assert_eq!(swap.buy, "USDC");
        assert!((swap.value_usd - 10.0).abs() < 1e-9);
        assert!((swap.sell_amount - 0.005).abs() < 1e-12);
        assert!((plan.total_usd - 100.0).abs() < 1e-9);
    }

    #[test]
    fn deviation_inside_threshold_is_left_alone() {
        let balances = map(&[("ETH", 0.03), ("USDC", 40.0)]);
        let prices = map(&[("ETH", 2_000.0), ("USDC", 1.0)]);
        let targets = map(&[("ETH", 50.0), ("USDC", 50.0)]);

        let plan = RebalancingPlanner::default().plan(&balances, &prices, &targets, 15.0);
        assert!(plan.swaps.is_empty());
    }

    #[test]
    fn missing_price_counts_as_zero_value() {
        let balances = map(&[("ETH", 1.0), ("OBSCURE", 1_000.0)]);
        let prices = map(&[("ETH", 100.0)]);
        let targets = map(&[("ETH", 50.0), ("OBSCURE", 50.0)]);

        let plan = RebalancingPlanner::default().plan(&balances, &prices, &targets, 5.0);
        assert!((plan.total_usd - 100.0).abs() < 1e-9);
        assert_eq!(plan.swaps.len(), 1);
        assert_eq!(plan.swaps[0].sell, "ETH");
        assert!((plan.swaps[0].value_usd - 50.0).abs() < 1e-9);
    }

    #[test]
    fn empty_portfolio_plans_nothing() {
        let targets = map(&[("ETH", 50.0), ("USDC", 50.0)]);
        let plan =
            RebalancingPlanner::default().plan(&BTreeMap::new(), &BTreeMap::new(), &targets, 5.0);
        assert!(plan.swaps.is_empty());
        assert_eq!(plan.total_usd, 0.0);
    }

    #[test]
    fn dust_swaps_are_skipped() {
        let balances = map(&[("ETH", 0.0051), ("USDC", 4.8)]);
        let prices = map(&[("ETH", 1_000.0), ("USDC", 1.0)]);
        let targets = map(&[("ETH", 50.0), ("USDC", 50.0)]);

        let plan = RebalancingPlanner::new(1.0).plan(&balances, &prices, &targets, 1.0);
        assert!(plan.allocations[0].deviation_pct.abs() >= 1.0);
        assert!(plan.swaps.is_empty());
    }

    #[test]
    fn swaps_never_overshoot_and_stay_below_symbol_count() {
        let balances = map(&[
            ("ETH", 2.0),
            ("BTC", 0.01),
            ("USDC", 500.0),
            ("SOL", 40.0),
            ("DAI", 0.0),
        ]);
        let prices = map(&[
            ("ETH", 1_500.0),
            ("BTC", 60_000.0),
            ("USDC", 1.0),
            ("SOL", 25.0),
            ("DAI", 1.0),
        ]);
        let targets = map(&[
            ("ETH", 20.0),
            ("BTC", 20.0),
            ("USDC", 20.0),
            ("SOL", 20.0),
            ("DAI", 20.0),
        ]);
        let planner = RebalancingPlanner::new(0.0);
        let plan = planner.plan(&balances, &prices, &targets, 1.0);

        assert!(!plan.swaps.is_empty());
        assert!(plan.swaps.len() < targets.len());

        let by_symbol: BTreeMap<&str, &Allocation> = plan
            .allocations
            .iter()
            .map(|allocation| (allocation.symbol.as_str(), allocation))
            .collect();
        let mut sold: BTreeMap<&str, f64> = BTreeMap::new();
        let mut bought: BTreeMap<&str, f64> = BTreeMap::new();
        for swap in &plan.swaps {
            let seller = by_symbol[swap.sell.as_str()];
            let buyer = by_symbol[swap.buy.as_str()];
            assert!(swap.value_usd <= seller.deviation_usd + 1e-6);
            assert!(swap.value_usd <= -buyer.deviation_usd + 1e-6);
            *sold.entry(swap.sell.as_str()).or_default() += swap.value_usd;
            *bought.entry(swap.buy.as_str()).or_default() += swap.value_usd;
        }

        // Applying every swap at stable prices lands each symbol on target.
        for allocation in &plan.allocations {
            let symbol = allocation.symbol.as_str();
            let after = allocation.current_usd - sold.get(symbol).copied().unwrap_or(0.0)
                + bought.get(symbol).copied().unwrap_or(0.0);
            let pct = after / plan.total_usd * 100.0;
            assert!((pct - allocation.target_pct).abs() < 1.0, "{symbol} at {pct}%");
        }
    }
}
