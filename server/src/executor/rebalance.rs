use std::collections::BTreeMap;

use futures_util::future::try_join_all;
use tracing::{debug, warn};

use super::{Executed, Executor, Failed};
use crate::{
    collaborators::{format_units, from_units, to_units},
    schedule::Schedule,
    Error, Result,
};

struct Holding {
    symbol: String,
    raw: u128,
    units: f64,
    price: Option<f64>,
}

impl Executor {
    async fn holding(&self, schedule: &Schedule, symbol: &str) -> Result<Holding> {
        let asset = self.assets.get(symbol)?;
        let raw = self.fresh_balance(schedule, asset).await?;
        let price = match self.prices.usd_price(symbol).await {
            Ok(price) => price,
            Err(error) => {
                warn!("No price for {}, valuing it at zero: {}", symbol, error);
                None
            }
        };
        Ok(Holding {
            symbol: symbol.to_ascii_uppercase(),
            raw,
            units: to_units(raw, asset.decimals),
            price,
        })
    }

    pub(super) async fn rebalance(
        &self,
        schedule: &Schedule,
        targets: &BTreeMap<String, f64>,
        threshold_pct: f64,
        now: u64,
    ) -> std::result::Result<Executed, Failed> {
        let holdings = try_join_all(
            targets
                .keys()
                .map(|symbol| self.holding(schedule, symbol)),
        )
        .await?;

        let targets: BTreeMap<String, f64> = targets
            .iter()
            .map(|(symbol, pct)| (symbol.to_ascii_uppercase(), *pct))
            .collect();
        let balances: BTreeMap<String, f64> = holdings
            .iter()
            .map(|holding| (holding.symbol.clone(), holding.units))
            .collect();
        let prices: BTreeMap<String, f64> = holdings
            .iter()
            .filter_map(|holding| holding.price.map(|price| (holding.symbol.clone(), price)))
            .collect();
        let raw_balances: BTreeMap<&str, u128> = holdings
            .iter()
            .map(|holding| (holding.symbol.as_str(), holding.raw))
            .collect();

        let plan = self
            .planner
            .plan(&balances, &prices, &targets, threshold_pct);
        if plan.swaps.is_empty() {
            return Ok(Executed {
                tx_ref: None,
                message: format!(
                    "Portfolio worth {:.2} USD is within {}% of its targets",
                    plan.total_usd, threshold_pct
                ),
            });
        }

        let mut tx_refs: Vec<String> = Vec::new();
        let mut done = Vec::new();
        for swap in &plan.swaps {
            let sell = self.assets.get(&swap.sell)?;
            let buy = self.assets.get(&swap.buy)?;
            let available = raw_balances.get(swap.sell.as_str()).copied().unwrap_or(0);
            let raw = from_units(swap.sell_amount, sell.decimals).min(available);
            if raw == 0 {
                debug!("Nothing to sell for {} -> {}", swap.sell, swap.buy);
                continue;
            }

            let attempt = async {
                let calls = self.swap_calls(schedule, sell, buy, raw).await?;
                let redemption = self.redemption(schedule, &swap.sell, &calls, now)?;
                self.settle(&redemption).await
            };
            match attempt.await {
                Ok(settlement) => {
                    done.push(format!(
                        "{} {} -> {} ({:.2} USD)",
                        format_units(raw, sell.decimals),
                        swap.sell,
                        swap.buy,
                        swap.value_usd
                    ));
                    tx_refs.push(settlement.tx_ref);
                }
                Err(failed) => {
                    // Swaps that already settled stay settled; record them with the failure.
                    tx_refs.extend(failed.tx_ref);
                    return Err(Failed {
                        error: failed.error,
                        tx_ref: join_refs(tx_refs),
                    });
                }
            }
        }

        if done.is_empty() {
            return Err(Error::transient("Planned swaps had nothing to sell").into());
        }

        Ok(Executed {
            message: format!("Rebalanced with {} swap(s): {}", done.len(), done.join(", ")),
            tx_ref: join_refs(tx_refs),
        })
    }
}

fn join_refs(tx_refs: Vec<String>) -> Option<String> {
    (!tx_refs.is_empty()).then(|| tx_refs.join(","))
}
