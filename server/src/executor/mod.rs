//! Type-specific execution of a claimed schedule.
//!
//! Balances and prices are fetched fresh for every attempt. The stored permission chain is
//! only ever read here.

mod rebalance;
mod swap;
mod transfer;

use std::{sync::Arc, time::Duration};

use tracing::{debug, info};

use crate::{
    collaborators::{
        wait_for_receipt, Asset, AssetRegistry, Ledger, PriceOracle, QuoteService,
        ReceiptStatus, RECEIPT_POLL_INTERVAL,
    },
    delegation::{EnforcerKind, PeriodSpend, PermissionChain, SigningDomain},
    encoder::{Call, ExecutionEncoder, Redemption},
    planner::RebalancingPlanner,
    schedule::{Schedule, ScheduleParams},
    store::PermissionStore,
    Error,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub slippage_bps: u16,
    pub confirmation_timeout: Duration,
    pub receipt_poll_interval: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            slippage_bps: 100,
            confirmation_timeout: Duration::from_secs(120),
            receipt_poll_interval: RECEIPT_POLL_INTERVAL,
        }
    }
}

/// A successful attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Executed {
    /// Settlement references, comma separated when the attempt sent several transactions.
    pub tx_ref: Option<String>,
    pub message: String,
}

/// A failed attempt, with the reference of any transaction it already sent.
#[derive(Debug)]
pub struct Failed {
    pub error: Error,
    pub tx_ref: Option<String>,
}

impl From<Error> for Failed {
    fn from(error: Error) -> Self {
        Self {
            error,
            tx_ref: None,
        }
    }
}

struct Settlement {
    tx_ref: String,
    gas_used: u64,
}

/// Turns an on-chain revert into the error recorded in history.
fn revert_error(tx_ref: &str, reason: Option<&str>) -> Error {
    let reason = reason.unwrap_or("no reason given");
    let enforcer = EnforcerKind::from_revert_reason(reason).map(EnforcerKind::name);
    Error::denied(enforcer, format!("transaction {tx_ref} reverted: {reason}"))
}

pub struct Executor {
    permissions: Arc<dyn PermissionStore>,
    assets: AssetRegistry,
    quotes: Arc<dyn QuoteService>,
    prices: Arc<dyn PriceOracle>,
    ledger: Arc<dyn Ledger>,
    planner: RebalancingPlanner,
    domain: SigningDomain,
    settings: ExecutorSettings,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        permissions: Arc<dyn PermissionStore>,
        assets: AssetRegistry,
        quotes: Arc<dyn QuoteService>,
        prices: Arc<dyn PriceOracle>,
        ledger: Arc<dyn Ledger>,
        planner: RebalancingPlanner,
        domain: SigningDomain,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            permissions,
            assets,
            quotes,
            prices,
            ledger,
            planner,
            domain,
            settings,
        }
    }

    pub fn assets(&self) -> &AssetRegistry {
        &self.assets
    }

    /// Runs one attempt of `schedule`. `now` is unix milliseconds.
    #[tracing::instrument(skip_all, fields(schedule = %schedule.id, kind = %schedule.kind))]
    pub async fn execute(&self, schedule: &Schedule, now: u64) -> Result<Executed, Failed> {
        debug!("Executing attempt {}", schedule.execution_count + 1);
        let executed = match &schedule.params {
            ScheduleParams::Transfer {
                asset,
                amount,
                recipient,
            } => self.transfer(schedule, asset, amount, recipient, now).await?,
            ScheduleParams::SwapSeries {
                sell_asset,
                buy_asset,
                amount,
            } => {
                self.swap_series(schedule, sell_asset, buy_asset, amount, now)
                    .await?
            }
            ScheduleParams::Rebalance {
                targets,
                threshold_pct,
            } => {
                self.rebalance(schedule, targets, *threshold_pct, now)
                    .await?
            }
        };
        info!("{}", executed.message);
        Ok(executed)
    }

    async fn fresh_balance(&self, schedule: &Schedule, asset: &Asset) -> crate::Result<u128> {
        self.ledger.balance(&schedule.wallet, asset).await
    }

    /// Loads, verifies and pre-checks the live chain for `symbol`, then encodes `calls`.
    fn redemption(
        &self,
        schedule: &Schedule,
        symbol: &str,
        calls: &[Call],
        now: u64,
    ) -> crate::Result<Redemption> {
        let symbol = symbol.to_ascii_uppercase();
        let stored = self
            .permissions
            .chain(&schedule.wallet, &schedule.id, Some(&symbol))?
            .ok_or_else(|| {
                Error::integrity(format!(
                    "No live permission chain for schedule {} and asset {}",
                    schedule.id, symbol
                ))
            })?;

        let chain = PermissionChain::decode(&stored.chain)?;
        chain.verify(&self.domain)?;
        if chain.leaf().map(|leaf| leaf.hash()) != Some(stored.leaf_hash) {
            return Err(Error::integrity(format!(
                "Stored chain for schedule {} does not match its recorded leaf",
                schedule.id
            )));
        }

        let redemption = ExecutionEncoder::batch(&chain, calls)?;
        // Period spend is tracked by the ledger; locally this only rejects calls that could
        // never pass.
        chain.authorize(&redemption.intents, now / 1000, &PeriodSpend::default())?;
        Ok(redemption)
    }

    /// Submits and waits for settlement. Reverted transactions are failures.
    async fn settle(&self, redemption: &Redemption) -> Result<Settlement, Failed> {
        let tx_ref = self.ledger.submit(redemption).await?;
        debug!("Submitted {} call group(s) as {}", redemption.calls.len(), tx_ref);

        let receipt = wait_for_receipt(
            self.ledger.as_ref(),
            &tx_ref,
            self.settings.confirmation_timeout,
            self.settings.receipt_poll_interval,
        )
        .await
        .map_err(|error| Failed {
            error,
            tx_ref: Some(tx_ref.clone()),
        })?;

        match receipt.status {
            ReceiptStatus::Success => Ok(Settlement {
                tx_ref,
                gas_used: receipt.gas_used,
            }),
            ReceiptStatus::Reverted => Err(Failed {
                error: revert_error(&tx_ref, receipt.revert_reason.as_deref()),
                tx_ref: Some(tx_ref),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverts_name_the_enforcer_when_possible() {
        let error = revert_error("0x1", Some("AllowedTargetsEnforcer:target-address-not-allowed"));
        assert!(matches!(
            &error,
            Error::PermissionDenied { enforcer: Some(name), .. } if name == "AllowedTargetsEnforcer"
        ));

        let generic = revert_error("0x2", None);
        assert!(matches!(generic, Error::PermissionDenied { enforcer: None, .. }));
    }
}
