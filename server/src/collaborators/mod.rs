//! Interfaces to the services the worker depends on but does not own: the swap quote
//! service, the USD price oracle and the ledger that redeems permission chains.

pub mod assets;
mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use assets::{format_units, from_units, parse_units, to_units, Asset, AssetRegistry};
pub use http::{HttpLedger, HttpPriceOracle, HttpQuoteService};

use crate::{
    delegation::Address,
    encoder::Redemption,
    Error, Result,
};

/// How often to ask the ledger for a receipt while waiting on confirmation.
pub const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuoteRequest {
    pub sell_token: Address,
    pub buy_token: Address,
    /// Raw base units of the sell token.
    pub sell_amount: u128,
    pub taker: Address,
    pub slippage_bps: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Quote {
    /// Calldata to send to `target_contract`.
    pub settlement_payload: Vec<u8>,
    pub target_contract: Address,
    /// Native value to attach to the settlement call.
    pub value: u128,
    /// Spender that must be approved for the sell token first, if any.
    pub approval_spender: Option<Address>,
}

#[async_trait]
pub trait QuoteService: Send + Sync {
    async fn quote(&self, request: &QuoteRequest) -> Result<Quote>;
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// USD price of one whole unit. `None` when the oracle has no price for the symbol.
    async fn usd_price(&self, symbol: &str) -> Result<Option<f64>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub status: ReceiptStatus,
    #[serde(default)]
    pub gas_used: u64,
    #[serde(default)]
    pub revert_reason: Option<String>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Raw balance of `asset` held by `wallet`.
    async fn balance(&self, wallet: &Address, asset: &Asset) -> Result<u128>;

    /// Submits one atomic redemption and returns its transaction reference.
    async fn submit(&self, redemption: &Redemption) -> Result<String>;

    /// The receipt once the transaction is mined, `None` while it is pending.
    async fn receipt(&self, tx_ref: &str) -> Result<Option<Receipt>>;
}

/// Polls for a receipt until one shows up or `timeout` passes.
///
/// A timeout is a transient failure; the transaction may still confirm later.
pub async fn wait_for_receipt(
    ledger: &dyn Ledger,
    tx_ref: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Receipt> {
    let poll = async {
        loop {
            if let Some(receipt) = ledger.receipt(tx_ref).await? {
                return Ok::<_, Error>(receipt);
            }
            debug!("Transaction {} still pending", tx_ref);
            tokio::time::sleep(poll_interval).await;
        }
    };

    match tokio::time::timeout(timeout, poll).await {
        Ok(receipt) => receipt,
        Err(_) => Err(Error::transient(format!(
            "Transaction {tx_ref} was not confirmed within {}",
            humantime::format_duration(timeout)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct SlowLedger {
        polls: AtomicUsize,
        ready_after: usize,
    }

    #[async_trait]
    impl Ledger for SlowLedger {
        async fn balance(&self, _: &Address, _: &Asset) -> Result<u128> {
            Ok(0)
        }

        async fn submit(&self, _: &Redemption) -> Result<String> {
            Ok("0xtx".to_owned())
        }

        async fn receipt(&self, _: &str) -> Result<Option<Receipt>> {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((polls >= self.ready_after).then(|| Receipt {
                status: ReceiptStatus::Success,
                gas_used: 21_000,
                revert_reason: None,
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_the_receipt_arrives() {
        let ledger = SlowLedger {
            polls: AtomicUsize::new(0),
            ready_after: 3,
        };
        let receipt = wait_for_receipt(
            &ledger,
            "0xtx",
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Success);
        assert_eq!(ledger.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_timeout() {
        let ledger = SlowLedger {
            polls: AtomicUsize::new(0),
            ready_after: usize::MAX,
        };
        let error = wait_for_receipt(
            &ledger,
            "0xtx",
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(error.is_transient());
        assert!(error.to_string().contains("0xtx"));
    }
}
