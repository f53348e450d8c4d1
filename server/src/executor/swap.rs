use super::{Executed, Executor, Failed};
use crate::{
    collaborators::{format_units, parse_units, Asset, QuoteRequest},
    encoder::Call,
    schedule::Schedule,
    Error, Result,
};

impl Executor {
    /// Approval (when the quote needs one) followed by the settlement call.
    pub(super) async fn swap_calls(
        &self,
        schedule: &Schedule,
        sell: &Asset,
        buy: &Asset,
        sell_amount: u128,
    ) -> Result<Vec<Call>> {
        let quote = self
            .quotes
            .quote(&QuoteRequest {
                sell_token: sell.quote_address(),
                buy_token: buy.quote_address(),
                sell_amount,
                taker: schedule.wallet,
                slippage_bps: self.settings.slippage_bps,
            })
            .await?;

        let mut calls = Vec::with_capacity(2);
        if let (Some(token), Some(spender)) = (sell.address, quote.approval_spender) {
            calls.push(Call::token_approval(token, spender, sell_amount));
        }
        calls.push(Call {
            target: quote.target_contract,
            value: quote.value,
            payload: quote.settlement_payload,
        });
        Ok(calls)
    }

    pub(super) async fn swap_series(
        &self,
        schedule: &Schedule,
        sell_symbol: &str,
        buy_symbol: &str,
        amount: &str,
        now: u64,
    ) -> std::result::Result<Executed, Failed> {
        let sell = self.assets.get(sell_symbol)?;
        let buy = self.assets.get(buy_symbol)?;
        let raw = parse_units(amount, sell.decimals)?;

        let balance = self.fresh_balance(schedule, sell).await?;
        if balance < raw {
            return Err(Error::transient(format!(
                "Balance of {} {} is below the scheduled {}",
                format_units(balance, sell.decimals),
                sell_symbol,
                amount
            ))
            .into());
        }

        let calls = self.swap_calls(schedule, sell, buy, raw).await?;
        let redemption = self.redemption(schedule, sell_symbol, &calls, now)?;
        let settlement = self.settle(&redemption).await?;

        Ok(Executed {
            message: format!(
                "Swapped {} {} for {} in {}",
                format_units(raw, sell.decimals),
                sell_symbol,
                buy_symbol,
                settlement.tx_ref
            ),
            tx_ref: Some(settlement.tx_ref),
        })
    }
}
