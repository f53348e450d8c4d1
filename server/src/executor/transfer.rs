use super::{Executed, Executor, Failed};
use crate::{
    collaborators::{format_units, parse_units},
    delegation::Address,
    encoder::Call,
    schedule::Schedule,
    Error,
};

impl Executor {
    pub(super) async fn transfer(
        &self,
        schedule: &Schedule,
        symbol: &str,
        amount: &str,
        recipient: &Address,
        now: u64,
    ) -> Result<Executed, Failed> {
        let asset = self.assets.get(symbol)?;
        let raw = parse_units(amount, asset.decimals)?;

        let balance = self.fresh_balance(schedule, asset).await?;
        if balance < raw {
            return Err(Error::transient(format!(
                "Balance of {} {} is below the scheduled {}",
                format_units(balance, asset.decimals),
                symbol,
                amount
            ))
            .into());
        }

        let call = match asset.address {
            Some(token) => Call::token_transfer(token, *recipient, raw),
            None => Call::native_transfer(*recipient, raw),
        };
        let redemption = self.redemption(schedule, symbol, &[call], now)?;
        let settlement = self.settle(&redemption).await?;

        Ok(Executed {
            message: format!(
                "Sent {} {} to {} in {} ({} gas)",
                format_units(raw, asset.decimals),
                symbol,
                recipient,
                settlement.tx_ref,
                settlement.gas_used
            ),
            tx_ref: Some(settlement.tx_ref),
        })
    }
}
