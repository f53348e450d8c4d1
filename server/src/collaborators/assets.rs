use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{delegation::Address, Error, Result};

/// Placeholder token address quote services use for the native asset.
pub const NATIVE_TOKEN: Address = Address([0xee; 20]);

/// Most decimals any supported asset may have; keeps `10^decimals` inside `u128`.
const MAX_DECIMALS: u8 = 30;

/// A known asset. Without an address it is the ledger's native asset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    #[serde(default)]
    pub address: Option<Address>,
    pub decimals: u8,
}

impl Asset {
    pub fn is_native(&self) -> bool {
        self.address.is_none()
    }

    /// Address to quote with.
    pub fn quote_address(&self) -> Address {
        self.address.unwrap_or(NATIVE_TOKEN)
    }
}

/// Symbol lookup, case-insensitive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssetRegistry {
    assets: BTreeMap<String, Asset>,
}

impl AssetRegistry {
    pub fn new(assets: &BTreeMap<String, Asset>) -> Result<Self> {
        let mut registry = Self::default();
        let mut natives = 0;
        for (symbol, asset) in assets {
            if asset.decimals > MAX_DECIMALS {
                return Err(Error::bad_config(format!(
                    "Asset {symbol} has {} decimals, at most {MAX_DECIMALS} are supported",
                    asset.decimals
                )));
            }
            if asset.is_native() {
                natives += 1;
            }
            registry
                .assets
                .insert(symbol.to_ascii_uppercase(), asset.clone());
        }
        if natives > 1 {
            return Err(Error::bad_config(
                "Only one asset may omit its address (the native asset)",
            ));
        }
        Ok(registry)
    }

    pub fn get(&self, symbol: &str) -> Result<&Asset> {
        self.assets
            .get(&symbol.to_ascii_uppercase())
            .ok_or_else(|| Error::InvalidParameter(format!("Unknown asset {symbol}")))
    }
}

fn scale(decimals: u8) -> u128 {
    10u128.pow(u32::from(decimals))
}

/// Parses a decimal amount in whole units into raw base units.
pub fn parse_units(amount: &str, decimals: u8) -> Result<u128> {
    let invalid = || Error::InvalidParameter(format!("Invalid amount {amount:?}"));
    let amount = amount.trim();
    let (whole, fraction) = amount.split_once('.').unwrap_or((amount, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }
    if fraction.len() > usize::from(decimals) {
        return Err(Error::InvalidParameter(format!(
            "Amount {amount} has more than {decimals} decimal places"
        )));
    }

    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let padded = format!("{fraction:0<width$}", width = usize::from(decimals));
    let fraction: u128 = if padded.is_empty() {
        0
    } else {
        padded.parse().map_err(|_| invalid())?
    };

    whole
        .checked_mul(scale(decimals))
        .and_then(|raw| raw.checked_add(fraction))
        .ok_or_else(invalid)
}

/// Formats raw base units as a decimal amount without trailing zeros.
pub fn format_units(raw: u128, decimals: u8) -> String {
    let scale = scale(decimals);
    let whole = raw / scale;
    let fraction = raw % scale;
    if fraction == 0 {
        return whole.to_string();
    }
    let fraction = format!("{fraction:0>width$}", width = usize::from(decimals));
    format!("{whole}.{}", fraction.trim_end_matches('0'))
}

/// Raw base units as an approximate float, for valuation only.
pub fn to_units(raw: u128, decimals: u8) -> f64 {
    raw as f64 / scale(decimals) as f64
}

/// Approximate whole units back to raw base units, rounded down.
pub fn from_units(amount: f64, decimals: u8) -> u128 {
    if !amount.is_finite() || amount <= 0.0 {
        return 0;
    }
    (amount * scale(decimals) as f64).floor() as u128
}
