use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{Asset, Ledger, PriceOracle, Quote, QuoteRequest, QuoteService, Receipt};
use crate::{delegation::Address, encoder::Redemption, Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn client() -> Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("keeper/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::bad_config(format!("Could not build HTTP client: {e}")))
}

/// `base` with `segments` appended as path segments.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| Error::bad_config(format!("{base} cannot be used as a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value.strip_prefix("0x").unwrap_or(value))
        .map_err(|_| Error::transient(format!("Malformed {field} in response: {value}")))
}

fn decode_amount(field: &str, value: &str) -> Result<u128> {
    value
        .parse()
        .map_err(|_| Error::transient(format!("Malformed {field} in response: {value}")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    to: Address,
    data: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    allowance_target: Option<Address>,
}

/// DEX aggregator speaking a `GET /quote` API.
pub struct HttpQuoteService {
    client: Client,
    base: Url,
}

impl HttpQuoteService {
    pub fn new(base: Url) -> Result<Self> {
        Ok(Self {
            client: client()?,
            base,
        })
    }
}

#[async_trait]
impl QuoteService for HttpQuoteService {
    async fn quote(&self, request: &QuoteRequest) -> Result<Quote> {
        let url = endpoint(&self.base, &["quote"])?;
        debug!(
            "Requesting quote for {} of {} -> {}",
            request.sell_amount, request.sell_token, request.buy_token
        );
        let response: QuoteResponse = self
            .client
            .get(url)
            .query(&[
                ("sellToken", request.sell_token.to_string()),
                ("buyToken", request.buy_token.to_string()),
                ("sellAmount", request.sell_amount.to_string()),
                ("taker", request.taker.to_string()),
                ("slippageBps", request.slippage_bps.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(Quote {
            settlement_payload: decode_hex("data", &response.data)?,
            target_contract: response.to,
            value: match response.value.as_deref() {
                Some(value) => decode_amount("value", value)?,
                None => 0,
            },
            approval_spender: response.allowance_target,
        })
    }
}

#[derive(Deserialize)]
struct PriceResponse {
    usd: Option<f64>,
}

pub struct HttpPriceOracle {
    client: Client,
    base: Url,
}

impl HttpPriceOracle {
    pub fn new(base: Url) -> Result<Self> {
        Ok(Self {
            client: client()?,
            base,
        })
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn usd_price(&self, symbol: &str) -> Result<Option<f64>> {
        let url = endpoint(&self.base, &["price", symbol])?;
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let price: PriceResponse = response.error_for_status()?.json().await?;
        Ok(price.usd.filter(|usd| usd.is_finite() && *usd > 0.0))
    }
}

#[derive(Deserialize)]
struct BalanceResponse {
    amount: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RedeemRequest {
    permission_context: String,
    modes: String,
    execution_calldata: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RedeemResponse {
    tx_ref: String,
}

/// Relayer that submits redemptions to the delegation manager on the worker's behalf.
pub struct HttpLedger {
    client: Client,
    base: Url,
}

impl HttpLedger {
    pub fn new(base: Url) -> Result<Self> {
        Ok(Self {
            client: client()?,
            base,
        })
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn balance(&self, wallet: &Address, asset: &Asset) -> Result<u128> {
        let token = asset
            .address
            .map_or_else(|| "native".to_owned(), |address| address.to_string());
        let url = endpoint(&self.base, &["balance", &wallet.to_string(), &token])?;
        let response: BalanceResponse = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        decode_amount("amount", &response.amount)
    }

    async fn submit(&self, redemption: &Redemption) -> Result<String> {
        let url = endpoint(&self.base, &["redeem"])?;
        let body = RedeemRequest {
            permission_context: format!("0x{}", hex::encode(&redemption.chain)),
            modes: format!("0x{}", hex::encode(redemption.mode_flags())),
            execution_calldata: redemption
                .calls
                .iter()
                .map(|call| format!("0x{}", hex::encode(call)))
                .collect(),
        };
        let response = self.client.post(url).json(&body).send().await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::transient("Ledger relayer is rate limiting"));
        }
        let response: RedeemResponse = response.error_for_status()?.json().await?;
        Ok(response.tx_ref)
    }

    async fn receipt(&self, tx_ref: &str) -> Result<Option<Receipt>> {
        let url = endpoint(&self.base, &["receipt", tx_ref])?;
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }
}
