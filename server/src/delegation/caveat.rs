//! Caveat construction and evaluation.
//!
//! Terms use a fixed big-endian layout so the ledger-side enforcer reads them the same way
//! they are written here.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{hex_bytes, Address};
use crate::{Error, Result};

const WORD: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EnforcerKind {
    #[serde(rename = "NativeTokenPeriodTransferEnforcer")]
    NativeTokenPeriodTransfer,
    #[serde(rename = "ERC20PeriodTransferEnforcer")]
    TokenPeriodTransfer,
    #[serde(rename = "AllowedTargetsEnforcer")]
    AllowedTargets,
    #[serde(rename = "TimestampEnforcer")]
    Timestamp,
}

impl EnforcerKind {
    pub const ALL: [Self; 4] = [
        Self::NativeTokenPeriodTransfer,
        Self::TokenPeriodTransfer,
        Self::AllowedTargets,
        Self::Timestamp,
    ];

    /// The enforcer named in a ledger revert reason, if any.
    pub fn from_revert_reason(reason: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| reason.contains(kind.name()))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NativeTokenPeriodTransfer => "NativeTokenPeriodTransferEnforcer",
            Self::TokenPeriodTransfer => "ERC20PeriodTransferEnforcer",
            Self::AllowedTargets => "AllowedTargetsEnforcer",
            Self::Timestamp => "TimestampEnforcer",
        }
    }
}

/// A periodic allowance: `period_amount` may move every `period_duration` seconds,
/// counting from `start_date` (unix seconds).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodLimit {
    pub period_amount: u128,
    pub period_duration: u64,
    pub start_date: u64,
}

impl PeriodLimit {
    /// Start of the period containing `at`, or `None` before the allowance starts.
    pub fn period_start(&self, at: u64) -> Option<u64> {
        if at < self.start_date || self.period_duration == 0 {
            return None;
        }
        let elapsed = at - self.start_date;
        Some(self.start_date + elapsed - elapsed % self.period_duration)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPeriodLimit {
    pub token: Address,
    pub limit: PeriodLimit,
}

/// Validity window in unix seconds. Zero means unbounded on that side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub after: u64,
    pub before: u64,
}

/// Decoded caveat terms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaveatTerms {
    NativePeriod(PeriodLimit),
    TokenPeriod(TokenPeriodLimit),
    AllowedTargets(Vec<Address>),
    Timestamp(TimeWindow),
}

/// A rule checked by the ledger when the chain is redeemed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caveat {
    pub enforcer: EnforcerKind,
    #[serde(with = "hex_bytes")]
    pub terms: Vec<u8>,
    #[serde(with = "hex_bytes", default)]
    pub args: Vec<u8>,
}

/// What a single call would do, as seen by the enforcers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallIntent {
    pub target: Address,
    pub value: u128,
    /// Token leaving the delegator's wallet through this call (transfer or approval).
    pub token_outflow: Option<(Address, u128)>,
}

/// Amounts already moved in the current period, per allowance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeriodSpend {
    pub native: u128,
    pub tokens: BTreeMap<Address, u128>,
}

fn amount_word(value: u128) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn u64_word(value: u64) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn read_amount(word: &[u8]) -> Result<u128> {
    if word.len() != WORD || word[..16].iter().any(|byte| *byte != 0) {
        return Err(Error::InvalidParameter("Amount does not fit in 128 bits".to_owned()));
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(bytes))
}

fn read_u64(word: &[u8]) -> Result<u64> {
    let amount = read_amount(word)?;
    u64::try_from(amount)
        .map_err(|_| Error::InvalidParameter("Value does not fit in 64 bits".to_owned()))
}

fn read_address(bytes: &[u8]) -> Result<Address> {
    let array: [u8; 20] = bytes
        .try_into()
        .map_err(|_| Error::InvalidParameter("Address must be 20 bytes".to_owned()))?;
    Ok(Address(array))
}

fn encode_period(limit: &PeriodLimit) -> Vec<u8> {
    let mut terms = Vec::with_capacity(3 * WORD);
    terms.extend_from_slice(&amount_word(limit.period_amount));
    terms.extend_from_slice(&u64_word(limit.period_duration));
    terms.extend_from_slice(&u64_word(limit.start_date));
    terms
}

fn decode_period(terms: &[u8]) -> Result<PeriodLimit> {
    if terms.len() != 3 * WORD {
        return Err(Error::InvalidParameter("Period terms must be 96 bytes".to_owned()));
    }
    Ok(PeriodLimit {
        period_amount: read_amount(&terms[..WORD])?,
        period_duration: read_u64(&terms[WORD..2 * WORD])?,
        start_date: read_u64(&terms[2 * WORD..])?,
    })
}

fn validate_period(limit: &PeriodLimit) -> Result<()> {
    if limit.period_amount == 0 {
        return Err(Error::InvalidParameter("Period amount must be positive".to_owned()));
    }
    if limit.period_duration == 0 {
        return Err(Error::InvalidParameter("Period duration must be positive".to_owned()));
    }
    Ok(())
}

impl Caveat {
    pub fn native_period(limit: PeriodLimit) -> Result<Self> {
        validate_period(&limit)?;
        Ok(Self {
            enforcer: EnforcerKind::NativeTokenPeriodTransfer,
            terms: encode_period(&limit),
            args: Vec::new(),
        })
    }

    pub fn token_period(limit: TokenPeriodLimit) -> Result<Self> {
        validate_period(&limit.limit)?;
        let mut terms = Vec::with_capacity(20 + 3 * WORD);
        terms.extend_from_slice(limit.token.as_bytes());
        terms.extend_from_slice(&encode_period(&limit.limit));
        Ok(Self {
            enforcer: EnforcerKind::TokenPeriodTransfer,
            terms,
            args: Vec::new(),
        })
    }

    pub fn allowed_targets(targets: &[Address]) -> Result<Self> {
        if targets.is_empty() {
            return Err(Error::InvalidParameter(
                "Allowed target list cannot be empty".to_owned(),
            ));
        }
        Ok(Self {
            enforcer: EnforcerKind::AllowedTargets,
            terms: targets.iter().flat_map(|target| target.0).collect(),
            args: Vec::new(),
        })
    }

    pub fn timestamp(window: TimeWindow) -> Self {
        let mut terms = Vec::with_capacity(32);
        terms.extend_from_slice(&u128::from(window.after).to_be_bytes());
        terms.extend_from_slice(&u128::from(window.before).to_be_bytes());
        Self {
            enforcer: EnforcerKind::Timestamp,
            terms,
            args: Vec::new(),
        }
    }

    pub fn decode_terms(&self) -> Result<CaveatTerms> {
        match self.enforcer {
            EnforcerKind::NativeTokenPeriodTransfer => {
                Ok(CaveatTerms::NativePeriod(decode_period(&self.terms)?))
            }
            EnforcerKind::TokenPeriodTransfer => {
                if self.terms.len() != 20 + 3 * WORD {
                    return Err(Error::InvalidParameter(
                        "Token period terms must be 116 bytes".to_owned(),
                    ));
                }
                Ok(CaveatTerms::TokenPeriod(TokenPeriodLimit {
                    token: read_address(&self.terms[..20])?,
                    limit: decode_period(&self.terms[20..])?,
                }))
            }
            EnforcerKind::AllowedTargets => {
                if self.terms.is_empty() || self.terms.len() % 20 != 0 {
                    return Err(Error::InvalidParameter(
                        "Allowed target terms must be a non-empty list of addresses".to_owned(),
                    ));
                }
                self.terms
                    .chunks(20)
                    .map(read_address)
                    .collect::<Result<Vec<_>>>()
                    .map(CaveatTerms::AllowedTargets)
            }
            EnforcerKind::Timestamp => {
                if self.terms.len() != 32 {
                    return Err(Error::InvalidParameter(
                        "Timestamp terms must be 32 bytes".to_owned(),
                    ));
                }
                let mut padded = [0u8; WORD];
                padded[16..].copy_from_slice(&self.terms[..16]);
                let after = read_u64(&padded)?;
                padded[16..].copy_from_slice(&self.terms[16..]);
                let before = read_u64(&padded)?;
                Ok(CaveatTerms::Timestamp(TimeWindow { after, before }))
            }
        }
    }

    /// Evaluates this caveat against a set of calls redeemed together at `at` (unix seconds).
    pub fn check(&self, calls: &[CallIntent], at: u64, spent: &PeriodSpend) -> Result<()> {
        let enforcer = Some(self.enforcer.name());
        match self.decode_terms()? {
            CaveatTerms::NativePeriod(limit) => {
                let requested: u128 = calls.iter().map(|call| call.value).sum();
                if requested == 0 {
                    return Ok(());
                }
                if limit.period_start(at).is_none() {
                    return Err(Error::denied(enforcer, "allowance period has not started"));
                }
                if spent.native.saturating_add(requested) > limit.period_amount {
                    return Err(Error::denied(
                        enforcer,
                        format!(
                            "native transfer of {requested} exceeds the period allowance of {}",
                            limit.period_amount
                        ),
                    ));
                }
                Ok(())
            }
            CaveatTerms::TokenPeriod(token_limit) => {
                let requested: u128 = calls
                    .iter()
                    .filter_map(|call| call.token_outflow)
                    .filter(|(token, _)| *token == token_limit.token)
                    .map(|(_, amount)| amount)
                    .sum();
                if requested == 0 {
                    return Ok(());
                }
                if token_limit.limit.period_start(at).is_none() {
                    return Err(Error::denied(enforcer, "allowance period has not started"));
                }
                let already = spent
                    .tokens
                    .get(&token_limit.token)
                    .copied()
                    .unwrap_or_default();
                if already.saturating_add(requested) > token_limit.limit.period_amount {
                    return Err(Error::denied(
                        enforcer,
                        format!(
                            "token outflow of {requested} exceeds the period allowance of {}",
                            token_limit.limit.period_amount
                        ),
                    ));
                }
                Ok(())
            }
            CaveatTerms::AllowedTargets(targets) => {
                match calls.iter().find(|call| !targets.contains(&call.target)) {
                    Some(call) => Err(Error::denied(
                        enforcer,
                        format!("target {} is not allowed", call.target),
                    )),
                    None => Ok(()),
                }
            }
            CaveatTerms::Timestamp(window) => {
                if window.after != 0 && at <= window.after {
                    return Err(Error::denied(enforcer, "delegation is not valid yet"));
                }
                if window.before != 0 && at >= window.before {
                    return Err(Error::denied(enforcer, "delegation has expired"));
                }
                Ok(())
            }
        }
    }
}

/// Restrictions a single chain link adds. Omitting one adds nothing of that kind; the
/// ancestors' restrictions still apply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaveatConfig {
    #[serde(default)]
    pub native_period: Option<PeriodLimit>,
    #[serde(default)]
    pub token_period: Option<TokenPeriodLimit>,
    #[serde(default)]
    pub allowed_targets: Option<Vec<Address>>,
    #[serde(default)]
    pub expiry: Option<TimeWindow>,
}

impl CaveatConfig {
    pub fn build(&self) -> Result<Vec<Caveat>> {
        let mut caveats = Vec::new();
        if let Some(limit) = self.native_period {
            caveats.push(Caveat::native_period(limit)?);
        }
        if let Some(limit) = self.token_period {
            caveats.push(Caveat::token_period(limit)?);
        }
        if let Some(targets) = &self.allowed_targets {
            caveats.push(Caveat::allowed_targets(targets)?);
        }
        if let Some(window) = self.expiry {
            caveats.push(Caveat::timestamp(window));
        }
        Ok(caveats)
    }
}

/// Intersection of all restrictions along a chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scope {
    pub native_period_amount: Option<u128>,
    pub token_period_amounts: BTreeMap<Address, u128>,
    pub allowed_targets: Option<BTreeSet<Address>>,
    pub not_before: u64,
    pub not_after: Option<u64>,
}

impl Scope {
    pub fn restrict(&mut self, terms: &CaveatTerms) {
        match terms {
            CaveatTerms::NativePeriod(limit) => {
                self.native_period_amount = Some(
                    self.native_period_amount
                        .map_or(limit.period_amount, |current| current.min(limit.period_amount)),
                );
            }
            CaveatTerms::TokenPeriod(token_limit) => {
                self.token_period_amounts
                    .entry(token_limit.token)
                    .and_modify(|current| {
                        *current = (*current).min(token_limit.limit.period_amount)
                    })
                    .or_insert(token_limit.limit.period_amount);
            }
            CaveatTerms::AllowedTargets(targets) => {
                let incoming: BTreeSet<Address> = targets.iter().copied().collect();
                self.allowed_targets = Some(match self.allowed_targets.take() {
                    Some(current) => current.intersection(&incoming).copied().collect(),
                    None => incoming,
                });
            }
            CaveatTerms::Timestamp(window) => {
                self.not_before = self.not_before.max(window.after);
                if window.before != 0 {
                    self.not_after = Some(
                        self.not_after
                            .map_or(window.before, |current| current.min(window.before)),
                    );
                }
            }
        }
    }

    pub fn permits_target(&self, target: &Address) -> bool {
        self.allowed_targets
            .as_ref()
            .is_none_or(|targets| targets.contains(target))
    }
}
