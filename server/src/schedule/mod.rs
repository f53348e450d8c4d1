//! Schedule records and their lifecycle.

mod frequency;
pub mod registry;

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub use frequency::{first_run_at, next_run_after, Frequency, Recurrence, TimeOfDay};
pub use registry::ScheduleRegistry;

use crate::{delegation::Address, Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Transfer,
    SwapSeries,
    Rebalance,
}

impl ScheduleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transfer => "transfer",
            Self::SwapSeries => "swap_series",
            Self::Rebalance => "rebalance",
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `active -> executing -> {active | completed | cancelled}`, with `paused` as a manual
/// side-state. `completed` and `cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    Active,
    Executing,
    Paused,
    Completed,
    Cancelled,
}

impl ScheduleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleState {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "active" => Ok(Self::Active),
            "executing" => Ok(Self::Executing),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::InvalidState(format!("Unknown schedule state: {other}"))),
        }
    }
}

/// Type-specific parameters. Amounts are decimal strings in whole token units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleParams {
    Transfer {
        asset: String,
        amount: String,
        recipient: Address,
    },
    SwapSeries {
        sell_asset: String,
        buy_asset: String,
        amount: String,
    },
    Rebalance {
        /// Symbol to target percentage. Percentages sum to 100.
        targets: BTreeMap<String, f64>,
        threshold_pct: f64,
    },
}

impl ScheduleParams {
    pub fn kind(&self) -> ScheduleKind {
        match self {
            Self::Transfer { .. } => ScheduleKind::Transfer,
            Self::SwapSeries { .. } => ScheduleKind::SwapSeries,
            Self::Rebalance { .. } => ScheduleKind::Rebalance,
        }
    }

    /// Assets that move out of the wallet, each of which gets its own permission chain.
    pub fn outgoing_assets(&self) -> Vec<String> {
        match self {
            Self::Transfer { asset, .. } => vec![asset.clone()],
            Self::SwapSeries { sell_asset, .. } => vec![sell_asset.clone()],
            Self::Rebalance { targets, .. } => targets.keys().cloned().collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    /// Budget or expiry reached before anything was submitted.
    Expired,
    /// Too many consecutive failures; the schedule was paused.
    CircuitOpen,
}

/// One immutable entry of a schedule's execution history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub at: u64,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionRecord {
    pub fn success(at: u64, tx_ref: Option<String>, message: Option<String>) -> Self {
        Self {
            at,
            outcome: Outcome::Success,
            tx_ref,
            error_kind: None,
            message,
        }
    }

    pub fn failure(at: u64, error: &Error, tx_ref: Option<String>) -> Self {
        Self {
            at,
            outcome: Outcome::Failure,
            tx_ref,
            error_kind: Some(error.kind().to_owned()),
            message: Some(error.to_string()),
        }
    }

    pub fn expired(at: u64, reason: &str) -> Self {
        Self {
            at,
            outcome: Outcome::Expired,
            tx_ref: None,
            error_kind: Some("expired_or_exhausted".to_owned()),
            message: Some(reason.to_owned()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub kind: ScheduleKind,
    pub wallet: Address,
    /// Hash of the primary chain's leaf delegation.
    pub chain_ref: String,
    pub params: ScheduleParams,
    pub recurrence: Recurrence,
    pub state: ScheduleState,
    /// Unix milliseconds.
    pub next_run_at: u64,
    pub execution_count: u32,
    pub max_executions: Option<u32>,
    /// Unix milliseconds.
    pub expires_at: Option<u64>,
    pub consecutive_failures: u32,
    pub cancel_requested: bool,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub history: Vec<ExecutionRecord>,
}

impl Schedule {
    /// Why the schedule may not run at `now`, if it may not.
    pub fn exhaustion(&self, now: u64) -> Option<String> {
        if let Some(max) = self.max_executions {
            if self.execution_count >= max {
                return Some(format!("Reached the maximum of {max} executions"));
            }
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return Some("Schedule expired".to_owned());
            }
        }
        None
    }
}
