use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::{
    collaborators::Asset,
    delegation::{Address, SigningDomain},
    executor::ExecutorSettings,
    scheduler::SchedulerSettings,
    Error, Result,
};

/// Config file read when neither `--config` nor `KEEPER_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "keeper.toml";

#[derive(Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_confirmation_timeout", with = "humantime_serde")]
    pub confirmation_timeout: Duration,
    #[serde(default = "default_receipt_poll_interval", with = "humantime_serde")]
    pub receipt_poll_interval: Duration,
    /// How long a claimed schedule may stay `executing` before another tick reclaims it.
    #[serde(default = "default_claim_lease", with = "humantime_serde")]
    pub claim_lease: Duration,

    /// Base58 ed25519 secret of the automation agent. Never logged.
    #[serde(default)]
    pub signer_secret_key: Option<String>,
    /// Who receives the derived sub-delegations. Defaults to the signer itself.
    #[serde(default)]
    pub executor_address: Option<Address>,
    pub chain_id: u64,
    pub delegation_manager: Address,

    pub quote_service_url: Url,
    pub price_oracle_url: Url,
    pub ledger_url: Url,

    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u16,
    #[serde(default = "default_dust_threshold_usd")]
    pub dust_threshold_usd: f64,
    #[serde(default = "default_rebalance_threshold_pct")]
    pub default_rebalance_threshold_pct: f64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Settlement contracts swaps may go through. Empty leaves swap chains unrestricted
    /// by target.
    #[serde(default)]
    pub swap_routers: Vec<Address>,

    #[serde(default)]
    pub assets: BTreeMap<String, Asset>,

    #[serde(default = "default_log")]
    pub log: String,
}

impl Config {
    /// Reads `path` (if it exists) and `KEEPER_*` environment variables, the latter taking
    /// precedence.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "Config file {} not found, using environment variables only",
                path.display()
            );
        }
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path))
                .merge(Env::prefixed("KEEPER_").global()),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| Error::bad_config(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::bad_config("batch_size must be at least 1"));
        }
        if self.max_parallel == 0 {
            return Err(Error::bad_config("max_parallel must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::bad_config("poll_interval must be positive"));
        }
        if self.confirmation_timeout.is_zero() || self.receipt_poll_interval.is_zero() {
            return Err(Error::bad_config(
                "confirmation_timeout and receipt_poll_interval must be positive",
            ));
        }
        if self.claim_lease <= self.confirmation_timeout {
            return Err(Error::bad_config(
                "claim_lease must be longer than confirmation_timeout",
            ));
        }
        if self.slippage_bps >= 10_000 {
            return Err(Error::bad_config("slippage_bps must be below 10000"));
        }
        if !self.dust_threshold_usd.is_finite() || self.dust_threshold_usd < 0.0 {
            return Err(Error::bad_config("dust_threshold_usd must be zero or more"));
        }
        let threshold = self.default_rebalance_threshold_pct;
        if !threshold.is_finite() || threshold <= 0.0 || threshold >= 100.0 {
            return Err(Error::bad_config(
                "default_rebalance_threshold_pct must be between 0 and 100",
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(Error::bad_config("max_consecutive_failures must be at least 1"));
        }
        if self.swap_routers.is_empty() {
            warn!("No swap_routers configured, swap chains will not restrict targets");
        }
        if self.assets.is_empty() {
            warn!("No assets configured, every schedule will be rejected");
        }
        Ok(())
    }

    /// The signer secret, or a configuration error when it is missing.
    pub fn signer_secret_key(&self) -> Result<&str> {
        self.signer_secret_key
            .as_deref()
            .filter(|secret| !secret.trim().is_empty())
            .ok_or_else(|| Error::bad_config("signer_secret_key is required"))
    }

    pub fn signing_domain(&self) -> SigningDomain {
        SigningDomain::new(self.chain_id, self.delegation_manager)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            max_parallel: self.max_parallel,
            claim_lease: self.claim_lease,
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            slippage_bps: self.slippage_bps,
            confirmation_timeout: self.confirmation_timeout,
            receipt_poll_interval: self.receipt_poll_interval,
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = [
            ("Database path", self.database_path.display().to_string()),
            (
                "Poll interval",
                humantime::format_duration(self.poll_interval).to_string(),
            ),
            ("Batch size", self.batch_size.to_string()),
            ("Max parallel executions", self.max_parallel.to_string()),
            (
                "Confirmation timeout",
                humantime::format_duration(self.confirmation_timeout).to_string(),
            ),
            (
                "Claim lease",
                humantime::format_duration(self.claim_lease).to_string(),
            ),
            (
                "Signer secret key",
                match self.signer_secret_key {
                    Some(_) => "set",
                    None => "missing",
                }
                .to_owned(),
            ),
            ("Chain id", self.chain_id.to_string()),
            ("Delegation manager", self.delegation_manager.to_string()),
            ("Quote service", self.quote_service_url.to_string()),
            ("Price oracle", self.price_oracle_url.to_string()),
            ("Ledger", self.ledger_url.to_string()),
            ("Slippage (bps)", self.slippage_bps.to_string()),
            ("Dust threshold (USD)", self.dust_threshold_usd.to_string()),
            (
                "Default rebalance threshold (%)",
                self.default_rebalance_threshold_pct.to_string(),
            ),
            (
                "Max consecutive failures",
                self.max_consecutive_failures.to_string(),
            ),
            (
                "Swap routers",
                self.swap_routers
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            (
                "Assets",
                self.assets.keys().cloned().collect::<Vec<_>>().join(", "),
            ),
        ];

        let mut msg: String = "Active config values:\n\n".to_owned();
        for (name, value) in lines {
            msg += &format!("{name}: {value}\n");
        }
        write!(f, "{msg}")
    }
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "keeper")
        .map(|dirs| dirs.data_dir().join("keeper.db"))
        .unwrap_or_else(|| PathBuf::from("keeper.db"))
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_batch_size() -> usize {
    25
}

fn default_max_parallel() -> usize {
    num_cpus::get()
}

fn default_confirmation_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_receipt_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_claim_lease() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_slippage_bps() -> u16 {
    100
}

fn default_dust_threshold_usd() -> f64 {
    1.0
}

fn default_rebalance_threshold_pct() -> f64 {
    5.0
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_log() -> String {
    "info,keeper=debug".to_owned()
}
