//! Inbound surface for the upstream tool layer: create, preview, list, pause, resume,
//! cancel and trigger schedules.

mod preview;

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use preview::Preview;

use crate::{
    collaborators::{parse_units, Asset, AssetRegistry, Ledger, PriceOracle, QuoteService},
    config::Config,
    delegation::{
        Address, CaveatConfig, PeriodLimit, PermissionChain, PermissionChainBuilder, TimeWindow,
        TokenPeriodLimit,
    },
    executor::Executor,
    planner::RebalancingPlanner,
    schedule::{
        registry::{validate_params, CancelResult, NewSchedule},
        first_run_at, ExecutionRecord, Frequency, Recurrence, Schedule, ScheduleParams,
        ScheduleRegistry,
    },
    scheduler::{ExecutionScheduler, Processed},
    store::{PermissionStore, ScheduleStore, StoredChain},
    Error, Result,
};

/// Timing shared by every schedule type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub recurrence: Recurrence,
    #[serde(default)]
    pub max_executions: Option<u32>,
    /// Unix milliseconds.
    #[serde(default)]
    pub expires_at: Option<u64>,
}

/// The user's grant to the automation agent, as opaque chain bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub wallet: Address,
    #[serde(with = "crate::delegation::hex_bytes")]
    pub parent_chain: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub grant: Grant,
    pub asset: String,
    pub amount: String,
    pub recipient: Address,
    pub timing: Timing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwapSeriesRequest {
    pub grant: Grant,
    pub sell_asset: String,
    pub buy_asset: String,
    pub amount: String,
    pub timing: Timing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRequest {
    pub grant: Grant,
    pub targets: BTreeMap<String, f64>,
    #[serde(default)]
    pub threshold_pct: Option<f64>,
    pub timing: Timing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Created {
    pub id: String,
    pub preview: Preview,
}

/// Length of one allowance period for a recurrence, in seconds. Consecutive runs are never
/// closer than this, so each period holds at most one on-time run.
fn period_seconds(frequency: Frequency) -> u64 {
    match frequency {
        Frequency::Hourly => 3_600,
        Frequency::Daily => 86_400,
        Frequency::Weekly => 7 * 86_400,
        // Shortest month.
        Frequency::Monthly => 28 * 86_400,
    }
}

/// Allowance period of a schedule created at `now`, as `(duration, start)` in unix seconds.
///
/// Periods are aligned to the first run slot. When that slot is still ahead, the start is
/// moved back whole periods so a run triggered right away has a period of its own.
fn allowance_period(recurrence: &Recurrence, now: u64) -> Result<(u64, u64)> {
    let duration = period_seconds(recurrence.frequency);
    let first_slot = first_run_at(recurrence, now)? / 1000;
    let now = now / 1000;
    let start = if first_slot > now {
        first_slot.saturating_sub((first_slot - now).div_ceil(duration) * duration)
    } else {
        first_slot
    };
    Ok((duration, start))
}

pub struct AutomationService {
    builder: PermissionChainBuilder,
    delegate: Address,
    assets: AssetRegistry,
    registry: Arc<ScheduleRegistry>,
    permissions: Arc<dyn PermissionStore>,
    scheduler: Arc<ExecutionScheduler>,
    default_threshold_pct: f64,
    swap_routers: Vec<Address>,
}

impl AutomationService {
    /// Wires every component from `config` over one shared store.
    pub fn from_config<S>(
        config: &Config,
        store: Arc<S>,
        quotes: Arc<dyn QuoteService>,
        prices: Arc<dyn PriceOracle>,
        ledger: Arc<dyn Ledger>,
    ) -> Result<Self>
    where
        S: ScheduleStore + PermissionStore + 'static,
    {
        let builder = PermissionChainBuilder::from_base58_secret(
            config.signer_secret_key()?,
            config.signing_domain(),
        )?;
        let assets = AssetRegistry::new(&config.assets)?;
        let permissions: Arc<dyn PermissionStore> = store.clone();
        let registry = Arc::new(ScheduleRegistry::new(
            store,
            config.max_consecutive_failures,
        ));
        let executor = Arc::new(Executor::new(
            permissions.clone(),
            assets.clone(),
            quotes,
            prices,
            ledger,
            RebalancingPlanner::new(config.dust_threshold_usd),
            config.signing_domain(),
            config.executor_settings(),
        ));
        let scheduler = Arc::new(ExecutionScheduler::new(
            registry.clone(),
            executor,
            permissions.clone(),
            config.scheduler_settings(),
        ));

        Ok(Self {
            delegate: config.executor_address.unwrap_or_else(|| builder.address()),
            builder,
            assets,
            registry,
            permissions,
            scheduler,
            default_threshold_pct: config.default_rebalance_threshold_pct,
            swap_routers: config.swap_routers.clone(),
        })
    }

    pub fn scheduler(&self) -> Arc<ExecutionScheduler> {
        self.scheduler.clone()
    }

    /// Address the user's root grant must delegate to.
    pub fn agent_address(&self) -> Address {
        self.builder.address()
    }

    fn transfer_params(&self, request: &TransferRequest) -> ScheduleParams {
        ScheduleParams::Transfer {
            asset: request.asset.trim().to_ascii_uppercase(),
            amount: request.amount.trim().to_owned(),
            recipient: request.recipient,
        }
    }

    fn swap_params(&self, request: &SwapSeriesRequest) -> ScheduleParams {
        ScheduleParams::SwapSeries {
            sell_asset: request.sell_asset.trim().to_ascii_uppercase(),
            buy_asset: request.buy_asset.trim().to_ascii_uppercase(),
            amount: request.amount.trim().to_owned(),
        }
    }

    fn rebalance_params(&self, request: &RebalanceRequest) -> ScheduleParams {
        ScheduleParams::Rebalance {
            targets: request
                .targets
                .iter()
                .map(|(symbol, pct)| (symbol.trim().to_ascii_uppercase(), *pct))
                .collect(),
            threshold_pct: request.threshold_pct.unwrap_or(self.default_threshold_pct),
        }
    }

    pub fn preview_transfer(&self, request: &TransferRequest, now: u64) -> Result<Preview> {
        self.preview(&self.transfer_params(request), &request.timing, now)
    }

    pub fn preview_swap_series(&self, request: &SwapSeriesRequest, now: u64) -> Result<Preview> {
        self.preview(&self.swap_params(request), &request.timing, now)
    }

    pub fn preview_rebalance(&self, request: &RebalanceRequest, now: u64) -> Result<Preview> {
        self.preview(&self.rebalance_params(request), &request.timing, now)
    }

    pub fn create_transfer(&self, request: &TransferRequest, now: u64) -> Result<Created> {
        self.create(&request.grant, self.transfer_params(request), &request.timing, now)
    }

    pub fn create_swap_series(&self, request: &SwapSeriesRequest, now: u64) -> Result<Created> {
        self.create(&request.grant, self.swap_params(request), &request.timing, now)
    }

    pub fn create_rebalance(&self, request: &RebalanceRequest, now: u64) -> Result<Created> {
        self.create(&request.grant, self.rebalance_params(request), &request.timing, now)
    }

    fn preview(&self, params: &ScheduleParams, timing: &Timing, now: u64) -> Result<Preview> {
        validate_params(params)?;
        self.check_assets(params)?;
        Preview::new(params, timing, now)
    }

    fn check_assets(&self, params: &ScheduleParams) -> Result<()> {
        let symbols: Vec<&str> = match params {
            ScheduleParams::Transfer { asset, .. } => vec![asset.as_str()],
            ScheduleParams::SwapSeries {
                sell_asset,
                buy_asset,
                ..
            } => vec![sell_asset.as_str(), buy_asset.as_str()],
            ScheduleParams::Rebalance { targets, .. } => {
                targets.keys().map(String::as_str).collect()
            }
        };
        for symbol in symbols {
            self.assets.get(symbol)?;
        }
        if let ScheduleParams::Transfer { asset, amount, .. }
        | ScheduleParams::SwapSeries {
            sell_asset: asset,
            amount,
            ..
        } = params
        {
            parse_units(amount, self.assets.get(asset)?.decimals)?;
        }
        Ok(())
    }

    /// Restrictions for the chain that lets the worker move `symbol` for this schedule.
    fn caveats_for(
        &self,
        params: &ScheduleParams,
        symbol: &str,
        asset: &Asset,
        timing: &Timing,
        now: u64,
    ) -> Result<CaveatConfig> {
        let mut config = CaveatConfig {
            expiry: timing.expires_at.map(|expires_at| TimeWindow {
                after: 0,
                before: expires_at.div_ceil(1000),
            }),
            ..CaveatConfig::default()
        };

        let per_run = match params {
            ScheduleParams::Transfer { amount, .. } | ScheduleParams::SwapSeries { amount, .. } => {
                Some(parse_units(amount, asset.decimals)?)
            }
            // How much a rebalance sells depends on prices at run time.
            ScheduleParams::Rebalance { .. } => None,
        };
        if let Some(per_run) = per_run {
            let (period_duration, start_date) = allowance_period(&timing.recurrence, now)?;
            let limit = PeriodLimit {
                period_amount: per_run,
                period_duration,
                start_date,
            };
            match asset.address {
                Some(token) => config.token_period = Some(TokenPeriodLimit { token, limit }),
                None => config.native_period = Some(limit),
            }
        }

        match params {
            ScheduleParams::Transfer { recipient, .. } => {
                config.allowed_targets = Some(vec![asset.address.unwrap_or(*recipient)]);
            }
            // Swaps may only settle through a configured router, after approving it on
            // the sold token.
            ScheduleParams::SwapSeries { .. } | ScheduleParams::Rebalance { .. }
                if !self.swap_routers.is_empty() =>
            {
                let mut targets = self.swap_routers.clone();
                targets.extend(asset.address);
                config.allowed_targets = Some(targets);
            }
            _ => {}
        }

        debug!(
            "Narrowing {} allowance for {}: {:?}",
            symbol, params.kind(), config
        );
        Ok(config)
    }

    fn create(
        &self,
        grant: &Grant,
        params: ScheduleParams,
        timing: &Timing,
        now: u64,
    ) -> Result<Created> {
        let preview = self.preview(&params, timing, now)?;

        let parent = PermissionChain::decode(&grant.parent_chain).map_err(|e| {
            Error::bad_config(format!("Parent permission chain is undecodable: {e}"))
        })?;
        match parent.root() {
            Some(root) if root.delegator == grant.wallet => {}
            _ => {
                return Err(Error::integrity(format!(
                    "Permission chain was not granted by wallet {}",
                    grant.wallet
                )))
            }
        }

        let mut schedule = self.registry.prepare(
            NewSchedule {
                wallet: grant.wallet,
                params,
                recurrence: timing.recurrence,
                max_executions: timing.max_executions,
                expires_at: timing.expires_at,
            },
            String::new(),
            now,
        )?;

        // Derive every chain before storing anything.
        let mut chains = Vec::new();
        for symbol in schedule.params.outgoing_assets() {
            let asset = self.assets.get(&symbol)?;
            let caveats = self.caveats_for(&schedule.params, &symbol, asset, timing, now)?;
            let (leaf, chain) = self.builder.build_sub_delegation(
                Some(&grant.parent_chain),
                self.delegate,
                &caveats,
            )?;
            chains.push(StoredChain {
                wallet: grant.wallet,
                schedule_id: schedule.id.clone(),
                asset: Some(symbol),
                chain: chain.encode()?,
                leaf_hash: leaf.hash(),
                created_at: now,
                revoked_at: None,
            });
        }
        schedule.chain_ref = chains
            .first()
            .map(|stored| stored.leaf_hash.to_string())
            .unwrap_or_default();

        if let Err(e) = self.persist(&schedule, &chains) {
            warn!("Rolling back schedule {}: {}", schedule.id, e);
            if let Err(revoke_error) = self.permissions.revoke_chains(&schedule.id, now) {
                warn!(
                    "Could not revoke chains of {}: {}",
                    schedule.id, revoke_error
                );
            }
            return Err(e);
        }

        Ok(Created {
            id: schedule.id,
            preview,
        })
    }

    fn persist(&self, schedule: &Schedule, chains: &[StoredChain]) -> Result<()> {
        for chain in chains {
            self.permissions.put_chain(chain)?;
        }
        self.registry.insert(schedule)
    }

    pub fn get(&self, id: &str) -> Result<Schedule> {
        self.registry.get(id)
    }

    pub fn list(&self, wallet: Option<&Address>) -> Result<Vec<Schedule>> {
        self.registry.list(wallet)
    }

    pub fn history(&self, id: &str) -> Result<Vec<ExecutionRecord>> {
        self.registry.history(id)
    }

    pub fn chains(&self, id: &str) -> Result<Vec<StoredChain>> {
        self.permissions.chains_for_schedule(id)
    }

    /// Cancels the schedule and revokes its chains. While an attempt is in flight the
    /// cancellation (and revocation) happens once the attempt resolves.
    pub fn cancel(&self, id: &str, now: u64) -> Result<CancelResult> {
        let result = self.registry.cancel(id, now)?;
        if result != CancelResult::Deferred {
            let revoked = self.permissions.revoke_chains(id, now)?;
            if revoked > 0 {
                info!("Revoked {} permission chain(s) of {}", revoked, id);
            }
        }
        Ok(result)
    }

    pub fn pause(&self, id: &str, now: u64) -> Result<()> {
        self.registry.pause(id, now)
    }

    pub fn resume(&self, id: &str, now: u64) -> Result<()> {
        self.registry.resume(id, now)
    }

    pub async fn trigger_now(&self, id: &str, now: u64) -> Result<Processed> {
        self.scheduler.trigger_now(id, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    use crate::{
        schedule::{next_run_after, TimeOfDay},
        utils::datetime_to_millis,
    };

    fn millis(text: &str) -> u64 {
        datetime_to_millis(
            DateTime::parse_from_rfc3339(text)
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    fn limit(recurrence: &Recurrence, created: u64) -> PeriodLimit {
        let (period_duration, start_date) = allowance_period(recurrence, created).unwrap();
        PeriodLimit {
            period_amount: 25,
            period_duration,
            start_date,
        }
    }

    #[test]
    fn monthly_runs_land_in_separate_allowance_periods() {
        let recurrence = Recurrence::every(Frequency::Monthly);
        let created = millis("2026-01-31T10:00:00Z");
        let limit = limit(&recurrence, created);

        let mut run = first_run_at(&recurrence, created).unwrap();
        let mut periods = Vec::new();
        for _ in 0..24 {
            periods.push(limit.period_start(run / 1000).unwrap());
            run = next_run_after(&recurrence, run, run).unwrap();
        }
        let runs = periods.len();
        periods.dedup();
        assert_eq!(periods.len(), runs);
    }

    #[test]
    fn pinned_periods_start_on_the_run_slot() {
        let recurrence = Recurrence {
            frequency: Frequency::Daily,
            time_of_day: Some(TimeOfDay { hour: 9, minute: 0 }),
            utc_offset_minutes: 0,
        };
        let created = millis("2026-03-01T10:00:00Z");
        let limit = limit(&recurrence, created);
        assert_eq!(limit.start_date, millis("2026-03-01T09:00:00Z") / 1000);

        // Triggered right away, then run a few minutes late on each slot.
        let first = first_run_at(&recurrence, created).unwrap();
        let triggered = limit.period_start(created / 1000);
        let late_first = limit.period_start((first + 50 * 60_000) / 1000);
        let second = next_run_after(&recurrence, first, first).unwrap();
        let on_time_second = limit.period_start(second / 1000);
        assert!(triggered.is_some());
        assert_ne!(triggered, late_first);
        assert_ne!(late_first, on_time_second);
    }

    #[test]
    fn unpinned_periods_start_at_creation() {
        let created = millis("2026-03-01T10:00:30Z");
        let (duration, start) =
            allowance_period(&Recurrence::every(Frequency::Hourly), created).unwrap();
        assert_eq!(duration, 3_600);
        assert_eq!(start, created / 1000);
    }
}
