use std::sync::Arc;

use rand::Rng;
use tracing::{info, warn};

use super::{
    first_run_at, next_run_after, ExecutionRecord, Outcome, Recurrence, Schedule, ScheduleParams,
    ScheduleState,
};
use crate::{
    delegation::Address,
    store::{Release, ScheduleStore},
    Error, Result,
};

/// Tolerance when checking that allocation targets add up to 100%.
const TARGET_SUM_TOLERANCE: f64 = 0.01;

/// Everything the upstream tool layer supplies for a new schedule.
#[derive(Clone, Debug, PartialEq)]
pub struct NewSchedule {
    pub wallet: Address,
    pub params: ScheduleParams,
    pub recurrence: Recurrence,
    pub max_executions: Option<u32>,
    pub expires_at: Option<u64>,
}

/// What happened to a claimed schedule once its attempt was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseResult {
    Rescheduled,
    Completed,
    Cancelled,
    Paused,
}

/// Result of a cancellation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelResult {
    Cancelled,
    /// An attempt is in flight; the schedule is cancelled when it resolves.
    Deferred,
    AlreadyCancelled,
}

fn generate_schedule_id() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    format!("sch_{}", hex::encode(bytes))
}

/// Validates type-specific parameters before anything is persisted.
pub fn validate_params(params: &ScheduleParams) -> Result<()> {
    match params {
        ScheduleParams::Transfer { asset, amount, .. } => {
            require_symbol(asset)?;
            require_positive_amount(amount)
        }
        ScheduleParams::SwapSeries {
            sell_asset,
            buy_asset,
            amount,
        } => {
            require_symbol(sell_asset)?;
            require_symbol(buy_asset)?;
            if sell_asset.eq_ignore_ascii_case(buy_asset) {
                return Err(Error::InvalidParameter(
                    "Sell and buy assets must differ".to_owned(),
                ));
            }
            require_positive_amount(amount)
        }
        ScheduleParams::Rebalance {
            targets,
            threshold_pct,
        } => {
            if targets.len() < 2 {
                return Err(Error::InvalidParameter(
                    "A rebalance needs at least two target assets".to_owned(),
                ));
            }
            for (symbol, pct) in targets {
                require_symbol(symbol)?;
                if !pct.is_finite() || *pct < 0.0 || *pct > 100.0 {
                    return Err(Error::InvalidParameter(format!(
                        "Target for {symbol} must be between 0 and 100"
                    )));
                }
            }
            let sum: f64 = targets.values().sum();
            if (sum - 100.0).abs() > TARGET_SUM_TOLERANCE {
                return Err(Error::InvalidParameter(format!(
                    "Target percentages sum to {sum}, expected 100"
                )));
            }
            if !threshold_pct.is_finite() || *threshold_pct <= 0.0 || *threshold_pct >= 100.0 {
                return Err(Error::InvalidParameter(
                    "Rebalance threshold must be between 0 and 100".to_owned(),
                ));
            }
            Ok(())
        }
    }
}

fn require_symbol(symbol: &str) -> Result<()> {
    if symbol.trim().is_empty() {
        return Err(Error::InvalidParameter("Asset symbol cannot be empty".to_owned()));
    }
    Ok(())
}

fn require_positive_amount(amount: &str) -> Result<()> {
    match amount.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => Ok(()),
        _ => Err(Error::InvalidParameter(format!(
            "Amount must be a positive number, got {amount:?}"
        ))),
    }
}

/// CRUD plus the schedule state machine. No execution logic lives here.
pub struct ScheduleRegistry {
    store: Arc<dyn ScheduleStore>,
    max_consecutive_failures: u32,
}

impl ScheduleRegistry {
    pub fn new(store: Arc<dyn ScheduleStore>, max_consecutive_failures: u32) -> Self {
        Self {
            store,
            max_consecutive_failures: max_consecutive_failures.max(1),
        }
    }

    /// Builds (without persisting) a new `active` schedule.
    pub fn prepare(&self, new: NewSchedule, chain_ref: String, now: u64) -> Result<Schedule> {
        validate_params(&new.params)?;
        new.recurrence.validate()?;

        if new.max_executions == Some(0) {
            return Err(Error::InvalidParameter(
                "max_executions must be at least 1".to_owned(),
            ));
        }
        if new.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Err(Error::InvalidParameter(
                "Expiry must be in the future".to_owned(),
            ));
        }

        Ok(Schedule {
            id: generate_schedule_id(),
            kind: new.params.kind(),
            wallet: new.wallet,
            chain_ref,
            params: new.params,
            recurrence: new.recurrence,
            state: ScheduleState::Active,
            next_run_at: first_run_at(&new.recurrence, now)?,
            execution_count: 0,
            max_executions: new.max_executions,
            expires_at: new.expires_at,
            consecutive_failures: 0,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        })
    }

    pub fn insert(&self, schedule: &Schedule) -> Result<()> {
        self.store.insert_schedule(schedule)?;
        info!(
            "Created {} schedule {} for {} (first run at {})",
            schedule.kind, schedule.id, schedule.wallet, schedule.next_run_at
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Schedule> {
        self.store
            .schedule(id)?
            .ok_or_else(|| Error::NotFound(format!("Schedule {id}")))
    }

    pub fn list(&self, wallet: Option<&Address>) -> Result<Vec<Schedule>> {
        self.store.schedules(wallet)
    }

    pub fn history(&self, id: &str) -> Result<Vec<ExecutionRecord>> {
        self.store.history(id)
    }

    pub fn due(&self, now: u64, limit: usize) -> Result<Vec<Schedule>> {
        self.store.due_schedules(now, limit)
    }

    /// `active -> executing` for a due schedule. Only one caller can win.
    pub fn claim_due(&self, id: &str, now: u64) -> Result<bool> {
        self.store.try_claim(id, Some(now), now)
    }

    /// `active -> executing` regardless of `next_run_at`, for manual triggers.
    pub fn claim_now(&self, id: &str, now: u64) -> Result<bool> {
        self.store.try_claim(id, None, now)
    }

    /// `active -> completed` without any ledger interaction.
    pub fn complete_exhausted(&self, id: &str, reason: &str, now: u64) -> Result<bool> {
        let record = ExecutionRecord::expired(now, reason);
        let completed = self.store.transition(
            id,
            ScheduleState::Active,
            ScheduleState::Completed,
            None,
            Some(&record),
            now,
        )?;
        if completed {
            info!("Schedule {} completed without execution: {}", id, reason);
        }
        Ok(completed)
    }

    /// Releases a claimed schedule after a successful attempt.
    pub fn release_success(
        &self,
        schedule: &Schedule,
        tx_ref: Option<String>,
        message: Option<String>,
        now: u64,
    ) -> Result<ReleaseResult> {
        let execution_count = schedule.execution_count.saturating_add(1);
        let next_run_at = next_run_after(&schedule.recurrence, schedule.next_run_at, now)?;

        let budget_spent = schedule
            .max_executions
            .is_some_and(|max| execution_count >= max);
        let time_spent = schedule
            .expires_at
            .is_some_and(|expires_at| next_run_at >= expires_at);

        let state = if budget_spent || time_spent {
            ScheduleState::Completed
        } else {
            ScheduleState::Active
        };

        let release = Release {
            state,
            next_run_at,
            execution_count,
            consecutive_failures: 0,
            record: ExecutionRecord::success(now, tx_ref, message),
        };
        let stored = self.store.release(&schedule.id, &release, now)?;
        Ok(release_result(stored))
    }

    /// Releases a claimed schedule after a failed attempt. `next_run_at` is left alone so
    /// the schedule is retried on the next tick, until the failure budget pauses it.
    pub fn release_failure(
        &self,
        schedule: &Schedule,
        error: &Error,
        tx_ref: Option<String>,
        now: u64,
    ) -> Result<ReleaseResult> {
        let consecutive_failures = schedule.consecutive_failures.saturating_add(1);
        let trip = consecutive_failures >= self.max_consecutive_failures;

        let mut record = ExecutionRecord::failure(now, error, tx_ref);
        let state = if trip {
            warn!(
                "Schedule {} failed {} times in a row, pausing it",
                schedule.id, consecutive_failures
            );
            record.outcome = Outcome::CircuitOpen;
            ScheduleState::Paused
        } else {
            ScheduleState::Active
        };

        let release = Release {
            state,
            next_run_at: schedule.next_run_at,
            execution_count: schedule.execution_count,
            consecutive_failures,
            record,
        };
        let stored = self.store.release(&schedule.id, &release, now)?;
        Ok(release_result(stored))
    }

    /// Returns a claimed schedule to `active` without charging its failure budget and
    /// records why. Used when an attempt cannot be released normally or was stopped by a
    /// problem outside the schedule. `None` if the claim was already released.
    pub fn abandon_claim(
        &self,
        id: &str,
        error: &Error,
        tx_ref: Option<String>,
        now: u64,
    ) -> Result<Option<ReleaseResult>> {
        let record = ExecutionRecord::failure(now, error, tx_ref);
        Ok(self
            .store
            .abandon_claim(id, &record, now)?
            .map(release_result))
    }

    /// Schedules still `executing` with no update since `claimed_before`.
    pub fn stale_claims(&self, claimed_before: u64, limit: usize) -> Result<Vec<String>> {
        self.store.stale_claims(claimed_before, limit)
    }

    /// Cancels from `active` or `paused`; defers while `executing`.
    pub fn cancel(&self, id: &str, now: u64) -> Result<CancelResult> {
        // A claim can land between any two of these steps, so each one is a conditional
        // update and the loop retries until one of them applies.
        for _ in 0..3 {
            let schedule = self.get(id)?;
            match schedule.state {
                ScheduleState::Cancelled => return Ok(CancelResult::AlreadyCancelled),
                ScheduleState::Completed => {
                    return Err(Error::InvalidState(format!(
                        "Schedule {id} already completed"
                    )))
                }
                ScheduleState::Executing => {
                    if self.store.request_cancel(id, now)? {
                        info!("Cancellation of {} deferred until its attempt resolves", id);
                        return Ok(CancelResult::Deferred);
                    }
                }
                from @ (ScheduleState::Active | ScheduleState::Paused) => {
                    if self.store.transition(
                        id,
                        from,
                        ScheduleState::Cancelled,
                        None,
                        None,
                        now,
                    )? {
                        info!("Schedule {} cancelled", id);
                        return Ok(CancelResult::Cancelled);
                    }
                }
            }
        }

        Err(Error::InvalidState(format!(
            "Schedule {id} kept changing state during cancellation"
        )))
    }

    pub fn pause(&self, id: &str, now: u64) -> Result<()> {
        if self
            .store
            .transition(id, ScheduleState::Active, ScheduleState::Paused, None, None, now)?
        {
            info!("Schedule {} paused", id);
            return Ok(());
        }
        let schedule = self.get(id)?;
        Err(Error::InvalidState(format!(
            "Schedule {id} is {} and cannot be paused",
            schedule.state
        )))
    }

    /// `paused -> active`. A run time that passed while paused moves to the next slot.
    pub fn resume(&self, id: &str, now: u64) -> Result<()> {
        let schedule = self.get(id)?;
        if schedule.state != ScheduleState::Paused {
            return Err(Error::InvalidState(format!(
                "Schedule {id} is {} and cannot be resumed",
                schedule.state
            )));
        }

        let next_run_at = if schedule.next_run_at < now {
            next_run_after(&schedule.recurrence, schedule.next_run_at, now)?
        } else {
            schedule.next_run_at
        };

        if self.store.transition(
            id,
            ScheduleState::Paused,
            ScheduleState::Active,
            Some(next_run_at),
            None,
            now,
        )? {
            info!("Schedule {} resumed, next run at {}", id, next_run_at);
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "Schedule {id} changed state while resuming"
            )))
        }
    }
}

fn release_result(state: ScheduleState) -> ReleaseResult {
    match state {
        ScheduleState::Completed => ReleaseResult::Completed,
        ScheduleState::Cancelled => ReleaseResult::Cancelled,
        ScheduleState::Paused => ReleaseResult::Paused,
        ScheduleState::Active | ScheduleState::Executing => ReleaseResult::Rescheduled,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        schedule::{Frequency, Recurrence},
        store::MemoryStore,
    };

    const HOUR: u64 = 3_600_000;

    fn registry(max_failures: u32) -> ScheduleRegistry {
        ScheduleRegistry::new(Arc::new(MemoryStore::new()), max_failures)
    }

    fn transfer(max_executions: Option<u32>, expires_at: Option<u64>) -> NewSchedule {
        NewSchedule {
            wallet: Address([1; 20]),
            params: ScheduleParams::Transfer {
                asset: "USDC".to_owned(),
                amount: "25".to_owned(),
                recipient: Address([2; 20]),
            },
            recurrence: Recurrence::every(Frequency::Hourly),
            max_executions,
            expires_at,
        }
    }

    fn created(registry: &ScheduleRegistry, new: NewSchedule, now: u64) -> Schedule {
        let schedule = registry.prepare(new, "0xleaf".to_owned(), now).unwrap();
        registry.insert(&schedule).unwrap();
        schedule
    }

    #[test]
    fn new_schedules_start_active_and_due() {
        let registry = registry(3);
        let schedule = created(&registry, transfer(None, None), 1_000);
        assert_eq!(schedule.state, ScheduleState::Active);
        assert_eq!(registry.due(1_000, 10).unwrap().len(), 1);
        assert!(schedule.id.starts_with("sch_"));
    }

    #[test]
    fn rejects_invalid_parameters() {
        let registry = registry(3);
        let mut bad_targets = transfer(None, None);
        bad_targets.params = ScheduleParams::Rebalance {
            targets: BTreeMap::from([("ETH".to_owned(), 60.0), ("USDC".to_owned(), 30.0)]),
            threshold_pct: 5.0,
        };
        assert!(registry.prepare(bad_targets, String::new(), 0).is_err());
        assert!(registry.prepare(transfer(Some(0), None), String::new(), 0).is_err());
        assert!(registry.prepare(transfer(None, Some(10)), String::new(), 10).is_err());

        let mut bad_amount = transfer(None, None);
        bad_amount.params = ScheduleParams::Transfer {
            asset: "ETH".to_owned(),
            amount: "-1".to_owned(),
            recipient: Address([2; 20]),
        };
        assert!(registry.prepare(bad_amount, String::new(), 0).is_err());
    }

    #[test]
    fn claim_is_exclusive() {
        let registry = registry(3);
        let schedule = created(&registry, transfer(None, None), 1_000);
        assert!(registry.claim_due(&schedule.id, 1_000).unwrap());
        assert!(!registry.claim_due(&schedule.id, 1_000).unwrap());
        assert!(!registry.claim_now(&schedule.id, 1_000).unwrap());
    }

    #[test]
    fn schedules_are_not_claimed_before_they_are_due() {
        let registry = registry(3);
        let schedule = created(&registry, transfer(None, None), 1_000);
        assert!(!registry.claim_due(&schedule.id, 999).unwrap());
        assert!(registry.claim_now(&schedule.id, 999).unwrap());
    }

    #[test]
    fn single_run_schedule_completes_after_first_success() {
        let registry = registry(3);
        let schedule = created(&registry, transfer(Some(1), None), 1_000);
        assert!(registry.claim_due(&schedule.id, 1_000).unwrap());

        let claimed = registry.get(&schedule.id).unwrap();
        let result = registry
            .release_success(&claimed, Some("0xtx".to_owned()), None, 1_500)
            .unwrap();
        assert_eq!(result, ReleaseResult::Completed);

        let stored = registry.get(&schedule.id).unwrap();
        assert_eq!(stored.state, ScheduleState::Completed);
        assert_eq!(stored.execution_count, 1);
        assert_eq!(stored.history.len(), 1);
        assert!(registry.due(u64::MAX, 10).unwrap().is_empty());
        assert!(!registry.claim_now(&schedule.id, 10 * HOUR).unwrap());
    }

    #[test]
    fn success_advances_next_run() {
        let registry = registry(3);
        let schedule = created(&registry, transfer(None, None), 1_000);
        registry.claim_due(&schedule.id, 1_000).unwrap();
        let claimed = registry.get(&schedule.id).unwrap();
        registry.release_success(&claimed, None, None, 1_200).unwrap();

        let stored = registry.get(&schedule.id).unwrap();
        assert_eq!(stored.state, ScheduleState::Active);
        assert_eq!(stored.next_run_at, 1_000 + HOUR);
    }

    #[test]
    fn success_before_expiry_completes_when_next_run_would_be_late() {
        let registry = registry(3);
        let schedule = created(&registry, transfer(None, Some(1_000 + HOUR / 2)), 1_000);
        registry.claim_due(&schedule.id, 1_000).unwrap();
        let claimed = registry.get(&schedule.id).unwrap();
        assert_eq!(
            registry.release_success(&claimed, None, None, 1_100).unwrap(),
            ReleaseResult::Completed
        );
    }

    #[test]
    fn failure_keeps_next_run_and_records_the_error() {
        let registry = registry(3);
        let schedule = created(&registry, transfer(None, None), 1_000);
        registry.claim_due(&schedule.id, 1_000).unwrap();
        let claimed = registry.get(&schedule.id).unwrap();
        registry
            .release_failure(&claimed, &Error::transient("ledger down"), None, 1_100)
            .unwrap();

        let stored = registry.get(&schedule.id).unwrap();
        assert_eq!(stored.state, ScheduleState::Active);
        assert_eq!(stored.next_run_at, schedule.next_run_at);
        assert_eq!(stored.consecutive_failures, 1);
        assert_eq!(stored.history[0].outcome, Outcome::Failure);
        assert_eq!(stored.history[0].error_kind.as_deref(), Some("transient"));
    }

    #[test]
    fn repeated_failures_pause_the_schedule() {
        let registry = registry(2);
        let schedule = created(&registry, transfer(None, None), 1_000);
        for attempt in 0..2 {
            assert!(registry.claim_due(&schedule.id, 1_000 + attempt).unwrap());
            let claimed = registry.get(&schedule.id).unwrap();
            registry
                .release_failure(&claimed, &Error::transient("down"), None, 1_000 + attempt)
                .unwrap();
        }
        let stored = registry.get(&schedule.id).unwrap();
        assert_eq!(stored.state, ScheduleState::Paused);
        assert_eq!(stored.history.last().unwrap().outcome, Outcome::CircuitOpen);
    }

    #[test]
    fn abandoned_claims_keep_the_failure_budget() {
        let registry = registry(1);
        let schedule = created(&registry, transfer(None, None), 1_000);
        registry.claim_due(&schedule.id, 1_000).unwrap();

        let error = Error::Configuration("missing ledger key".to_owned());
        assert_eq!(
            registry
                .abandon_claim(&schedule.id, &error, None, 1_100)
                .unwrap(),
            Some(ReleaseResult::Rescheduled)
        );
        assert_eq!(
            registry
                .abandon_claim(&schedule.id, &error, None, 1_200)
                .unwrap(),
            None
        );

        let stored = registry.get(&schedule.id).unwrap();
        assert_eq!(stored.state, ScheduleState::Active);
        assert_eq!(stored.consecutive_failures, 0);
        assert_eq!(stored.next_run_at, schedule.next_run_at);
        assert_eq!(stored.history[0].error_kind.as_deref(), Some("configuration"));
    }

    #[test]
    fn cancellation_while_executing_is_deferred() {
        let registry = registry(3);
        let schedule = created(&registry, transfer(None, None), 1_000);
        registry.claim_due(&schedule.id, 1_000).unwrap();

        assert_eq!(
            registry.cancel(&schedule.id, 1_050).unwrap(),
            CancelResult::Deferred
        );
        assert_eq!(
            registry.get(&schedule.id).unwrap().state,
            ScheduleState::Executing
        );

        let claimed = registry.get(&schedule.id).unwrap();
        assert_eq!(
            registry.release_success(&claimed, None, None, 1_100).unwrap(),
            ReleaseResult::Cancelled
        );
        assert_eq!(
            registry.cancel(&schedule.id, 1_200).unwrap(),
            CancelResult::AlreadyCancelled
        );
    }

    #[test]
    fn terminal_states_are_never_reopened() {
        let registry = registry(3);
        let schedule = created(&registry, transfer(None, None), 1_000);
        assert!(registry
            .complete_exhausted(&schedule.id, "Schedule expired", 1_000)
            .unwrap());
        assert!(registry.cancel(&schedule.id, 1_001).is_err());
        assert!(registry.resume(&schedule.id, 1_001).is_err());
        assert!(registry.pause(&schedule.id, 1_001).is_err());
        assert!(!registry.claim_now(&schedule.id, 1_001).unwrap());
    }

    #[test]
    fn resume_skips_missed_runs() {
        let registry = registry(3);
        let schedule = created(&registry, transfer(None, None), 1_000);
        registry.pause(&schedule.id, 1_000).unwrap();
        registry.resume(&schedule.id, 1_000 + 3 * HOUR + 5).unwrap();

        let stored = registry.get(&schedule.id).unwrap();
        assert_eq!(stored.state, ScheduleState::Active);
        assert_eq!(stored.next_run_at, 1_000 + 4 * HOUR);
    }
}
