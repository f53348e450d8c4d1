//! The poll loop that runs due schedules.
//!
//! Each tick queries a bounded batch of due schedules and processes them with bounded
//! parallelism. The registry's claim is the only lock: a schedule another worker already
//! claimed is simply skipped. Failures stay with their schedule and never stop the batch,
//! except configuration errors, which stop the loop. Claims that outlive
//! `claim_lease` are returned to `active` at the start of a tick.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{stream, FutureExt, StreamExt};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    executor::{Executed, Executor, Failed},
    schedule::{registry::ReleaseResult, Schedule, ScheduleRegistry},
    store::PermissionStore,
    utils::millis_since_unix_epoch,
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_parallel: usize,
    pub claim_lease: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 25,
            max_parallel: num_cpus::get(),
            claim_lease: Duration::from_secs(15 * 60),
        }
    }
}

/// What happened to one schedule during a tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Processed {
    /// Budget or expiry was spent; completed without touching the ledger.
    Exhausted,
    /// Another worker got there first, or the schedule changed state.
    Skipped,
    Succeeded {
        release: ReleaseResult,
        tx_ref: Option<String>,
    },
    Failed {
        release: ReleaseResult,
        error_kind: &'static str,
    },
    /// Bookkeeping failed; the schedule is retried on a later tick.
    Errored,
    /// A configuration problem outside the schedule. The schedule was returned to
    /// `active` and the tick stops.
    Aborted(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Stale claims returned to `active` before the due query.
    pub reclaimed: usize,
    pub due: usize,
    pub exhausted: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errored: usize,
    pub aborted: usize,
}

impl TickReport {
    fn record(&mut self, processed: &Processed) {
        match processed {
            Processed::Exhausted => self.exhausted += 1,
            Processed::Skipped => self.skipped += 1,
            Processed::Succeeded { .. } => self.succeeded += 1,
            Processed::Failed { .. } => self.failed += 1,
            Processed::Errored => self.errored += 1,
            Processed::Aborted(_) => self.aborted += 1,
        }
    }
}

pub struct ExecutionScheduler {
    registry: Arc<ScheduleRegistry>,
    executor: Arc<Executor>,
    permissions: Arc<dyn PermissionStore>,
    settings: SchedulerSettings,
}

impl ExecutionScheduler {
    pub fn new(
        registry: Arc<ScheduleRegistry>,
        executor: Arc<Executor>,
        permissions: Arc<dyn PermissionStore>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            registry,
            executor,
            permissions,
            settings: SchedulerSettings {
                batch_size: settings.batch_size.max(1),
                max_parallel: settings.max_parallel.max(1),
                ..settings
            },
        }
    }

    /// Runs ticks every `poll_interval` until `shutdown` flips to true. A tick in progress
    /// finishes before the loop exits so no schedule is left `executing`.
    ///
    /// A configuration error stops the loop and is returned.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Scheduler started, polling every {}",
            humantime::format_duration(self.settings.poll_interval)
        );
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            match self.tick(millis_since_unix_epoch()).await {
                Ok(report) if report.due > 0 || report.reclaimed > 0 => {
                    info!("Tick finished: {:?}", report)
                }
                Ok(_) => debug!("Nothing due"),
                Err(e) if !e.is_schedule_scoped() => {
                    error!("Stopping the scheduler: {}", e);
                    return Err(e);
                }
                Err(e) => error!("Tick failed: {}", e),
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Processes one batch of schedules due at `now` (unix milliseconds).
    ///
    /// Per-schedule problems are recorded in the report and in each schedule's history.
    /// Errors are returned when the due query fails and when a configuration problem
    /// aborts the batch; schedules not yet started are left for a later tick.
    pub async fn tick(&self, now: u64) -> Result<TickReport> {
        let reclaimed = self.reclaim_stale(now)?;
        let due = self.registry.due(now, self.settings.batch_size)?;
        let mut report = TickReport {
            reclaimed,
            due: due.len(),
            ..TickReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }
        debug!("{} schedule(s) due", due.len());

        let halted = AtomicBool::new(false);
        let processed: Vec<Processed> = stream::iter(due)
            .map(|schedule| self.process_due(schedule, now, &halted))
            .buffer_unordered(self.settings.max_parallel)
            .collect()
            .await;

        let mut aborted = None;
        for processed in processed {
            report.record(&processed);
            if let Processed::Aborted(message) = processed {
                aborted.get_or_insert(message);
            }
        }
        match aborted {
            Some(message) => {
                warn!("Tick aborted: {:?}", report);
                Err(Error::Configuration(message))
            }
            None => Ok(report),
        }
    }

    /// Returns schedules whose claim outlived the lease, after a crash or a lost
    /// release, to `active`. Counters and `next_run_at` are untouched.
    fn reclaim_stale(&self, now: u64) -> Result<usize> {
        let lease = u64::try_from(self.settings.claim_lease.as_millis()).unwrap_or(u64::MAX);
        let stale = self
            .registry
            .stale_claims(now.saturating_sub(lease), self.settings.batch_size)?;

        let mut reclaimed = 0;
        for id in stale {
            let error = Error::InvalidState(format!(
                "Claim expired after {} without a release",
                humantime::format_duration(self.settings.claim_lease)
            ));
            let Some(release) = self.registry.abandon_claim(&id, &error, None, now)? else {
                continue;
            };
            warn!("Reclaimed schedule {} from an expired claim", id);
            reclaimed += 1;
            if release == ReleaseResult::Cancelled {
                self.revoke_cancelled(&id, now)?;
            }
        }
        Ok(reclaimed)
    }

    async fn process_due(&self, schedule: Schedule, now: u64, halted: &AtomicBool) -> Processed {
        if halted.load(Ordering::Acquire) {
            return Processed::Skipped;
        }
        let id = schedule.id.clone();
        match self.try_process_due(schedule, now).await {
            Ok(processed) => processed,
            Err(Error::Configuration(message)) => {
                halted.store(true, Ordering::Release);
                Processed::Aborted(message)
            }
            Err(e) => {
                error!("Could not process schedule {}: {}", id, e);
                Processed::Errored
            }
        }
    }

    async fn try_process_due(&self, schedule: Schedule, now: u64) -> Result<Processed> {
        if let Some(reason) = schedule.exhaustion(now) {
            return Ok(if self.registry.complete_exhausted(&schedule.id, &reason, now)? {
                Processed::Exhausted
            } else {
                Processed::Skipped
            });
        }

        if !self.registry.claim_due(&schedule.id, now)? {
            debug!("Schedule {} was claimed elsewhere", schedule.id);
            return Ok(Processed::Skipped);
        }
        self.run_claimed(&schedule.id, now).await
    }

    /// Runs one attempt right away through the same claim path as the poll loop.
    pub async fn trigger_now(&self, id: &str, now: u64) -> Result<Processed> {
        let schedule = self.registry.get(id)?;
        if let Some(reason) = schedule.exhaustion(now) {
            self.registry.complete_exhausted(id, &reason, now)?;
            return Err(Error::ExpiredOrExhausted(reason));
        }
        if !self.registry.claim_now(id, now)? {
            return Err(Error::InvalidState(format!(
                "Schedule {id} is {} and cannot be triggered",
                schedule.state
            )));
        }
        self.run_claimed(id, now).await
    }

    /// Executes a schedule this worker has claimed and always tries to release it. When
    /// the release itself fails the claim is abandoned, or left for the lease to expire.
    async fn run_claimed(&self, id: &str, now: u64) -> Result<Processed> {
        let claimed = match self.registry.get(id) {
            Ok(claimed) => claimed,
            Err(e) => return Err(self.abandon(id, e, None, now)),
        };

        let outcome = AssertUnwindSafe(self.executor.execute(&claimed, now))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(Failed::from(Error::InvalidState(format!(
                    "Executor panicked while running schedule {id}"
                ))))
            });

        let processed = match outcome {
            Ok(Executed { tx_ref, message }) => {
                match self
                    .registry
                    .release_success(&claimed, tx_ref.clone(), Some(message), now)
                {
                    Ok(release) => Processed::Succeeded { release, tx_ref },
                    Err(e) => return Err(self.abandon(id, e, tx_ref, now)),
                }
            }
            Err(Failed { error, tx_ref }) if !error.is_schedule_scoped() => {
                error!("Schedule {} hit a configuration problem: {}", id, error);
                return Err(self.abandon(id, error, tx_ref, now));
            }
            Err(Failed { error, tx_ref }) => {
                if error.is_transient() {
                    warn!("Schedule {} failed, retrying next tick: {}", id, error);
                } else {
                    warn!("Schedule {} failed: {}", id, error);
                }
                let error_kind = error.kind();
                match self
                    .registry
                    .release_failure(&claimed, &error, tx_ref.clone(), now)
                {
                    Ok(release) => Processed::Failed {
                        release,
                        error_kind,
                    },
                    Err(e) => return Err(self.abandon(id, e, tx_ref, now)),
                }
            }
        };

        if matches!(
            processed,
            Processed::Succeeded {
                release: ReleaseResult::Cancelled,
                ..
            } | Processed::Failed {
                release: ReleaseResult::Cancelled,
                ..
            }
        ) {
            self.revoke_cancelled(id, now)?;
        }

        Ok(processed)
    }

    /// Best-effort return of a claim to `active` with a failure record. Hands `error`
    /// back for the caller to propagate.
    fn abandon(&self, id: &str, error: Error, tx_ref: Option<String>, now: u64) -> Error {
        match self.registry.abandon_claim(id, &error, tx_ref, now) {
            Ok(Some(ReleaseResult::Cancelled)) => {
                if let Err(e) = self.revoke_cancelled(id, now) {
                    error!("Could not revoke chains of schedule {}: {}", id, e);
                }
            }
            Ok(Some(_)) => warn!("Returned schedule {} to active after: {}", id, error),
            Ok(None) => {}
            Err(e) => error!(
                "Schedule {} stays claimed until its lease expires: {}",
                id, e
            ),
        }
        error
    }

    fn revoke_cancelled(&self, id: &str, now: u64) -> Result<()> {
        let revoked = self.permissions.revoke_chains(id, now)?;
        info!(
            "Schedule {} cancelled after its attempt, revoked {} chain(s)",
            id, revoked
        );
        Ok(())
    }
}
