//! Persistence for schedules, execution history and permission chains.
//!
//! The scheduler's mutual exclusion lives here: [`ScheduleStore::try_claim`] must be a
//! single atomic conditional update against storage shared by every worker process.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use crate::{
    delegation::{Address, Hash32},
    schedule::{ExecutionRecord, Schedule, ScheduleState},
    Result,
};

/// Result of one execution attempt, applied when the claim is released.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Release {
    /// State to move to unless a cancellation arrived while executing.
    pub state: ScheduleState,
    pub next_run_at: u64,
    pub execution_count: u32,
    pub consecutive_failures: u32,
    pub record: ExecutionRecord,
}

pub trait ScheduleStore: Send + Sync {
    fn insert_schedule(&self, schedule: &Schedule) -> Result<()>;

    /// Loads a schedule together with its history.
    fn schedule(&self, id: &str) -> Result<Option<Schedule>>;

    fn schedules(&self, wallet: Option<&Address>) -> Result<Vec<Schedule>>;

    /// Active schedules with `next_run_at <= now`, oldest first.
    fn due_schedules(&self, now: u64, limit: usize) -> Result<Vec<Schedule>>;

    /// Atomically moves `active -> executing`. With `due_at`, only claims schedules whose
    /// `next_run_at` is not after it. Returns whether this caller won the claim.
    fn try_claim(&self, id: &str, due_at: Option<u64>, now: u64) -> Result<bool>;

    /// Atomic compare-and-set between two non-executing states, optionally appending a
    /// history record and replacing `next_run_at` in the same step.
    fn transition(
        &self,
        id: &str,
        from: ScheduleState,
        to: ScheduleState,
        next_run_at: Option<u64>,
        record: Option<&ExecutionRecord>,
        now: u64,
    ) -> Result<bool>;

    /// Flags an executing schedule for cancellation once its attempt resolves.
    /// Returns false if the schedule is not executing.
    fn request_cancel(&self, id: &str, now: u64) -> Result<bool>;

    /// Releases an executing schedule and appends the attempt's record. A pending
    /// cancellation overrides `release.state`. Returns the state actually stored.
    fn release(&self, id: &str, release: &Release, now: u64) -> Result<ScheduleState>;

    /// Returns an executing schedule to `active` (or `cancelled` if a cancellation is
    /// pending) and appends `record`. Counters and `next_run_at` are left alone.
    /// Returns `None` if the schedule is not executing.
    fn abandon_claim(
        &self,
        id: &str,
        record: &ExecutionRecord,
        now: u64,
    ) -> Result<Option<ScheduleState>>;

    /// Ids of schedules left `executing` since before `claimed_before`, oldest first.
    fn stale_claims(&self, claimed_before: u64, limit: usize) -> Result<Vec<String>>;

    fn history(&self, id: &str) -> Result<Vec<ExecutionRecord>>;
}

/// A permission chain stored for one (wallet, schedule, asset).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChain {
    pub wallet: Address,
    pub schedule_id: String,
    pub asset: Option<String>,
    /// Opaque chain bytes as produced by `PermissionChain::encode`.
    pub chain: Vec<u8>,
    pub leaf_hash: Hash32,
    pub created_at: u64,
    pub revoked_at: Option<u64>,
}

pub trait PermissionStore: Send + Sync {
    fn put_chain(&self, chain: &StoredChain) -> Result<()>;

    /// The live (not revoked) chain for the key.
    fn chain(&self, wallet: &Address, schedule_id: &str, asset: Option<&str>)
        -> Result<Option<StoredChain>>;

    /// Every chain of a schedule, revoked ones included.
    fn chains_for_schedule(&self, schedule_id: &str) -> Result<Vec<StoredChain>>;

    /// Soft-deletes all chains of a schedule. Returns how many were revoked.
    fn revoke_chains(&self, schedule_id: &str, now: u64) -> Result<usize>;
}
