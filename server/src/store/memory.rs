use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::{PermissionStore, Release, ScheduleStore, StoredChain};
use crate::{
    delegation::Address,
    schedule::{ExecutionRecord, Schedule, ScheduleState},
    Error, Result,
};

#[derive(Default)]
struct Inner {
    schedules: BTreeMap<String, Schedule>,
    chains: Vec<StoredChain>,
}

/// Process-local store. Every operation runs under one lock, which makes the claim atomic
/// for all schedulers sharing the same instance.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduleStore for MemoryStore {
    fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.schedules.contains_key(&schedule.id) {
            return Err(Error::InvalidParameter(format!(
                "Schedule {} already exists",
                schedule.id
            )));
        }
        inner.schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    fn schedule(&self, id: &str) -> Result<Option<Schedule>> {
        Ok(self.inner.lock().schedules.get(id).cloned())
    }

    fn schedules(&self, wallet: Option<&Address>) -> Result<Vec<Schedule>> {
        let inner = self.inner.lock();
        let mut schedules: Vec<Schedule> = inner
            .schedules
            .values()
            .filter(|schedule| wallet.is_none_or(|wallet| schedule.wallet == *wallet))
            .cloned()
            .collect();
        schedules.sort_by_key(|schedule| schedule.created_at);
        Ok(schedules)
    }

    fn due_schedules(&self, now: u64, limit: usize) -> Result<Vec<Schedule>> {
        let inner = self.inner.lock();
        let mut due: Vec<Schedule> = inner
            .schedules
            .values()
            .filter(|schedule| {
                schedule.state == ScheduleState::Active && schedule.next_run_at <= now
            })
            .cloned()
            .collect();
        due.sort_by_key(|schedule| schedule.next_run_at);
        due.truncate(limit);
        Ok(due)
    }

    fn try_claim(&self, id: &str, due_at: Option<u64>, now: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(schedule) = inner.schedules.get_mut(id) else {
            return Ok(false);
        };
        if schedule.state != ScheduleState::Active {
            return Ok(false);
        }
        if due_at.is_some_and(|due_at| schedule.next_run_at > due_at) {
            return Ok(false);
        }
        schedule.state = ScheduleState::Executing;
        schedule.updated_at = now;
        Ok(true)
    }

    fn transition(
        &self,
        id: &str,
        from: ScheduleState,
        to: ScheduleState,
        next_run_at: Option<u64>,
        record: Option<&ExecutionRecord>,
        now: u64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(schedule) = inner.schedules.get_mut(id) else {
            return Ok(false);
        };
        if schedule.state != from {
            return Ok(false);
        }
        schedule.state = to;
        if let Some(next_run_at) = next_run_at {
            schedule.next_run_at = next_run_at;
        }
        if let Some(record) = record {
            schedule.history.push(record.clone());
        }
        schedule.updated_at = now;
        Ok(true)
    }

    fn request_cancel(&self, id: &str, now: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.schedules.get_mut(id) {
            Some(schedule) if schedule.state == ScheduleState::Executing => {
                schedule.cancel_requested = true;
                schedule.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, id: &str, release: &Release, now: u64) -> Result<ScheduleState> {
        let mut inner = self.inner.lock();
        let schedule = inner
            .schedules
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Schedule {id}")))?;
        if schedule.state != ScheduleState::Executing {
            return Err(Error::InvalidState(format!(
                "Schedule {id} is {} and cannot be released",
                schedule.state
            )));
        }

        schedule.state = if schedule.cancel_requested {
            ScheduleState::Cancelled
        } else {
            release.state
        };
        schedule.next_run_at = release.next_run_at;
        schedule.execution_count = release.execution_count;
        schedule.consecutive_failures = release.consecutive_failures;
        schedule.history.push(release.record.clone());
        schedule.updated_at = now;

        Ok(schedule.state)
    }

    fn abandon_claim(
        &self,
        id: &str,
        record: &ExecutionRecord,
        now: u64,
    ) -> Result<Option<ScheduleState>> {
        let mut inner = self.inner.lock();
        let Some(schedule) = inner.schedules.get_mut(id) else {
            return Ok(None);
        };
        if schedule.state != ScheduleState::Executing {
            return Ok(None);
        }
        schedule.state = if schedule.cancel_requested {
            ScheduleState::Cancelled
        } else {
            ScheduleState::Active
        };
        schedule.history.push(record.clone());
        schedule.updated_at = now;
        Ok(Some(schedule.state))
    }

    fn stale_claims(&self, claimed_before: u64, limit: usize) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let mut stale: Vec<&Schedule> = inner
            .schedules
            .values()
            .filter(|schedule| {
                schedule.state == ScheduleState::Executing && schedule.updated_at < claimed_before
            })
            .collect();
        stale.sort_by_key(|schedule| schedule.updated_at);
        Ok(stale
            .into_iter()
            .take(limit)
            .map(|schedule| schedule.id.clone())
            .collect())
    }

    fn history(&self, id: &str) -> Result<Vec<ExecutionRecord>> {
        self.inner
            .lock()
            .schedules
            .get(id)
            .map(|schedule| schedule.history.clone())
            .ok_or_else(|| Error::NotFound(format!("Schedule {id}")))
    }
}

impl PermissionStore for MemoryStore {
    fn put_chain(&self, chain: &StoredChain) -> Result<()> {
        let mut inner = self.inner.lock();
        let exists = inner.chains.iter().any(|stored| {
            stored.wallet == chain.wallet
                && stored.schedule_id == chain.schedule_id
                && stored.asset == chain.asset
        });
        if exists {
            return Err(Error::InvalidParameter(format!(
                "A permission chain for schedule {} and asset {:?} already exists",
                chain.schedule_id, chain.asset
            )));
        }
        inner.chains.push(chain.clone());
        Ok(())
    }

    fn chain(
        &self,
        wallet: &Address,
        schedule_id: &str,
        asset: Option<&str>,
    ) -> Result<Option<StoredChain>> {
        Ok(self
            .inner
            .lock()
            .chains
            .iter()
            .find(|stored| {
                stored.wallet == *wallet
                    && stored.schedule_id == schedule_id
                    && stored.asset.as_deref() == asset
                    && stored.revoked_at.is_none()
            })
            .cloned())
    }

    fn chains_for_schedule(&self, schedule_id: &str) -> Result<Vec<StoredChain>> {
        Ok(self
            .inner
            .lock()
            .chains
            .iter()
            .filter(|stored| stored.schedule_id == schedule_id)
            .cloned()
            .collect())
    }

    fn revoke_chains(&self, schedule_id: &str, now: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut revoked = 0;
        for stored in inner
            .chains
            .iter_mut()
            .filter(|stored| stored.schedule_id == schedule_id && stored.revoked_at.is_none())
        {
            stored.revoked_at = Some(now);
            revoked += 1;
        }
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::{
        delegation::Hash32,
        schedule::{Frequency, Recurrence, ScheduleKind, ScheduleParams},
    };

    fn schedule(id: &str, wallet: u8, next_run_at: u64) -> Schedule {
        Schedule {
            id: id.to_owned(),
            kind: ScheduleKind::Transfer,
            wallet: Address([wallet; 20]),
            chain_ref: "0xabc".to_owned(),
            params: ScheduleParams::Transfer {
                asset: "USDC".to_owned(),
                amount: "10".to_owned(),
                recipient: Address([9; 20]),
            },
            recurrence: Recurrence::every(Frequency::Daily),
            state: ScheduleState::Active,
            next_run_at,
            execution_count: 0,
            max_executions: None,
            expires_at: None,
            consecutive_failures: 0,
            cancel_requested: false,
            created_at: next_run_at,
            updated_at: next_run_at,
            history: Vec::new(),
        }
    }

    fn chain(schedule_id: &str, asset: &str) -> StoredChain {
        StoredChain {
            wallet: Address([1; 20]),
            schedule_id: schedule_id.to_owned(),
            asset: Some(asset.to_owned()),
            chain: vec![1, 2, 3],
            leaf_hash: Hash32([4; 32]),
            created_at: 1,
            revoked_at: None,
        }
    }

    #[test]
    fn due_schedules_are_oldest_first_and_limited() {
        let store = MemoryStore::new();
        store.insert_schedule(&schedule("b", 1, 20)).unwrap();
        store.insert_schedule(&schedule("a", 1, 10)).unwrap();
        store.insert_schedule(&schedule("c", 2, 30)).unwrap();

        let due = store.due_schedules(25, 10).unwrap();
        assert_eq!(
            due.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );
        assert_eq!(store.due_schedules(100, 1).unwrap().len(), 1);
        assert_eq!(store.schedules(Some(&Address([2; 20]))).unwrap().len(), 1);
        assert!(store.insert_schedule(&schedule("a", 1, 10)).is_err());
    }

    #[test]
    fn only_one_thread_wins_the_claim() {
        let store = Arc::new(MemoryStore::new());
        store.insert_schedule(&schedule("sch", 1, 10)).unwrap();

        let winners = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.try_claim("sch", Some(10), 11).unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn pending_cancel_overrides_the_release_state() {
        let store = MemoryStore::new();
        store.insert_schedule(&schedule("sch", 1, 10)).unwrap();
        assert!(!store.request_cancel("sch", 11).unwrap());
        assert!(store.try_claim("sch", None, 11).unwrap());
        assert!(store.request_cancel("sch", 12).unwrap());

        let release = Release {
            state: ScheduleState::Active,
            next_run_at: 86_400_010,
            execution_count: 1,
            consecutive_failures: 0,
            record: ExecutionRecord::success(13, Some("0xtx".to_owned()), None),
        };
        assert_eq!(
            store.release("sch", &release, 13).unwrap(),
            ScheduleState::Cancelled
        );
        assert_eq!(store.history("sch").unwrap().len(), 1);
        assert!(store.release("sch", &release, 14).is_err());
    }

    #[test]
    fn abandoned_claim_with_pending_cancel_is_cancelled() {
        let store = MemoryStore::new();
        store.insert_schedule(&schedule("sch", 1, 10)).unwrap();
        assert!(store.try_claim("sch", None, 11).unwrap());
        assert!(store.stale_claims(11, 10).unwrap().is_empty());
        assert_eq!(store.stale_claims(12, 10).unwrap(), vec!["sch".to_owned()]);
        assert!(store.request_cancel("sch", 12).unwrap());

        let record = ExecutionRecord::failure(13, &Error::transient("lost"), None);
        assert_eq!(
            store.abandon_claim("sch", &record, 13).unwrap(),
            Some(ScheduleState::Cancelled)
        );
        assert_eq!(store.abandon_claim("sch", &record, 14).unwrap(), None);
        assert_eq!(store.history("sch").unwrap(), vec![record]);
    }

    #[test]
    fn revoked_chains_are_no_longer_live() {
        let store = MemoryStore::new();
        store.put_chain(&chain("sch", "USDC")).unwrap();
        store.put_chain(&chain("sch", "ETH")).unwrap();
        assert!(store.put_chain(&chain("sch", "USDC")).is_err());

        let wallet = Address([1; 20]);
        assert!(store.chain(&wallet, "sch", Some("USDC")).unwrap().is_some());
        assert_eq!(store.revoke_chains("sch", 50).unwrap(), 2);
        assert_eq!(store.revoke_chains("sch", 60).unwrap(), 0);
        assert!(store.chain(&wallet, "sch", Some("USDC")).unwrap().is_none());
        assert!(store
            .chains_for_schedule("sch")
            .unwrap()
            .iter()
            .all(|stored| stored.revoked_at == Some(50)));
    }
}
