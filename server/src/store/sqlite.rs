use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Row};
use tracing::debug;

use super::{PermissionStore, Release, ScheduleStore, StoredChain};
use crate::{
    delegation::{Address, Hash32},
    schedule::{ExecutionRecord, Schedule, ScheduleState},
    Error, Result,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY NOT NULL,
    kind TEXT NOT NULL,
    wallet TEXT NOT NULL,
    chain_ref TEXT NOT NULL,
    params TEXT NOT NULL,
    recurrence TEXT NOT NULL,
    state TEXT NOT NULL,
    next_run_at INTEGER NOT NULL,
    execution_count INTEGER NOT NULL DEFAULT 0,
    max_executions INTEGER,
    expires_at INTEGER,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(state, next_run_at);
CREATE INDEX IF NOT EXISTS idx_schedules_wallet ON schedules(wallet, created_at);

CREATE TABLE IF NOT EXISTS execution_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id TEXT NOT NULL REFERENCES schedules(id),
    at INTEGER NOT NULL,
    record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_execution_history_schedule ON execution_history(schedule_id, id);
CREATE TRIGGER IF NOT EXISTS execution_history_no_update BEFORE UPDATE ON execution_history
BEGIN
    SELECT RAISE(ABORT, 'execution history is append-only');
END;
CREATE TRIGGER IF NOT EXISTS execution_history_no_delete BEFORE DELETE ON execution_history
BEGIN
    SELECT RAISE(ABORT, 'execution history is append-only');
END;

CREATE TABLE IF NOT EXISTS permission_chains (
    wallet TEXT NOT NULL,
    schedule_id TEXT NOT NULL,
    asset TEXT NOT NULL DEFAULT '',
    chain BLOB NOT NULL,
    leaf_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    revoked_at INTEGER,
    PRIMARY KEY (wallet, schedule_id, asset)
);
";

const SCHEDULE_COLUMNS: &str = "id, kind, wallet, chain_ref, params, recurrence, state, \
     next_run_at, execution_count, max_executions, expires_at, consecutive_failures, \
     cancel_requested, created_at, updated_at";

/// Shared SQLite store. Several worker processes may open the same file; the claim is a
/// single conditional `UPDATE`, so SQLite's write lock arbitrates between them.
pub struct SqliteStore {
    writer: Mutex<Connection>,
    path: PathBuf,
}

fn prepare_conn(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    conn.pragma_update(Some(DatabaseName::Main), "journal_mode", "WAL")?;
    conn.pragma_update(Some(DatabaseName::Main), "synchronous", "NORMAL")?;
    conn.pragma_update(Some(DatabaseName::Main), "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(5))?;

    Ok(conn)
}

fn millis(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn unsigned(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

/// Raw column values, converted outside of rusqlite's row closure so JSON errors surface
/// as our own error type.
struct ScheduleRow {
    id: String,
    kind: String,
    wallet: String,
    chain_ref: String,
    params: String,
    recurrence: String,
    state: String,
    next_run_at: i64,
    execution_count: i64,
    max_executions: Option<i64>,
    expires_at: Option<i64>,
    consecutive_failures: i64,
    cancel_requested: bool,
    created_at: i64,
    updated_at: i64,
}

impl ScheduleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            wallet: row.get(2)?,
            chain_ref: row.get(3)?,
            params: row.get(4)?,
            recurrence: row.get(5)?,
            state: row.get(6)?,
            next_run_at: row.get(7)?,
            execution_count: row.get(8)?,
            max_executions: row.get(9)?,
            expires_at: row.get(10)?,
            consecutive_failures: row.get(11)?,
            cancel_requested: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_schedule(self, history: Vec<ExecutionRecord>) -> Result<Schedule> {
        Ok(Schedule {
            kind: serde_json::from_value(serde_json::Value::String(self.kind))?,
            wallet: Address::parse(&self.wallet)?,
            chain_ref: self.chain_ref,
            params: serde_json::from_str(&self.params)?,
            recurrence: serde_json::from_str(&self.recurrence)?,
            state: self.state.parse()?,
            next_run_at: unsigned(self.next_run_at),
            execution_count: u32::try_from(self.execution_count).unwrap_or(u32::MAX),
            max_executions: self
                .max_executions
                .map(|max| u32::try_from(max).unwrap_or(u32::MAX)),
            expires_at: self.expires_at.map(unsigned),
            consecutive_failures: u32::try_from(self.consecutive_failures).unwrap_or(u32::MAX),
            cancel_requested: self.cancel_requested,
            created_at: unsigned(self.created_at),
            updated_at: unsigned(self.updated_at),
            history,
            id: self.id,
        })
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|error| {
                    Error::bad_config(format!(
                        "Could not create database directory {}: {error}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = prepare_conn(&path)?;
        conn.execute_batch(SCHEMA)?;
        debug!("Opened schedule database at {}", path.display());

        Ok(Self {
            writer: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock()
    }

    fn load_history(conn: &Connection, id: &str) -> Result<Vec<ExecutionRecord>> {
        let mut statement = conn.prepare_cached(
            "SELECT record FROM execution_history WHERE schedule_id = ?1 ORDER BY id",
        )?;
        let records = statement
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records
            .iter()
            .map(|record| serde_json::from_str(record).map_err(Error::from))
            .collect()
    }

    fn append_history(conn: &Connection, id: &str, record: &ExecutionRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO execution_history (schedule_id, at, record) VALUES (?1, ?2, ?3)",
            params![id, millis(record.at), serde_json::to_string(record)?],
        )?;
        Ok(())
    }

    fn query_schedules(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Schedule>> {
        let mut statement = conn.prepare_cached(sql)?;
        let rows = statement
            .query_map(params, ScheduleRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|row| {
                let history = Self::load_history(conn, &row.id)?;
                row.into_schedule(history)
            })
            .collect()
    }
}

impl ScheduleStore for SqliteStore {
    fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO schedules ({SCHEDULE_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                schedule.id,
                schedule.kind.as_str(),
                schedule.wallet.to_string(),
                schedule.chain_ref,
                serde_json::to_string(&schedule.params)?,
                serde_json::to_string(&schedule.recurrence)?,
                schedule.state.as_str(),
                millis(schedule.next_run_at),
                schedule.execution_count,
                schedule.max_executions,
                schedule.expires_at.map(millis),
                schedule.consecutive_failures,
                schedule.cancel_requested,
                millis(schedule.created_at),
                millis(schedule.updated_at),
            ],
        )?;
        for record in &schedule.history {
            Self::append_history(&tx, &schedule.id, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                params![id],
                ScheduleRow::from_row,
            )
            .optional()?;
        match row {
            Some(row) => {
                let history = Self::load_history(&conn, id)?;
                Ok(Some(row.into_schedule(history)?))
            }
            None => Ok(None),
        }
    }

    fn schedules(&self, wallet: Option<&Address>) -> Result<Vec<Schedule>> {
        let conn = self.conn();
        match wallet {
            Some(wallet) => Self::query_schedules(
                &conn,
                &format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules \
                     WHERE wallet = ?1 ORDER BY created_at"
                ),
                params![wallet.to_string()],
            ),
            None => Self::query_schedules(
                &conn,
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at"),
                params![],
            ),
        }
    }

    fn due_schedules(&self, now: u64, limit: usize) -> Result<Vec<Schedule>> {
        let conn = self.conn();
        Self::query_schedules(
            &conn,
            &format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules \
                 WHERE state = 'active' AND next_run_at <= ?1 \
                 ORDER BY next_run_at LIMIT ?2"
            ),
            params![millis(now), i64::try_from(limit).unwrap_or(i64::MAX)],
        )
    }

    fn try_claim(&self, id: &str, due_at: Option<u64>, now: u64) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE schedules SET state = 'executing', updated_at = ?3 \
             WHERE id = ?1 AND state = 'active' AND (?2 IS NULL OR next_run_at <= ?2)",
            params![id, due_at.map(millis), millis(now)],
        )?;
        Ok(changed == 1)
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
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE schedules \
             SET state = ?3, next_run_at = COALESCE(?4, next_run_at), updated_at = ?5 \
             WHERE id = ?1 AND state = ?2",
            params![id, from.as_str(), to.as_str(), next_run_at.map(millis), millis(now)],
        )?;
        if changed != 1 {
            return Ok(false);
        }
        if let Some(record) = record {
            Self::append_history(&tx, id, record)?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn request_cancel(&self, id: &str, now: u64) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE schedules SET cancel_requested = 1, updated_at = ?2 \
             WHERE id = ?1 AND state = 'executing'",
            params![id, millis(now)],
        )?;
        Ok(changed == 1)
    }

    fn release(&self, id: &str, release: &Release, now: u64) -> Result<ScheduleState> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE schedules SET \
                 state = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE ?2 END, \
                 next_run_at = ?3, execution_count = ?4, consecutive_failures = ?5, \
                 updated_at = ?6 \
             WHERE id = ?1 AND state = 'executing'",
            params![
                id,
                release.state.as_str(),
                millis(release.next_run_at),
                release.execution_count,
                release.consecutive_failures,
                millis(now),
            ],
        )?;
        if changed != 1 {
            return Err(Error::InvalidState(format!(
                "Schedule {id} is not executing and cannot be released"
            )));
        }
        Self::append_history(&tx, id, &release.record)?;
        let state: String = tx.query_row(
            "SELECT state FROM schedules WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        state.parse()
    }

    fn abandon_claim(
        &self,
        id: &str,
        record: &ExecutionRecord,
        now: u64,
    ) -> Result<Option<ScheduleState>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE schedules SET \
                 state = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'active' END, \
                 updated_at = ?2 \
             WHERE id = ?1 AND state = 'executing'",
            params![id, millis(now)],
        )?;
        if changed != 1 {
            return Ok(None);
        }
        Self::append_history(&tx, id, record)?;
        let state: String = tx.query_row(
            "SELECT state FROM schedules WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(Some(state.parse()?))
    }

    fn stale_claims(&self, claimed_before: u64, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut statement = conn.prepare_cached(
            "SELECT id FROM schedules WHERE state = 'executing' AND updated_at < ?1 \
             ORDER BY updated_at LIMIT ?2",
        )?;
        let ids = statement
            .query_map(
                params![millis(claimed_before), i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    fn history(&self, id: &str) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM schedules WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::NotFound(format!("Schedule {id}")));
        }
        Self::load_history(&conn, id)
    }
}

struct ChainRow {
    wallet: String,
    schedule_id: String,
    asset: String,
    chain: Vec<u8>,
    leaf_hash: String,
    created_at: i64,
    revoked_at: Option<i64>,
}

impl ChainRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            wallet: row.get(0)?,
            schedule_id: row.get(1)?,
            asset: row.get(2)?,
            chain: row.get(3)?,
            leaf_hash: row.get(4)?,
            created_at: row.get(5)?,
            revoked_at: row.get(6)?,
        })
    }

    fn into_chain(self) -> Result<StoredChain> {
        let leaf_hash: Hash32 = serde_json::from_value(serde_json::Value::String(self.leaf_hash))?;
        Ok(StoredChain {
            wallet: Address::parse(&self.wallet)?,
            schedule_id: self.schedule_id,
            asset: (!self.asset.is_empty()).then_some(self.asset),
            chain: self.chain,
            leaf_hash,
            created_at: unsigned(self.created_at),
            revoked_at: self.revoked_at.map(unsigned),
        })
    }
}

const CHAIN_COLUMNS: &str = "wallet, schedule_id, asset, chain, leaf_hash, created_at, revoked_at";

impl PermissionStore for SqliteStore {
    fn put_chain(&self, chain: &StoredChain) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO permission_chains ({CHAIN_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                chain.wallet.to_string(),
                chain.schedule_id,
                chain.asset.as_deref().unwrap_or_default(),
                chain.chain,
                chain.leaf_hash.to_string(),
                millis(chain.created_at),
                chain.revoked_at.map(millis),
            ],
        )?;
        Ok(())
    }

    fn chain(
        &self,
        wallet: &Address,
        schedule_id: &str,
        asset: Option<&str>,
    ) -> Result<Option<StoredChain>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {CHAIN_COLUMNS} FROM permission_chains \
                     WHERE wallet = ?1 AND schedule_id = ?2 AND asset = ?3 AND revoked_at IS NULL"
                ),
                params![wallet.to_string(), schedule_id, asset.unwrap_or_default()],
                ChainRow::from_row,
            )
            .optional()?
            .map(ChainRow::into_chain)
            .transpose()
    }

    fn chains_for_schedule(&self, schedule_id: &str) -> Result<Vec<StoredChain>> {
        let conn = self.conn();
        let mut statement = conn.prepare_cached(&format!(
            "SELECT {CHAIN_COLUMNS} FROM permission_chains WHERE schedule_id = ?1 ORDER BY asset"
        ))?;
        let rows = statement
            .query_map(params![schedule_id], ChainRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ChainRow::into_chain).collect()
    }

    fn revoke_chains(&self, schedule_id: &str, now: u64) -> Result<usize> {
        let changed = self.conn().execute(
            "UPDATE permission_chains SET revoked_at = ?2 \
             WHERE schedule_id = ?1 AND revoked_at IS NULL",
            params![schedule_id, millis(now)],
        )?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc, thread};

    use super::*;
    use crate::schedule::{Frequency, Recurrence, ScheduleKind, ScheduleParams};

    fn schedule(id: &str, next_run_at: u64) -> Schedule {
        Schedule {
            id: id.to_owned(),
            kind: ScheduleKind::Rebalance,
            wallet: Address([1; 20]),
            chain_ref: "0xabc".to_owned(),
            params: ScheduleParams::Rebalance {
                targets: BTreeMap::from([("ETH".to_owned(), 50.0), ("USDC".to_owned(), 50.0)]),
                threshold_pct: 5.0,
            },
            recurrence: Recurrence::every(Frequency::Daily),
            state: ScheduleState::Active,
            next_run_at,
            execution_count: 0,
            max_executions: Some(3),
            expires_at: None,
            consecutive_failures: 0,
            cancel_requested: false,
            created_at: 1,
            updated_at: 1,
            history: Vec::new(),
        }
    }

    #[test]
    fn schedules_roundtrip_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("keeper.db")).unwrap();
        let original = schedule("sch_1", 100);
        store.insert_schedule(&original).unwrap();

        assert_eq!(store.schedule("sch_1").unwrap(), Some(original));
        assert_eq!(store.due_schedules(99, 10).unwrap().len(), 0);
        assert_eq!(store.due_schedules(100, 10).unwrap().len(), 1);
    }

    #[test]
    fn claims_from_separate_connections_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keeper.db");
        SqliteStore::open(&path)
            .unwrap()
            .insert_schedule(&schedule("sch_1", 100))
            .unwrap();

        // One store per thread stands in for one worker process each.
        let winners: usize = (0..8)
            .map(|_| {
                let store = Arc::new(SqliteStore::open(&path).unwrap());
                thread::spawn(move || store.try_claim("sch_1", Some(100), 200).unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| usize::from(handle.join().unwrap()))
            .sum();

        assert_eq!(winners, 1);
    }

    #[test]
    fn release_honours_a_deferred_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("keeper.db")).unwrap();
        store.insert_schedule(&schedule("sch_1", 100)).unwrap();
        assert!(store.try_claim("sch_1", None, 100).unwrap());
        assert!(store.request_cancel("sch_1", 101).unwrap());

        let release = Release {
            state: ScheduleState::Active,
            next_run_at: 200,
            execution_count: 1,
            consecutive_failures: 0,
            record: ExecutionRecord::success(102, Some("0xtx".to_owned()), None),
        };
        assert_eq!(
            store.release("sch_1", &release, 102).unwrap(),
            ScheduleState::Cancelled
        );
        assert_eq!(store.history("sch_1").unwrap().len(), 1);
    }

    #[test]
    fn stale_claims_are_abandoned_without_touching_counters() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("keeper.db")).unwrap();
        store.insert_schedule(&schedule("sch_1", 100)).unwrap();
        store.insert_schedule(&schedule("sch_2", 100)).unwrap();
        assert!(store.try_claim("sch_1", None, 100).unwrap());
        assert!(store.try_claim("sch_2", None, 500).unwrap());

        assert_eq!(store.stale_claims(400, 10).unwrap(), vec!["sch_1".to_owned()]);

        let record = ExecutionRecord::failure(600, &Error::transient("lost"), None);
        assert_eq!(
            store.abandon_claim("sch_1", &record, 600).unwrap(),
            Some(ScheduleState::Active)
        );
        assert_eq!(store.abandon_claim("sch_1", &record, 601).unwrap(), None);

        let stored = store.schedule("sch_1").unwrap().unwrap();
        assert_eq!(stored.next_run_at, 100);
        assert_eq!(stored.consecutive_failures, 0);
        assert_eq!(stored.history, vec![record]);
    }

    #[test]
    fn history_rows_cannot_be_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("keeper.db")).unwrap();
        store.insert_schedule(&schedule("sch_1", 100)).unwrap();
        store
            .transition(
                "sch_1",
                ScheduleState::Active,
                ScheduleState::Completed,
                None,
                Some(&ExecutionRecord::expired(100, "Schedule expired")),
                100,
            )
            .unwrap();

        let conn = store.conn();
        assert!(conn
            .execute("UPDATE execution_history SET record = '{}'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM execution_history", []).is_err());
    }

    #[test]
    fn revoked_chains_stay_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("keeper.db")).unwrap();
        store.insert_schedule(&schedule("sch_1", 100)).unwrap();
        let stored = StoredChain {
            wallet: Address([1; 20]),
            schedule_id: "sch_1".to_owned(),
            asset: Some("ETH".to_owned()),
            chain: b"[]".to_vec(),
            leaf_hash: Hash32([3; 32]),
            created_at: 5,
            revoked_at: None,
        };
        store.put_chain(&stored).unwrap();
        assert_eq!(
            store.chain(&Address([1; 20]), "sch_1", Some("ETH")).unwrap(),
            Some(stored)
        );

        assert_eq!(store.revoke_chains("sch_1", 9).unwrap(), 1);
        assert!(store
            .chain(&Address([1; 20]), "sch_1", Some("ETH"))
            .unwrap()
            .is_none());
        assert_eq!(
            store.chains_for_schedule("sch_1").unwrap()[0].revoked_at,
            Some(9)
        );
    }
}
