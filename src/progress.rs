//! Checkpoint store: one progress record per (table, partition).
//!
//! Advances are conditional writes keyed by (table, partition); a store never locks across keys.
//! The executor is the single writer for a key, the monotone condition guards re-delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use deadpool_postgres::Pool;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{PipelineError, PipelineResult};

/// First day insert timestamps are reliably populated in the warehouse.
pub const HISTORICAL_EPOCH_DATE: NaiveDate = match NaiveDate::from_ymd_opt(2021, 4, 19) {
    Some(d) => d,
    None => NaiveDate::MIN,
};

/// Stored in place of "never loaded".
pub const UNLOADED_DATE: NaiveDate = match NaiveDate::from_ymd_opt(1, 1, 1) {
    Some(d) => d,
    None => NaiveDate::MIN,
};

pub const PROGRESS_TABLE: &str = "idr.load_progress";

pub fn historical_epoch() -> DateTime<Utc> {
    HISTORICAL_EPOCH_DATE.and_time(NaiveTime::MIN).and_utc()
}

pub fn unloaded_ts() -> DateTime<Utc> {
    UNLOADED_DATE.and_time(NaiveTime::MIN).and_utc()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgressKey {
    pub table: String,
    pub partition: String,
}

impl ProgressKey {
    pub fn new(table: &str, partition: &str) -> ProgressKey {
        ProgressKey { table: table.to_string(), partition: partition.to_string() }
    }
}

impl std::fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.table, self.partition)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadProgress {
    pub last_ts: DateTime<Utc>,
    pub last_id: i64,
    pub job_start_ts: DateTime<Utc>,
    pub batch_start_ts: DateTime<Utc>,
    pub batch_complete_ts: DateTime<Utc>,
}

impl LoadProgress {
    fn fresh(job_start: DateTime<Utc>, now: DateTime<Utc>) -> LoadProgress {
        LoadProgress {
            last_ts: unloaded_ts(),
            last_id: 0,
            job_start_ts: job_start,
            batch_start_ts: now,
            batch_complete_ts: unloaded_ts(),
        }
    }

    /// No batch has ever been checkpointed.
    pub fn is_initial(&self) -> bool {
        self.last_ts <= unloaded_ts() && self.last_id == 0
    }

    pub fn cursor(&self) -> (DateTime<Utc>, i64) {
        (self.last_ts, self.last_id)
    }
}

/// Absent progress counts as historical.
pub fn is_historical(progress: Option<&LoadProgress>) -> bool {
    progress.map(|p| p.last_ts <= historical_epoch()).unwrap_or(true)
}

/// Absent or never-advanced progress means the unit loads from scratch.
pub fn is_initial(progress: Option<&LoadProgress>) -> bool {
    progress.map(|p| p.is_initial()).unwrap_or(true)
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &ProgressKey) -> PipelineResult<Option<LoadProgress>>;

    /// Create the record if missing and stamp the job and batch start times.
    async fn begin_run(&self, key: &ProgressKey, job_start: DateTime<Utc>) -> PipelineResult<LoadProgress>;

    /// Move the cursor forward; a cursor at or behind the stored one is ignored.
    /// Returns whether the record changed.
    async fn advance(
        &self,
        key: &ProgressKey,
        last_ts: DateTime<Utc>,
        last_id: i64,
        completed_at: DateTime<Utc>,
    ) -> PipelineResult<bool>;

    async fn mark_complete(&self, key: &ProgressKey, completed_at: DateTime<Utc>) -> PipelineResult<()>;
}

/// Process-local store for tests and for runs that do not persist progress.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<ProgressKey, LoadProgress>>,
    fail_advance: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> MemoryCheckpointStore { MemoryCheckpointStore::default() }

    /// Seed a record, e.g. a checkpoint left by an earlier run.
    pub fn insert(&self, key: ProgressKey, progress: LoadProgress) {
        self.records.lock().insert(key, progress);
    }

    pub fn snapshot(&self, key: &ProgressKey) -> Option<LoadProgress> {
        self.records.lock().get(key).cloned()
    }

    /// Make every following `advance` fail until switched off.
    pub fn fail_advances(&self, on: bool) {
        self.fail_advance.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, key: &ProgressKey) -> PipelineResult<Option<LoadProgress>> {
        Ok(self.snapshot(key))
    }

    async fn begin_run(&self, key: &ProgressKey, job_start: DateTime<Utc>) -> PipelineResult<LoadProgress> {
        let now = Utc::now();
        let mut records = self.records.lock();
        let entry = records.entry(key.clone()).or_insert_with(|| LoadProgress::fresh(job_start, now));
        entry.job_start_ts = job_start;
        entry.batch_start_ts = now;
        Ok(entry.clone())
    }

    async fn advance(
        &self,
        key: &ProgressKey,
        last_ts: DateTime<Utc>,
        last_id: i64,
        completed_at: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        if self.fail_advance.load(Ordering::SeqCst) {
            return Err(PipelineError::checkpoint("checkpoint_write".to_string(), format!("{}: store unavailable", key)));
        }
        let mut records = self.records.lock();
        let Some(rec) = records.get_mut(key) else {
            return Err(PipelineError::checkpoint("checkpoint_missing".to_string(), format!("{} was never started", key)));
        };
        if (last_ts, last_id) <= rec.cursor() {
            return Ok(false);
        }
        rec.last_ts = last_ts;
        rec.last_id = last_id;
        rec.batch_complete_ts = completed_at;
        Ok(true)
    }

    async fn mark_complete(&self, key: &ProgressKey, completed_at: DateTime<Utc>) -> PipelineResult<()> {
        if let Some(rec) = self.records.lock().get_mut(key) {
            rec.batch_complete_ts = completed_at;
        }
        Ok(())
    }
}

/// `idr.load_progress` in the target store.
pub struct PgCheckpointStore {
    pool: Pool,
}

fn checkpoint_error(key: &ProgressKey, what: &str, err: impl std::fmt::Display) -> PipelineError {
    let e = PipelineError::checkpoint("checkpoint_write".to_string(), format!("{} {}: {}", key, what, err));
    error!(target: "idrload::progress", key = %key, error = %e, "checkpoint operation failed");
    e
}

const PROGRESS_COLUMNS: &str = "last_ts, last_id, job_start_ts, batch_start_ts, batch_complete_ts";

fn progress_from_row(row: &tokio_postgres::Row) -> Result<LoadProgress, tokio_postgres::Error> {
    Ok(LoadProgress {
        last_ts: row.try_get(0)?,
        last_id: row.try_get(1)?,
        job_start_ts: row.try_get(2)?,
        batch_start_ts: row.try_get(3)?,
        batch_complete_ts: row.try_get(4)?,
    })
}

impl PgCheckpointStore {
    pub fn new(pool: Pool) -> PgCheckpointStore { PgCheckpointStore { pool } }

    async fn client(&self, key: &ProgressKey) -> PipelineResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| checkpoint_error(key, "checkout", e))
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn get(&self, key: &ProgressKey) -> PipelineResult<Option<LoadProgress>> {
        let client = self.client(key).await?;
        let sql = format!(
            "SELECT {} FROM {} WHERE table_name = $1 AND batch_partition = $2",
            PROGRESS_COLUMNS, PROGRESS_TABLE
        );
        let row = client
            .query_opt(sql.as_str(), &[&key.table, &key.partition])
            .await
            .map_err(|e| checkpoint_error(key, "read", e))?;
        row.map(|r| progress_from_row(&r)).transpose().map_err(|e| checkpoint_error(key, "decode", e))
    }

    async fn begin_run(&self, key: &ProgressKey, job_start: DateTime<Utc>) -> PipelineResult<LoadProgress> {
        let client = self.client(key).await?;
        let sql = format!(
            "INSERT INTO {t} (table_name, batch_partition, last_ts, last_id, job_start_ts, batch_start_ts, batch_complete_ts) \
             VALUES ($1, $2, $3, 0, $4, NOW(), $3) \
             ON CONFLICT (table_name, batch_partition) DO UPDATE \
             SET job_start_ts = EXCLUDED.job_start_ts, batch_start_ts = EXCLUDED.batch_start_ts \
             RETURNING {c}",
            t = PROGRESS_TABLE,
            c = PROGRESS_COLUMNS
        );
        let row = client
            .query_one(sql.as_str(), &[&key.table, &key.partition, &unloaded_ts(), &job_start])
            .await
            .map_err(|e| checkpoint_error(key, "begin", e))?;
        let progress = progress_from_row(&row).map_err(|e| checkpoint_error(key, "decode", e))?;
        debug!(target: "idrload::progress", key = %key, last_ts = %progress.last_ts, last_id = progress.last_id, "run started");
        Ok(progress)
    }

    async fn advance(
        &self,
        key: &ProgressKey,
        last_ts: DateTime<Utc>,
        last_id: i64,
        completed_at: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        let client = self.client(key).await?;
        let sql = format!(
            "UPDATE {} SET last_ts = $3, last_id = $4, batch_complete_ts = $5 \
             WHERE table_name = $1 AND batch_partition = $2 \
             AND (last_ts < $3 OR (last_ts = $3 AND last_id < $4))",
            PROGRESS_TABLE
        );
        let n = client
            .execute(sql.as_str(), &[&key.table, &key.partition, &last_ts, &last_id, &completed_at])
            .await
            .map_err(|e| checkpoint_error(key, "advance", e))?;
        Ok(n == 1)
    }

    async fn mark_complete(&self, key: &ProgressKey, completed_at: DateTime<Utc>) -> PipelineResult<()> {
        let client = self.client(key).await?;
        let sql = format!(
            "UPDATE {} SET batch_complete_ts = $3 WHERE table_name = $1 AND batch_partition = $2",
            PROGRESS_TABLE
        );
        client
            .execute(sql.as_str(), &[&key.table, &key.partition, &completed_at])
            .await
            .map_err(|e| checkpoint_error(key, "complete", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn progress_at(ts: DateTime<Utc>) -> LoadProgress {
        LoadProgress { last_ts: ts, last_id: 1, job_start_ts: ts, batch_start_ts: ts, batch_complete_ts: ts }
    }

    #[test]
    fn historical_switches_at_epoch() {
        assert!(is_historical(None));
        assert!(is_historical(Some(&progress_at(historical_epoch()))));
        assert!(!is_historical(Some(&progress_at(historical_epoch() + Duration::seconds(1)))));
    }

    #[tokio::test]
    async fn advance_is_monotone() {
        let store = MemoryCheckpointStore::new();
        let key = ProgressKey::new("idr.t", "p1");
        let start = Utc::now();
        let p = store.begin_run(&key, start).await.unwrap();
        assert!(p.is_initial());

        let t1 = historical_epoch() + Duration::days(10);
        assert!(store.advance(&key, t1, 5, start).await.unwrap());
        assert!(!store.advance(&key, t1, 5, start).await.unwrap());
        assert!(!store.advance(&key, t1, 4, start).await.unwrap());
        assert!(!store.advance(&key, t1 - Duration::seconds(1), 99, start).await.unwrap());
        assert!(store.advance(&key, t1, 6, start).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().unwrap().cursor(), (t1, 6));
    }

    #[tokio::test]
    async fn begin_run_keeps_existing_cursor() {
        let store = MemoryCheckpointStore::new();
        let key = ProgressKey::new("idr.t", "default");
        let t = historical_epoch() + Duration::days(1);
        store.insert(key.clone(), progress_at(t));
        let later = t + Duration::days(3);
        let p = store.begin_run(&key, later).await.unwrap();
        assert_eq!(p.cursor(), (t, 1));
        assert_eq!(p.job_start_ts, later);
        assert!(!p.is_initial());
    }

    #[tokio::test]
    async fn failing_store_surfaces_checkpoint_errors() {
        let store = MemoryCheckpointStore::new();
        let key = ProgressKey::new("idr.t", "p");
        store.begin_run(&key, Utc::now()).await.unwrap();
        store.fail_advances(true);
        let err = store.advance(&key, Utc::now(), 1, Utc::now()).await.unwrap_err();
        assert_eq!(err.code_str(), "checkpoint_write");
    }
}
