//! Per-unit fetch/load loop.
//!
//! One (table, partition) unit runs `Idle -> Planning -> Fetching -> Loading -> Checkpointing`
//! and back to `Fetching` until the stream is drained, or ends in `Failed`. Batches are bounded
//! by `batch_size` except that rows sharing the last row's cursor are never split across two
//! batches; otherwise a checkpoint taken mid-run would skip the rest of that run on resume.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{PipelineError, PipelineResult};
use crate::loader::UpsertLoader;
use crate::model::TableModel;
use crate::partition::{Catalog, PartitionUnit};
use crate::planner::{CursorSpec, FetchPlan, Planner, RunContext};
use crate::progress::{CheckpointStore, ProgressKey};
use crate::source::{RowStream, Warehouse};
use crate::value::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Idle,
    Planning,
    Fetching,
    Loading,
    Checkpointing,
    Failed,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Idle => "idle",
            UnitState::Planning => "planning",
            UnitState::Fetching => "fetching",
            UnitState::Loading => "loading",
            UnitState::Checkpointing => "checkpointing",
            UnitState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a unit got done before it stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub key: ProgressKey,
    pub batches: u64,
    pub rows: u64,
    /// Last cursor written by this unit.
    pub checkpoint: Option<(DateTime<Utc>, i64)>,
    /// False when cancellation stopped the unit before its stream was drained.
    pub finished: bool,
}

pub struct Executor {
    settings: Arc<Settings>,
    catalog: Arc<Catalog>,
    warehouse: Arc<dyn Warehouse>,
    loader: Arc<dyn UpsertLoader>,
    checkpoints: Arc<dyn CheckpointStore>,
}

struct Tracker<'a> {
    key: &'a ProgressKey,
    state: UnitState,
}

impl Tracker<'_> {
    fn enter(&mut self, next: UnitState) {
        debug!(target: "idrload::executor", key = %self.key, from = %self.state, to = %next, "state");
        self.state = next;
    }
}

/// Rows read past a full batch that belong to the next one.
struct BatchReader {
    stream: RowStream,
    carry: Option<Row>,
    done: bool,
}

enum Next {
    Row(Row),
    End,
    Cancelled,
}

impl BatchReader {
    async fn next_row(&mut self, settings: &Settings, cancel: &CancellationToken) -> PipelineResult<Next> {
        if let Some(r) = self.carry.take() {
            return Ok(Next::Row(r));
        }
        if self.done {
            return Ok(Next::End);
        }
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Next::Cancelled),
            n = timeout(settings.fetch_timeout(), self.stream.next()) => n,
        };
        match next {
            Err(_) => Err(PipelineError::fetch(
                "fetch_timeout".to_string(),
                format!("no row within {}s", settings.fetch_timeout_secs),
            )),
            Ok(None) => {
                self.done = true;
                Ok(Next::End)
            }
            Ok(Some(row)) => row.map(Next::Row),
        }
    }

    /// Read the next batch. `None` means cancellation hit before the batch was complete;
    /// the partial batch is dropped unloaded.
    async fn next_batch(
        &mut self,
        plan: &FetchPlan,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> PipelineResult<Option<Vec<Row>>> {
        let mut batch = Vec::new();
        loop {
            let row = match self.next_row(settings, cancel).await? {
                Next::Row(r) => r,
                Next::End => return Ok(Some(batch)),
                Next::Cancelled => return Ok(None),
            };
            if plan.single_batch || batch.len() < settings.batch_size {
                batch.push(row);
                continue;
            }
            match (&plan.cursor, batch.last()) {
                (Some(c), Some(last)) if same_cursor(c, last, &row) => batch.push(row),
                _ => {
                    self.carry = Some(row);
                    return Ok(Some(batch));
                }
            }
        }
    }
}

fn same_cursor(cursor: &CursorSpec, a: &Row, b: &Row) -> bool {
    cursor.cursor_of(a) == cursor.cursor_of(b)
}

/// Apply every field transform in place.
fn transform_rows(model: &TableModel, rows: &mut [Row]) {
    let transforms: Vec<_> = model.fields.iter().filter_map(|f| f.transform.as_ref().map(|t| (f.name.as_str(), t))).collect();
    if transforms.is_empty() {
        return;
    }
    for row in rows.iter_mut() {
        for (name, t) in &transforms {
            if let Some(v) = row.get(name).cloned() {
                row.set(name, t.apply(v));
            }
        }
    }
}

impl Executor {
    pub fn new(
        settings: Arc<Settings>,
        catalog: Arc<Catalog>,
        warehouse: Arc<dyn Warehouse>,
        loader: Arc<dyn UpsertLoader>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Executor {
        Executor { settings, catalog, warehouse, loader, checkpoints }
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Run one unit to completion, cancellation or failure.
    pub async fn run_unit(
        &self,
        model: &TableModel,
        unit: &PartitionUnit,
        run: &RunContext,
        cancel: &CancellationToken,
    ) -> PipelineResult<UnitOutcome> {
        let key = ProgressKey::new(&model.table, &unit.partition.name);
        let mut tracker = Tracker { key: &key, state: UnitState::Idle };
        let result = self.drive(model, unit, run, cancel, &mut tracker).await;
        match &result {
            Ok(outcome) => {
                tracker.enter(UnitState::Idle);
                info!(
                    target: "idrload::executor",
                    key = %key,
                    batches = outcome.batches,
                    rows = outcome.rows,
                    finished = outcome.finished,
                    "unit stopped"
                );
            }
            Err(e) => {
                let at = tracker.state;
                tracker.enter(UnitState::Failed);
                match e {
                    PipelineError::Checkpoint { .. } => {
                        error!(target: "idrload::executor", key = %key, state = %at, error = %e, "checkpoint not persisted after a durable load")
                    }
                    _ => warn!(target: "idrload::executor", key = %key, state = %at, error = %e, "unit failed"),
                }
            }
        }
        result
    }

    async fn drive(
        &self,
        model: &TableModel,
        unit: &PartitionUnit,
        run: &RunContext,
        cancel: &CancellationToken,
        tracker: &mut Tracker<'_>,
    ) -> PipelineResult<UnitOutcome> {
        let settings = self.settings.as_ref();
        let key = tracker.key.clone();
        let mut outcome = UnitOutcome { key: key.clone(), batches: 0, rows: 0, checkpoint: None, finished: false };
        if cancel.is_cancelled() {
            return Ok(outcome);
        }

        tracker.enter(UnitState::Planning);
        let progress = self.checkpoints.get(&key).await?;
        let plan = Planner::new(settings, &self.catalog).plan(model, unit, run, progress.as_ref())?;
        self.checkpoints.begin_run(&key, run.run_start).await?;
        // one stamp for every row this unit writes
        let job_ts = Utc::now();

        tracker.enter(UnitState::Fetching);
        let stream = match timeout(settings.fetch_timeout(), self.warehouse.fetch(model, &plan)).await {
            Ok(s) => s?,
            Err(_) => {
                return Err(PipelineError::fetch(
                    "fetch_timeout".to_string(),
                    format!("{}: query did not start within {}s", key, settings.fetch_timeout_secs),
                ))
            }
        };
        let mut reader = BatchReader { stream, carry: None, done: false };

        loop {
            if cancel.is_cancelled() {
                return Ok(outcome);
            }
            tracker.enter(UnitState::Fetching);
            let Some(mut batch) = reader.next_batch(&plan, settings, cancel).await? else {
                return Ok(outcome);
            };
            if batch.is_empty() {
                break;
            }
            // cursor comes from the raw row, before any transform touches it
            let cursor = plan.cursor.as_ref().and_then(|c| batch.last().map(|r| c.cursor_of(r)));
            transform_rows(model, &mut batch);

            tracker.enter(UnitState::Loading);
            let written = match timeout(settings.load_timeout(), self.loader.load_batch(model, &plan, &batch, job_ts)).await {
                Ok(r) => r?,
                Err(_) => {
                    return Err(PipelineError::load(
                        "load_timeout".to_string(),
                        format!("{}: batch of {} rows not committed within {}s", key, batch.len(), settings.load_timeout_secs),
                    ))
                }
            };
            outcome.batches += 1;
            outcome.rows += batch.len() as u64;

            if let Some((ts, id)) = cursor {
                tracker.enter(UnitState::Checkpointing);
                let advanced = match timeout(settings.load_timeout(), self.checkpoints.advance(&key, ts, id, Utc::now())).await {
                    Ok(r) => r?,
                    Err(_) => {
                        return Err(PipelineError::checkpoint(
                            "checkpoint_timeout".to_string(),
                            format!("{}: advance to ({}, {}) timed out", key, ts, id),
                        ))
                    }
                };
                if advanced {
                    outcome.checkpoint = Some((ts, id));
                } else {
                    debug!(target: "idrload::executor", key = %key, last_ts = %ts, last_id = id, "stored cursor already at or past batch");
                }
            }
            debug!(target: "idrload::executor", key = %key, rows = batch.len(), written, cursor = ?cursor, "batch done");
        }

        self.checkpoints.mark_complete(&key, Utc::now()).await?;
        outcome.finished = true;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryLoader;
    use crate::model::{FieldSpec, LoadStrategy, TableFamily};
    use crate::partition::{Partition, PartitionKind};
    use crate::progress::{LoadProgress, MemoryCheckpointStore};
    use crate::source::MemoryWarehouse;
    use crate::sql::Relation;
    use crate::value::SqlValue;
    use chrono::TimeZone;
    use std::collections::HashMap;

    const TABLE: &str = "idr.things";

    fn model() -> TableModel {
        TableModel::new(TABLE, TableFamily::Reference, LoadStrategy::Incremental, Relation::table("s.things", "t")).fields(vec![
            FieldSpec::int("id").alias("t").pk().batch_id(),
            FieldSpec::int("line").alias("t").pk(),
            FieldSpec::text("name").alias("t"),
            FieldSpec::timestamp("idr_insrt_ts").alias("t").batch_ts(),
        ])
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap()
    }

    fn record(id: i64, day: u32) -> HashMap<String, SqlValue> {
        line(id, 1, day)
    }

    fn line(id: i64, line: i64, day: u32) -> HashMap<String, SqlValue> {
        let mut r = HashMap::new();
        r.insert("t.id".to_string(), SqlValue::Int(id));
        r.insert("t.line".to_string(), SqlValue::Int(line));
        r.insert("t.name".to_string(), SqlValue::text(format!("n{}", id)));
        r.insert("t.idr_insrt_ts".to_string(), SqlValue::Timestamp(ts(day)));
        r
    }

    struct Harness {
        warehouse: Arc<MemoryWarehouse>,
        loader: Arc<MemoryLoader>,
        store: Arc<MemoryCheckpointStore>,
        exec: Executor,
    }

    fn harness(batch_size: usize) -> Harness {
        let settings = Settings { batch_size, ..Settings::default() };
        let warehouse = Arc::new(MemoryWarehouse::new());
        let loader = Arc::new(MemoryLoader::new());
        let store = Arc::new(MemoryCheckpointStore::new());
        let exec = Executor::new(
            Arc::new(settings),
            Arc::new(Catalog::standard()),
            warehouse.clone(),
            loader.clone(),
            store.clone(),
        );
        Harness { warehouse, loader, store, exec }
    }

    fn unit() -> PartitionUnit {
        PartitionUnit { kind: PartitionKind::ALL, partition: Partition::unpartitioned() }
    }

    fn run() -> RunContext {
        RunContext { run_start: ts(20), mode: crate::config::LoadMode::Production }
    }

    #[tokio::test]
    async fn equal_cursor_runs_stay_in_one_batch() {
        let h = harness(2);
        // the three lines of id 1 share one cursor, so the first batch grows to 4 rows
        h.warehouse.insert(TABLE, vec![record(0, 1), line(1, 1, 2), line(1, 2, 2), line(1, 3, 2), record(2, 3)]);
        let m = model();
        let out = h.exec.run_unit(&m, &unit(), &run(), &CancellationToken::new()).await.unwrap();
        assert!(out.finished);
        assert_eq!(out.rows, 5);
        assert_eq!(out.batches, 2);
        assert_eq!(out.checkpoint, Some((ts(3), 2)));
        assert_eq!(h.loader.rows(TABLE).len(), 5);
        let p = h.store.snapshot(&ProgressKey::new(TABLE, "default")).unwrap();
        assert_eq!(p.cursor(), (ts(3), 2));
    }

    #[tokio::test]
    async fn load_failure_keeps_the_previous_checkpoint() {
        let h = harness(2);
        h.warehouse.insert(TABLE, vec![record(1, 1), record(2, 2), record(3, 3), record(4, 4)]);
        let m = model();
        let out = h.exec.run_unit(&m, &unit(), &run(), &CancellationToken::new()).await.unwrap();
        assert_eq!(out.batches, 2);

        h.warehouse.insert(TABLE, vec![record(5, 5), record(6, 6)]);
        h.loader.fail_next(1);
        let err = h.exec.run_unit(&m, &unit(), &run(), &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_retryable());
        let p = h.store.snapshot(&ProgressKey::new(TABLE, "default")).unwrap();
        assert_eq!(p.cursor(), (ts(4), 4));

        let out = h.exec.run_unit(&m, &unit(), &run(), &CancellationToken::new()).await.unwrap();
        assert_eq!(out.rows, 2);
        assert_eq!(h.loader.rows(TABLE).len(), 6);
    }

    #[tokio::test]
    async fn cancelled_unit_loads_nothing() {
        let h = harness(10);
        h.warehouse.insert(TABLE, vec![record(1, 1)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = h.exec.run_unit(&model(), &unit(), &run(), &cancel).await.unwrap();
        assert!(!out.finished);
        assert_eq!(out.batches, 0);
        assert_eq!(h.loader.batch_count(), 0);
    }

    /// Reads nothing back, so every run plans from scratch against a store that may be ahead.
    struct BlindStore(Arc<MemoryCheckpointStore>);

    #[async_trait::async_trait]
    impl CheckpointStore for BlindStore {
        async fn get(&self, _key: &ProgressKey) -> PipelineResult<Option<LoadProgress>> {
            Ok(None)
        }
        async fn begin_run(&self, key: &ProgressKey, job_start: DateTime<Utc>) -> PipelineResult<LoadProgress> {
            self.0.begin_run(key, job_start).await
        }
        async fn advance(&self, key: &ProgressKey, last_ts: DateTime<Utc>, last_id: i64, completed_at: DateTime<Utc>) -> PipelineResult<bool> {
            self.0.advance(key, last_ts, last_id, completed_at).await
        }
        async fn mark_complete(&self, key: &ProgressKey, completed_at: DateTime<Utc>) -> PipelineResult<()> {
            self.0.mark_complete(key, completed_at).await
        }
    }

    #[tokio::test]
    async fn refused_advance_is_not_reported_as_checkpoint() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let store = Arc::new(MemoryCheckpointStore::new());
        let key = ProgressKey::new(TABLE, "default");
        let ahead = LoadProgress {
            last_ts: ts(9),
            last_id: 9,
            job_start_ts: ts(9),
            batch_start_ts: ts(9),
            batch_complete_ts: ts(9),
        };
        store.insert(key.clone(), ahead);
        let exec = Executor::new(
            Arc::new(Settings::default()),
            Arc::new(Catalog::standard()),
            warehouse.clone(),
            Arc::new(MemoryLoader::new()),
            Arc::new(BlindStore(store.clone())),
        );
        warehouse.insert(TABLE, vec![record(1, 1), record(2, 2)]);
        let out = exec.run_unit(&model(), &unit(), &run(), &CancellationToken::new()).await.unwrap();
        assert_eq!(out.rows, 2);
        assert!(out.finished);
        assert_eq!(out.checkpoint, None);
        assert_eq!(store.snapshot(&key).unwrap().cursor(), (ts(9), 9));
    }

    #[tokio::test]
    async fn checkpoint_failure_surfaces_after_load() {
        let h = harness(10);
        h.warehouse.insert(TABLE, vec![record(1, 1)]);
        h.store.fail_advances(true);
        let err = h.exec.run_unit(&model(), &unit(), &run(), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.code_str(), "checkpoint_write");
        // the batch itself is durable
        assert_eq!(h.loader.rows(TABLE).len(), 1);
    }
}
