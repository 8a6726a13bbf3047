//! Staged upsert of fetched batches into the target store.
//!
//! A batch is applied in one transaction or not at all. New keys get a fresh
//! `bfd_created_ts`, existing keys have every non-key insertable column overwritten and
//! `bfd_updated_ts` stamped. Models without update timestamps never rewrite a loaded row.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use futures_util::{pin_mut, SinkExt};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{load_error, PipelineError, PipelineResult};
use crate::model::{LoadStrategy, TableModel, CREATED_TS_COLUMN, UPDATED_TS_COLUMN};
use crate::planner::{FetchPlan, LoadType};
use crate::value::{Row, SqlValue};

/// Flush the COPY buffer once it grows past this.
const COPY_CHUNK_BYTES: usize = 1 << 20;

#[async_trait]
pub trait UpsertLoader: Send + Sync {
    /// Apply one batch atomically and return the number of rows written. `job_ts` is fixed for
    /// the whole unit and stamps every meta column the batch touches.
    async fn load_batch(&self, model: &TableModel, plan: &FetchPlan, rows: &[Row], job_ts: DateTime<Utc>)
        -> PipelineResult<u64>;
}

/// Unqualified stage name; temporary tables cannot carry a schema.
fn stage_name(table: &str) -> String {
    format!("{}_stage", table.rsplit('.').next().unwrap_or(table))
}

/// Column list written from a batch, in model order.
fn load_columns(model: &TableModel) -> Vec<&str> {
    model
        .insertable_columns()
        .into_iter()
        .filter(|c| !model.computed_keys.iter().any(|k| k == c))
        .collect()
}

fn upsert_sql(model: &TableModel, stage: &str) -> String {
    let cols = load_columns(model);
    let pk = model.primary_key();
    let meta = model.meta_columns();
    let meta_values = vec!["$1"; meta.len()];
    let updates: Vec<String> = cols
        .iter()
        .filter(|c| !pk.contains(c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    let conflict = if model.is_immutable() || updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}, {} = $1", updates.join(", "), UPDATED_TS_COLUMN)
    };
    format!(
        "INSERT INTO {table} ({cols}, {meta})\nSELECT {cols}, {vals} FROM {stage}\nON CONFLICT ({pk}) {conflict}",
        table = model.table,
        cols = cols.join(", "),
        meta = meta.join(", "),
        vals = meta_values.join(", "),
        stage = stage,
        pk = pk.join(", "),
        conflict = conflict
    )
}

/// Stamp the parent rows of every key in the stage, locking them in key order.
fn last_updated_sql(model: &TableModel, stage: &str) -> Option<String> {
    let lu = model.last_updated.as_ref()?;
    let key = model.last_updated_key()?;
    let sets: Vec<String> = lu.columns.iter().map(|c| format!("{} = $1", c)).collect();
    Some(format!(
        "WITH locked AS (SELECT {key} FROM {t} WHERE {key} IN (SELECT {key} FROM {stage}) ORDER BY {key} FOR UPDATE)\n\
         UPDATE {t} u SET {sets} FROM locked l WHERE u.{key} = l.{key}",
        key = key,
        t = lu.table,
        stage = stage,
        sets = sets.join(", ")
    ))
}

fn copy_rows(rows: &[Row], buf: &mut BytesMut, columns: &[&str]) {
    for row in rows {
        for (i, c) in columns.iter().enumerate() {
            if i > 0 {
                buf.extend_from_slice(b"\t");
            }
            row.get(c).cloned().unwrap_or(SqlValue::Null).strip_nul().write_copy_text(buf);
        }
        buf.extend_from_slice(b"\n");
    }
}

pub struct PgLoader {
    pool: Pool,
}

impl PgLoader {
    pub fn new(pool: Pool) -> PgLoader { PgLoader { pool } }
}

#[async_trait]
impl UpsertLoader for PgLoader {
    #[tracing::instrument(level = "debug", skip_all, fields(key = %plan.key, rows = rows.len()), err)]
    async fn load_batch(
        &self,
        model: &TableModel,
        plan: &FetchPlan,
        rows: &[Row],
        job_ts: DateTime<Utc>,
    ) -> PipelineResult<u64> {
        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| PipelineError::load("pool_checkout".to_string(), e.to_string()))?;
        let tx = client.transaction().await.map_err(|e| load_error("begin", e))?;
        let stage = stage_name(&model.table);
        let columns = load_columns(model);

        let t = Instant::now();
        tx.batch_execute(&format!("CREATE TEMPORARY TABLE {} (LIKE {}) ON COMMIT DROP", stage, model.table))
            .await
            .map_err(|e| load_error("create stage", e))?;
        let mut dropped: Vec<&str> = model.computed_keys.iter().map(String::as_str).collect();
        dropped.push(CREATED_TS_COLUMN);
        if !model.is_immutable() {
            dropped.push(UPDATED_TS_COLUMN);
        }
        for col in dropped {
            tx.batch_execute(&format!("ALTER TABLE {} DROP COLUMN IF EXISTS {}", stage, col))
                .await
                .map_err(|e| load_error("shape stage", e))?;
        }
        debug!(target: "idrload::loader", table = %model.table, elapsed_ms = t.elapsed().as_millis() as u64, "stage created");

        let t = Instant::now();
        let sink = tx
            .copy_in(format!("COPY {} ({}) FROM STDIN", stage, columns.join(", ")).as_str())
            .await
            .map_err(|e| load_error("copy start", e))?;
        pin_mut!(sink);
        let mut buf = BytesMut::with_capacity(COPY_CHUNK_BYTES);
        for chunk in rows.chunks(1024) {
            copy_rows(chunk, &mut buf, &columns);
            if buf.len() >= COPY_CHUNK_BYTES {
                sink.send(buf.split().freeze()).await.map_err(|e| load_error("copy", e))?;
            }
        }
        if !buf.is_empty() {
            sink.send(buf.split().freeze()).await.map_err(|e| load_error("copy", e))?;
        }
        let copied = sink.finish().await.map_err(|e| load_error("copy finish", e))?;
        debug!(target: "idrload::loader", table = %model.table, copied, elapsed_ms = t.elapsed().as_millis() as u64, "batch copied");

        let t = Instant::now();
        if model.strategy == LoadStrategy::Replace {
            tx.execute(format!("DELETE FROM {}", model.table).as_str(), &[])
                .await
                .map_err(|e| load_error("replace", e))?;
        }
        let written = tx
            .execute(upsert_sql(model, &stage).as_str(), &[&job_ts])
            .await
            .map_err(|e| load_error("merge", e))?;
        if plan.load_type == LoadType::Incremental {
            if let Some(sql) = last_updated_sql(model, &stage) {
                tx.execute(sql.as_str(), &[&job_ts]).await.map_err(|e| load_error("last updated", e))?;
            }
        }
        debug!(target: "idrload::loader", table = %model.table, written, elapsed_ms = t.elapsed().as_millis() as u64, "batch merged");

        let t = Instant::now();
        tx.commit().await.map_err(|e| load_error("commit", e))?;
        debug!(target: "idrload::loader", table = %model.table, elapsed_ms = t.elapsed().as_millis() as u64, "batch committed");
        Ok(written)
    }
}

/// A loaded target row with its meta timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub values: HashMap<String, SqlValue>,
    pub created: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
}

type StoredTable = BTreeMap<Vec<String>, StoredRow>;

/// In-memory target store with the same upsert semantics.
#[derive(Default)]
pub struct MemoryLoader {
    tables: Mutex<HashMap<String, StoredTable>>,
    failures: AtomicU32,
    batches: AtomicUsize,
}

fn key_of(pk: &[&str], values: &HashMap<String, SqlValue>) -> Vec<String> {
    pk.iter().map(|c| values.get(*c).map(|v| v.to_string()).unwrap_or_default()).collect()
}

impl MemoryLoader {
    pub fn new() -> MemoryLoader { MemoryLoader::default() }

    /// Seed a parent row, e.g. a beneficiary that last-updated stamps target.
    pub fn seed(&self, table: &str, key: &[&str], values: HashMap<String, SqlValue>, created: DateTime<Utc>) {
        let k = key_of(key, &values);
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(k, StoredRow { values, created, updated: None });
    }

    /// Fail the next `n` batches before anything is applied.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Rows of a table in primary key order.
    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.tables.lock().get(table).map(|t| t.values().cloned().collect()).unwrap_or_default()
    }
}

#[async_trait]
impl UpsertLoader for MemoryLoader {
    async fn load_batch(
        &self,
        model: &TableModel,
        plan: &FetchPlan,
        rows: &[Row],
        job_ts: DateTime<Utc>,
    ) -> PipelineResult<u64> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(PipelineError::load("target_write".to_string(), format!("{}: injected failure", plan.key)));
        }
        let columns = load_columns(model);
        let pk = model.primary_key();
        let rewrite = !model.is_immutable() && columns.iter().any(|c| !pk.contains(c));

        let mut tables = self.tables.lock();
        // work on a copy so a failure leaves the table untouched
        let mut target = tables.get(&model.table).cloned().unwrap_or_default();
        if model.strategy == LoadStrategy::Replace {
            target.clear();
        }
        let mut written = 0;
        for row in rows {
            let values: HashMap<String, SqlValue> = columns
                .iter()
                .map(|c| (c.to_string(), row.get(c).cloned().unwrap_or(SqlValue::Null).strip_nul()))
                .collect();
            let key = key_of(&pk, &values);
            match target.get_mut(&key) {
                Some(existing) if rewrite => {
                    existing.values = values;
                    existing.updated = Some(job_ts);
                    written += 1;
                }
                Some(_) => {}
                None => {
                    target.insert(key, StoredRow { values, created: job_ts, updated: None });
                    written += 1;
                }
            }
        }

        let stamp = match (&model.last_updated, model.last_updated_key()) {
            (Some(lu), Some(k)) if plan.load_type == LoadType::Incremental => Some((lu, k)),
            _ => None,
        };
        let mut parent = None;
        if let Some((lu, k)) = stamp {
            let keys: Vec<SqlValue> = rows.iter().filter_map(|r| r.get(k).cloned()).collect();
            let mut p = if lu.table == model.table { target.clone() } else { tables.get(&lu.table).cloned().unwrap_or_default() };
            for stored in p.values_mut() {
                if stored.values.get(k).map(|v| keys.contains(v)).unwrap_or(false) {
                    for c in &lu.columns {
                        stored.values.insert(c.clone(), SqlValue::Timestamp(job_ts));
                    }
                }
            }
            parent = Some((lu.table.clone(), p));
        }

        match parent {
            Some((name, p)) if name == model.table => {
                tables.insert(name, p);
            }
            Some((name, p)) => {
                tables.insert(model.table.clone(), target);
                tables.insert(name, p);
            }
            None => {
                tables.insert(model.table.clone(), target);
            }
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        debug!(target: "idrload::loader", key = %plan.key, rows = rows.len(), written, "in-memory batch applied");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldSpec, Registry, TableFamily};
    use crate::sql::Relation;

    fn model(strategy: LoadStrategy, with_update: bool) -> TableModel {
        let mut fields = vec![
            FieldSpec::int("id").alias("t").pk().batch_id(),
            FieldSpec::text("name").alias("t"),
            FieldSpec::timestamp("idr_insrt_ts").alias("t").batch_ts().insert_excluded(),
        ];
        if with_update {
            fields.push(FieldSpec::timestamp("idr_updt_ts").alias("t").update_ts());
        }
        TableModel::new("idr.things", TableFamily::Reference, strategy, Relation::table("s.things", "t")).fields(fields)
    }

    #[test]
    fn upsert_statement_shapes() {
        let m = model(LoadStrategy::Incremental, true);
        let sql = upsert_sql(&m, "things_stage");
        assert_eq!(
            sql,
            "INSERT INTO idr.things (id, name, idr_updt_ts, bfd_created_ts, bfd_updated_ts)\n\
             SELECT id, name, idr_updt_ts, $1, $1 FROM things_stage\n\
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, idr_updt_ts = EXCLUDED.idr_updt_ts, bfd_updated_ts = $1"
        );
        let immutable = upsert_sql(&model(LoadStrategy::Incremental, false), "things_stage");
        assert!(immutable.ends_with("ON CONFLICT (id) DO NOTHING"));
        assert!(immutable.contains("(id, name, bfd_created_ts)"));
        assert_eq!(stage_name("idr.claim_rx"), "claim_rx_stage");
    }

    #[test]
    fn last_updated_locks_parent_rows_in_key_order() {
        let reg = Registry::load().unwrap();
        let m = reg.get("idr.claim_item_professional").unwrap();
        let sql = last_updated_sql(m, "claim_item_professional_stage").unwrap();
        assert!(sql.starts_with("WITH locked AS (SELECT clm_uniq_id FROM idr.claim_professional WHERE clm_uniq_id IN (SELECT clm_uniq_id FROM claim_item_professional_stage) ORDER BY clm_uniq_id FOR UPDATE)"));
        assert!(sql.ends_with("UPDATE idr.claim_professional u SET bfd_claim_updated_ts = $1 FROM locked l WHERE u.clm_uniq_id = l.clm_uniq_id"));
        assert!(last_updated_sql(reg.get("idr.contract_pbp_number").unwrap(), "x").is_none());
    }

    #[test]
    fn computed_keys_are_not_loaded() {
        let reg = Registry::load().unwrap();
        let m = reg.get("idr.beneficiary").unwrap();
        assert!(!load_columns(m).iter().any(|c| m.computed_keys.iter().any(|k| k == c)));
    }
}
