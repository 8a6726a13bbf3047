//! Source warehouse access.
//!
//! The executor only sees a [`Warehouse`]: run a plan, get a stream of rows in plan column order.
//! [`PgWarehouse`] streams from Postgres through a pooled connection. [`MemoryWarehouse`] holds
//! pre-joined records and applies the plan's filter, alignment, resume cursor and ordering
//! itself; it backs the tests and local dry runs.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::RwLock;
use tokio_postgres::types::ToSql;
use tracing::{debug, info};

use crate::error::{fetch_error, PipelineError, PipelineResult};
use crate::model::{FieldSource, TableModel, ALIAS_CLM};
use crate::planner::{align, ChildRecord, FetchPlan};
use crate::sql::Expr;
use crate::value::{Row, RowSchema, SqlValue};

pub type RowStream = BoxStream<'static, PipelineResult<Row>>;

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Start the planned query. Rows arrive in `plan.columns` order.
    async fn fetch(&self, model: &TableModel, plan: &FetchPlan) -> PipelineResult<RowStream>;
}

pub struct PgWarehouse {
    pool: Pool,
}

impl PgWarehouse {
    pub fn new(pool: Pool) -> PgWarehouse { PgWarehouse { pool } }
}

/// Keeps the pooled connection checked out until the result is drained.
struct PooledRows {
    _client: Object,
    rows: Pin<Box<tokio_postgres::RowStream>>,
    schema: Arc<RowSchema>,
}

impl Stream for PooledRows {
    type Item = PipelineResult<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rows.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(pg_row))) => {
                let values = (0..pg_row.len())
                    .map(|i| SqlValue::from_pg(&pg_row, i))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| fetch_error("decode row", e));
                Poll::Ready(Some(values.map(|v| Row::new(this.schema.clone(), v))))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(fetch_error("read rows", e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn fetch(&self, _model: &TableModel, plan: &FetchPlan) -> PipelineResult<RowStream> {
        let client = self.pool.get().await?;
        let params = plan.params.iter().map(|p| p as &(dyn ToSql + Sync));
        let rows = client
            .query_raw(plan.sql.as_str(), params)
            .await
            .map_err(|e| fetch_error(&format!("query {}", plan.key), e))?;
        debug!(target: "idrload::source", key = %plan.key, "warehouse query started");
        let schema = RowSchema::new(plan.columns.clone());
        Ok(PooledRows { _client: client, rows: Box::pin(rows), schema }.boxed())
    }
}

/// A pre-joined source record keyed by `alias.column` (bare column for alias-less fields,
/// output name for expression and derived fields).
pub type SourceRecord = HashMap<String, SqlValue>;

/// One claim with its child records, for claim-item models. Parent and child records are keyed
/// by bare column name; children are grouped by kind alias.
#[derive(Debug, Clone, Default)]
pub struct ClaimBundle {
    pub parent: ChildRecord,
    pub children: HashMap<String, Vec<ChildRecord>>,
}

#[derive(Default)]
pub struct MemoryWarehouse {
    tables: RwLock<HashMap<String, Vec<SourceRecord>>>,
    bundles: RwLock<HashMap<String, Vec<ClaimBundle>>>,
    deceased: RwLock<HashSet<i64>>,
    failures: AtomicU32,
    fetches: AtomicUsize,
}

fn record_key(field_name: &str, source: &FieldSource) -> String {
    match source {
        FieldSource::Column { alias: Some(a), column } => format!("{}.{}", a, column),
        FieldSource::Column { alias: None, column } => column.clone(),
        FieldSource::Expr(_) | FieldSource::Derived => field_name.to_string(),
    }
}

fn value_cmp(a: &SqlValue, b: &SqlValue) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

impl MemoryWarehouse {
    pub fn new() -> MemoryWarehouse { MemoryWarehouse::default() }

    /// Add pre-joined records for a target table.
    pub fn insert(&self, table: &str, records: Vec<SourceRecord>) {
        self.tables.write().entry(table.to_string()).or_default().extend(records);
    }

    /// Add claim bundles for a claim-item target table.
    pub fn insert_bundles(&self, table: &str, bundles: Vec<ClaimBundle>) {
        self.bundles.write().entry(table.to_string()).or_default().extend(bundles);
    }

    pub fn mark_deceased(&self, bene_sk: i64) {
        self.deceased.write().insert(bene_sk);
    }

    /// Fail the next `n` fetches with a retryable error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, AtomicOrdering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(AtomicOrdering::SeqCst)
    }

    fn is_deceased(&self, v: Option<&SqlValue>) -> bool {
        v.and_then(|v| v.as_i64()).map(|k| self.deceased.read().contains(&k)).unwrap_or(false)
    }

    fn claim_passes(&self, plan: &FetchPlan, column: &dyn Fn(&str) -> SqlValue) -> bool {
        match &plan.filter {
            Some(f) => {
                let bene = column("bene_sk");
                f.matches(column, self.is_deceased(Some(&bene)))
            }
            None => true,
        }
    }

    /// Flatten bundles into pre-joined records, one per aligned slot.
    fn aligned_records(&self, model: &TableModel, plan: &FetchPlan) -> Vec<SourceRecord> {
        let Some(spec) = &model.alignment else { return Vec::new() };
        let bundles = self.bundles.read();
        let mut out = Vec::new();
        for bundle in bundles.get(&model.table).map(|b| b.as_slice()).unwrap_or(&[]) {
            let parent = |c: &str| bundle.parent.get(c).cloned().unwrap_or(SqlValue::Null);
            if !self.claim_passes(plan, &parent) {
                continue;
            }
            if let Some(floor) = plan.min_transaction_date {
                if !matches!(parent("clm_idr_ld_dt").as_date(), Some(d) if d >= floor) {
                    continue;
                }
            }
            let parent_key = parent(&spec.parent_key);
            let children: HashMap<String, Vec<ChildRecord>> = bundle
                .children
                .iter()
                .map(|(kind, rows)| {
                    let rows = rows
                        .iter()
                        .map(|r| {
                            let mut r = r.clone();
                            r.entry(spec.parent_key.clone()).or_insert_with(|| parent_key.clone());
                            r
                        })
                        .collect();
                    (kind.clone(), rows)
                })
                .collect();
            for slot in align(spec, &children) {
                let mut rec: SourceRecord =
                    bundle.parent.iter().map(|(k, v)| (format!("{}.{}", ALIAS_CLM, k), v.clone())).collect();
                rec.insert(format!("{}.{}", spec.group_alias, spec.slot_column), SqlValue::Int(slot.slot));
                for (alias, member) in slot.members {
                    for (k, v) in member {
                        rec.insert(format!("{}.{}", alias, k), v);
                    }
                }
                out.push(rec);
            }
        }
        out
    }

    fn flat_records(&self, model: &TableModel, plan: &FetchPlan) -> Vec<SourceRecord> {
        let tables = self.tables.read();
        let deceased_key = match &model.deceased_key {
            Some(Expr::Column { alias: Some(a), name }) => Some(format!("{}.{}", a, name)),
            Some(Expr::Column { alias: None, name }) => Some(name.clone()),
            _ => None,
        };
        tables
            .get(&model.table)
            .map(|r| r.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter(|rec| {
                let claim = |c: &str| rec.get(&format!("{}.{}", ALIAS_CLM, c)).cloned().unwrap_or(SqlValue::Null);
                self.claim_passes(plan, &claim)
            })
            .filter(|rec| !deceased_key.as_ref().map(|k| self.is_deceased(rec.get(k))).unwrap_or(false))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn fetch(&self, model: &TableModel, plan: &FetchPlan) -> PipelineResult<RowStream> {
        self.fetches.fetch_add(1, AtomicOrdering::SeqCst);
        let pending = self.failures.load(AtomicOrdering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, AtomicOrdering::SeqCst);
            return Err(PipelineError::fetch("warehouse_query".to_string(), format!("{}: injected failure", plan.key)));
        }

        let records =
            if model.alignment.is_some() { self.aligned_records(model, plan) } else { self.flat_records(model, plan) };
        let schema = RowSchema::new(plan.columns.clone());
        let keys: Vec<String> = plan
            .columns
            .iter()
            .map(|c| model.field(c).map(|f| record_key(&f.name, &f.source)).unwrap_or_else(|| c.clone()))
            .collect();
        let mut rows: Vec<Row> = records
            .iter()
            .map(|rec| Row::new(schema.clone(), keys.iter().map(|k| rec.get(k).cloned().unwrap_or(SqlValue::Null)).collect()))
            .collect();

        match &plan.cursor {
            Some(cursor) => {
                if let Some(last) = plan.resume {
                    rows.retain(|r| cursor.is_after(cursor.cursor_of(r), last));
                }
                rows.sort_by_key(|r| cursor.cursor_of(r));
            }
            None => {
                let pk = model.primary_key();
                rows.sort_by(|a, b| {
                    pk.iter()
                        .map(|c| value_cmp(a.get(c).unwrap_or(&SqlValue::Null), b.get(c).unwrap_or(&SqlValue::Null)))
                        .find(|o| *o != Ordering::Equal)
                        .unwrap_or(Ordering::Equal)
                });
            }
        }
        info!(target: "idrload::source", key = %plan.key, rows = rows.len(), "in-memory fetch");
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }
}
