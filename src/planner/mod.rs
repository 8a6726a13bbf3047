//! Fetch planning.
//!
//! [`Planner::plan`] turns a model, one partition unit and the unit's stored progress into a
//! rendered statement. The statement always has the same shape:
//!
//! - the `claims` CTE when the model scopes claims through one, then the alignment CTEs of
//!   claim-item models, then the model's own CTEs
//! - the projection, with derived fields appended as `derivation AS name`
//! - claim filter, static filters, deceased exclusion and the resume predicate in `WHERE`
//! - `ORDER BY` the cursor for resumable models, the primary key otherwise
//!
//! Mode only decides whether claim CTEs are marked `NOT MATERIALIZED`.

pub mod alignment;

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

use crate::config::{LoadMode, Settings};
use crate::error::{PipelineError, PipelineResult};
use crate::filter::{deceased_exclusion, ClaimFilter};
use crate::model::transform::DEFAULT_MIN_DATE;
use crate::model::{LoadStrategy, TableModel, ALIAS_CLM, CLAIM_TABLE};
use crate::partition::{Catalog, PartitionUnit};
use crate::progress::{is_historical, is_initial, unloaded_ts, LoadProgress, ProgressKey};
use crate::sql::{render, Cte, Expr, OrderBy, Predicate, Query, Relation, Select, SelectItem, Statement};
use crate::value::{Row, SqlValue};

pub use alignment::{align, AlignedRow, ChildRecord, CLAIMS_CTE};

/// Coalesce target for null cursor timestamps.
const CURSOR_FLOOR: &str = "TIMESTAMP '0001-01-01 00:00:00'";

/// Run-wide parameters shared by every unit.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub run_start: DateTime<Utc>,
    pub mode: LoadMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    Initial,
    Incremental,
}

/// Output columns the executor reads to compute the resume cursor of a row.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorSpec {
    /// Greatest non-null value wins; null counts as the floor.
    pub timestamp_columns: Vec<String>,
    pub id_column: Option<String>,
}

impl CursorSpec {
    /// `(greatest timestamp, batch id)` of a fetched row, read before any transform runs.
    pub fn cursor_of(&self, row: &Row) -> (DateTime<Utc>, i64) {
        let ts = self
            .timestamp_columns
            .iter()
            .filter_map(|c| row.get(c).and_then(|v| v.as_timestamp()))
            .max()
            .unwrap_or_else(unloaded_ts);
        let id = self
            .id_column
            .as_deref()
            .and_then(|c| row.get(c))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        (ts, id)
    }

    /// Whether a row lies past a stored cursor under the resume predicate.
    pub fn is_after(&self, cursor: (DateTime<Utc>, i64), last: (DateTime<Utc>, i64)) -> bool {
        match self.id_column {
            Some(_) => cursor > last,
            None => cursor.0 > last.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchPlan {
    pub key: ProgressKey,
    pub sql: String,
    pub params: Vec<SqlValue>,
    /// Output column order of every fetched row.
    pub columns: Vec<String>,
    pub strategy: LoadStrategy,
    /// Present for resumable models only.
    pub cursor: Option<CursorSpec>,
    /// Stored cursor the fetch resumes after.
    pub resume: Option<(DateTime<Utc>, i64)>,
    pub historical: bool,
    pub load_type: LoadType,
    /// Claim filter, kept for sources that evaluate rows in memory.
    pub filter: Option<ClaimFilter>,
    /// Lower bound on the claim load date inside the claims CTE.
    pub min_transaction_date: Option<NaiveDate>,
    /// The whole result must load in one batch.
    pub single_batch: bool,
}

pub struct Planner<'a> {
    settings: &'a Settings,
    catalog: &'a Catalog,
}

/// Every field alias must name exactly one relation of the join graph.
fn check_aliases(model: &TableModel) -> PipelineResult<()> {
    let mut targets = HashSet::new();
    for t in model.join_targets() {
        if !targets.insert(t) {
            return Err(PipelineError::planning(
                "duplicate_alias".to_string(),
                format!("{}: alias {} is joined more than once", model.table, t),
            ));
        }
    }
    for f in &model.fields {
        if let Some(a) = f.source_alias() {
            if !targets.contains(a) {
                return Err(PipelineError::planning(
                    "unknown_alias".to_string(),
                    format!("{}: field {} uses alias {} with no join", model.table, f.name, a),
                ));
            }
        }
    }
    Ok(())
}

fn source_expr(model: &TableModel, column: &str) -> PipelineResult<Expr> {
    model.source_expr_for(column).ok_or_else(|| {
        PipelineError::planning("unknown_column".to_string(), format!("{}: no source for {}", model.table, column))
    })
}

impl<'a> Planner<'a> {
    pub fn new(settings: &'a Settings, catalog: &'a Catalog) -> Planner<'a> {
        Planner { settings, catalog }
    }

    pub fn plan(
        &self,
        model: &TableModel,
        unit: &PartitionUnit,
        run: &RunContext,
        progress: Option<&LoadProgress>,
    ) -> PipelineResult<FetchPlan> {
        check_aliases(model)?;
        unit.partition.validate()?;

        let historical = is_historical(progress);
        let resumable = model.is_resumable();
        let initial = !resumable || is_initial(progress);
        let not_materialized = run.mode != LoadMode::Production;

        let filter = if model.family.is_claim() {
            Some(ClaimFilter::build(model.family, unit, run.run_start, self.settings, self.catalog)?)
        } else {
            None
        };

        let mut ctes = Vec::new();
        let mut filter_outer = filter.is_some();
        let mut min_transaction_date = None;
        if let (Some(scope), Some(f)) = (&model.claim_scope, &filter) {
            filter_outer = scope.filter_outer;
            if !scope.cte_columns.is_empty() {
                let mut claims = Select::from(Relation::table(CLAIM_TABLE, ALIAS_CLM));
                for c in &scope.cte_columns {
                    claims = claims.item(SelectItem::new(Expr::col(ALIAS_CLM, c)));
                }
                claims = claims.filter(f.predicate(ALIAS_CLM));
                if scope.min_transaction_date {
                    let floor = self.settings.min_transaction_date.unwrap_or(DEFAULT_MIN_DATE);
                    claims = claims.filter(Expr::col(ALIAS_CLM, "clm_idr_ld_dt").ge(Expr::param(SqlValue::Date(floor))));
                    min_transaction_date = Some(floor);
                }
                ctes.push(Cte { name: CLAIMS_CTE.into(), query: Query::Select(Box::new(claims)), not_materialized });
            }
        }
        if let Some(spec) = &model.alignment {
            ctes.extend(alignment::alignment_ctes(spec, not_materialized));
        }
        ctes.extend(model.ctes.iter().cloned());

        let mut body = Select::from(model.base.clone());
        for (expr, name) in model.projection() {
            body = body.item(SelectItem::aliased(expr, name));
        }
        for f in model.fields.iter().filter(|f| f.is_derived()) {
            body = body.item(SelectItem::aliased(source_expr(model, &f.name)?, &f.name));
        }
        if let Some(spec) = &model.alignment {
            body.joins.extend(alignment::alignment_joins(spec));
        }
        body.joins.extend(model.joins.iter().cloned());

        if filter_outer {
            if let Some(f) = &filter {
                body = body.filter(f.predicate(ALIAS_CLM));
            }
        }
        for p in &model.static_filters {
            body = body.filter(p.clone());
        }
        if let Some(key) = &model.deceased_key {
            body = body.filter(deceased_exclusion(key.clone(), self.settings.death_cutoff_years));
        }
        body.group_by = model.group_by.clone();
        body.having = model.having.clone();

        let mut cursor = None;
        let mut resume = None;
        if resumable {
            let ts_columns: Vec<String> = model
                .batch_timestamp_columns(historical)
                .into_iter()
                .chain(model.update_timestamp_columns())
                .map(String::from)
                .collect();
            if ts_columns.is_empty() {
                return Err(PipelineError::config(
                    "no_batch_timestamp".to_string(),
                    format!("{} is incremental but has no batch timestamp", model.table),
                ));
            }
            let greatest = Expr::Greatest(
                ts_columns
                    .iter()
                    .map(|c| Ok(Expr::Coalesce(vec![source_expr(model, c)?, Expr::raw(CURSOR_FLOOR)])))
                    .collect::<PipelineResult<Vec<_>>>()?,
            );
            let id_column = model.batch_id().map(String::from);
            let id_expr = id_column.as_deref().map(|c| source_expr(model, c)).transpose()?;

            if let (false, Some(p)) = (initial, progress) {
                let last_ts = Expr::param(SqlValue::Timestamp(p.last_ts));
                let pred = match &id_expr {
                    Some(id) => Predicate::or(vec![
                        greatest.clone().gt(last_ts.clone()),
                        Predicate::and(vec![
                            greatest.clone().eq(last_ts),
                            id.clone().gt(Expr::param(SqlValue::Int(p.last_id))),
                        ]),
                    ]),
                    None => greatest.clone().gt(last_ts),
                };
                body = body.filter(pred);
                resume = Some(p.cursor());
            }
            body.order_by.push(OrderBy::asc(greatest));
            if let Some(id) = id_expr {
                body.order_by.push(OrderBy::asc(id));
            }
            cursor = Some(CursorSpec { timestamp_columns: ts_columns, id_column });
        } else {
            for pk in model.primary_key() {
                body.order_by.push(OrderBy::asc(source_expr(model, pk)?));
            }
        }

        let rendered = render(&Statement { ctes, body })?;
        let key = ProgressKey::new(&model.table, &unit.partition.name);
        debug!(
            target: "idrload::planner",
            key = %key,
            historical,
            initial,
            params = rendered.params.len(),
            sql = %rendered.sql,
            "planned fetch"
        );
        Ok(FetchPlan {
            key,
            sql: rendered.sql,
            params: rendered.params,
            columns: model.fetched_columns().into_iter().map(String::from).collect(),
            strategy: model.strategy,
            cursor,
            resume,
            historical,
            load_type: if initial { LoadType::Initial } else { LoadType::Incremental },
            filter,
            min_transaction_date,
            single_batch: model.strategy == LoadStrategy::Replace,
        })
    }
}
