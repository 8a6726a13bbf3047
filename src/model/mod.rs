//! Declarative table models.
//!
//! A `TableModel` says which warehouse relations feed a target table, how each output field is
//! sourced and which fields drive ordering, resume and upsert. Models are built once by
//! [`registry::Registry::load`], validated there, and shared read-only afterwards.

pub mod transform;
pub mod registry;
mod beneficiary;
mod claim;
mod reference;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sql::{Cte, Expr, JoinClause, JoinType, Predicate, Relation};
use crate::value::ValueKind;

pub use registry::Registry;
pub use transform::Transform;

/// Warehouse view schema every source relation lives in.
pub const SOURCE_SCHEMA: &str = "cms_vdm_view_mdcr_prd";

/// Claim header relation and alias; the claim filter is written against it.
pub const CLAIM_TABLE: &str = "cms_vdm_view_mdcr_prd.v2_mdcr_clm";
pub const ALIAS_CLM: &str = "clm";

/// Qualify a warehouse view name with the source schema.
pub fn source_table(name: &str) -> String {
    format!("{}.{}", SOURCE_SCHEMA, name)
}

/// Meta columns maintained by the loader rather than fetched.
pub const CREATED_TS_COLUMN: &str = "bfd_created_ts";
pub const UPDATED_TS_COLUMN: &str = "bfd_updated_ts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableFamily {
    Beneficiary,
    Reference,
    Provider,
    Institutional,
    Professional,
    Prescription,
}

impl TableFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableFamily::Beneficiary => "beneficiary",
            TableFamily::Reference => "reference",
            TableFamily::Provider => "provider",
            TableFamily::Institutional => "institutional",
            TableFamily::Professional => "professional",
            TableFamily::Prescription => "prescription",
        }
    }

    pub fn is_claim(&self) -> bool {
        matches!(self, TableFamily::Institutional | TableFamily::Professional | TableFamily::Prescription)
    }
}

impl fmt::Display for TableFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadStrategy {
    /// Resume from the stored cursor and merge.
    Incremental,
    /// Merge the full result every run.
    FullRefresh,
    /// Delete the target contents and insert the full result in one transaction.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampRole {
    None,
    Batch,
    HistoricalBatch,
    Update,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldSource {
    /// `alias.column`, or a bare column when the model reads a single relation.
    Column { alias: Option<String>, column: String },
    /// Fixed source-side expression; the column mapping is never consulted.
    Expr(String),
    /// Not projected from the join graph; produced by a model derivation.
    Derived,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: ValueKind,
    pub source: FieldSource,
    pub role: TimestampRole,
    pub primary_key: bool,
    pub batch_id: bool,
    pub last_updated_key: bool,
    pub insert_excluded: bool,
    pub transform: Option<Transform>,
}

impl FieldSpec {
    pub fn new(name: &str, kind: ValueKind) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            kind,
            source: FieldSource::Column { alias: None, column: name.to_string() },
            role: TimestampRole::None,
            primary_key: false,
            batch_id: false,
            last_updated_key: false,
            insert_excluded: false,
            transform: None,
        }
    }

    pub fn int(name: &str) -> FieldSpec { FieldSpec::new(name, ValueKind::Int) }
    pub fn float(name: &str) -> FieldSpec { FieldSpec::new(name, ValueKind::Float) }
    pub fn text(name: &str) -> FieldSpec { FieldSpec::new(name, ValueKind::Text) }
    pub fn date(name: &str) -> FieldSpec { FieldSpec::new(name, ValueKind::Date) }
    pub fn timestamp(name: &str) -> FieldSpec { FieldSpec::new(name, ValueKind::Timestamp) }

    pub fn alias(mut self, alias: &str) -> FieldSpec {
        if let FieldSource::Column { alias: a, .. } = &mut self.source {
            *a = Some(alias.to_string());
        }
        self
    }

    /// Read from a differently named source column.
    pub fn column(mut self, column: &str) -> FieldSpec {
        if let FieldSource::Column { column: c, .. } = &mut self.source {
            *c = column.to_string();
        }
        self
    }

    pub fn expr(mut self, expr: &str) -> FieldSpec {
        self.source = FieldSource::Expr(expr.trim().to_string());
        self
    }

    pub fn derived(mut self) -> FieldSpec {
        self.source = FieldSource::Derived;
        self
    }

    pub fn pk(mut self) -> FieldSpec { self.primary_key = true; self }
    pub fn batch_id(mut self) -> FieldSpec { self.batch_id = true; self }
    pub fn last_updated_key(mut self) -> FieldSpec { self.last_updated_key = true; self }
    pub fn insert_excluded(mut self) -> FieldSpec { self.insert_excluded = true; self }
    pub fn batch_ts(mut self) -> FieldSpec { self.role = TimestampRole::Batch; self }
    pub fn historical_ts(mut self) -> FieldSpec { self.role = TimestampRole::HistoricalBatch; self }
    pub fn update_ts(mut self) -> FieldSpec { self.role = TimestampRole::Update; self }

    pub fn transform(mut self, t: Transform) -> FieldSpec {
        self.transform = Some(t);
        self
    }

    pub fn is_derived(&self) -> bool { matches!(self.source, FieldSource::Derived) }

    pub fn source_alias(&self) -> Option<&str> {
        match &self.source {
            FieldSource::Column { alias, .. } => alias.as_deref(),
            _ => None,
        }
    }

    /// Source-side expression for the projection; `None` for derived fields.
    pub fn source_expr(&self) -> Option<Expr> {
        match &self.source {
            FieldSource::Column { alias: Some(a), column } => Some(Expr::col(a, column)),
            FieldSource::Column { alias: None, column } => Some(Expr::bare(column)),
            FieldSource::Expr(e) => Some(Expr::Raw(e.clone())),
            FieldSource::Derived => None,
        }
    }
}

/// Target table stamped for every key of an incremental batch.
#[derive(Debug, Clone, PartialEq)]
pub struct LastUpdated {
    pub table: String,
    pub columns: Vec<String>,
}

/// The filtered `claims` relation shared by claim models.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimScope {
    /// Columns of the `claims` CTE; empty when the model only filters its outer query.
    pub cte_columns: Vec<String>,
    /// Also require `clm_idr_ld_dt >= min transaction date` inside the CTE.
    pub min_transaction_date: bool,
    /// Apply the claim filter to the outer query on the `clm` alias.
    pub filter_outer: bool,
}

/// One child relation of a claim-item model.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildKind {
    /// CTE name, e.g. `claim_lines`.
    pub cte: String,
    pub alias: String,
    pub table: String,
    /// Columns equal between the child and the `claims` relation.
    pub join_keys: Vec<String>,
    /// Stable per-kind slot ordering.
    pub slot_order: Vec<String>,
    /// The child relation already carries the parent key column.
    pub carries_parent_key: bool,
    /// Extra condition on the parent side of the join.
    pub parent_filter: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentSpec {
    pub parent_key: String,
    pub slot_column: String,
    pub group_cte: String,
    pub group_alias: String,
    pub kinds: Vec<ChildKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableModel {
    pub table: String,
    pub family: TableFamily,
    pub strategy: LoadStrategy,
    pub fields: Vec<FieldSpec>,
    /// Static CTEs emitted after the claim scope and alignment CTEs.
    pub ctes: Vec<Cte>,
    pub base: Relation,
    pub joins: Vec<JoinClause>,
    pub static_filters: Vec<Predicate>,
    /// Column compared against deceased beneficiaries, e.g. `tp.bene_sk`.
    pub deceased_key: Option<Expr>,
    pub computed_keys: Vec<String>,
    pub last_updated: Option<LastUpdated>,
    pub claim_scope: Option<ClaimScope>,
    pub alignment: Option<AlignmentSpec>,
    /// Expressions producing derived fields, keyed by field name.
    pub derivations: Vec<(String, Expr)>,
    pub group_by: Vec<Expr>,
    pub having: Option<Predicate>,
}

impl TableModel {
    pub fn new(table: &str, family: TableFamily, strategy: LoadStrategy, base: Relation) -> TableModel {
        TableModel {
            table: table.to_string(),
            family,
            strategy,
            fields: Vec::new(),
            ctes: Vec::new(),
            base,
            joins: Vec::new(),
            static_filters: Vec::new(),
            deceased_key: None,
            computed_keys: Vec::new(),
            last_updated: None,
            claim_scope: None,
            alignment: None,
            derivations: Vec::new(),
            group_by: Vec::new(),
            having: None,
        }
    }

    pub fn fields(mut self, fields: Vec<FieldSpec>) -> TableModel {
        self.fields.extend(fields);
        self
    }

    pub fn cte(mut self, cte: Cte) -> TableModel {
        self.ctes.push(cte);
        self
    }

    pub fn join(mut self, join_type: JoinType, right: Relation, on: Predicate) -> TableModel {
        self.joins.push(JoinClause { join_type, right, on });
        self
    }

    pub fn static_filter(mut self, p: Predicate) -> TableModel {
        self.static_filters.push(p);
        self
    }

    pub fn deceased_key(mut self, key: Expr) -> TableModel {
        self.deceased_key = Some(key);
        self
    }

    pub fn computed_key(mut self, name: &str) -> TableModel {
        self.computed_keys.push(name.to_string());
        self
    }

    pub fn last_updated(mut self, table: &str, columns: &[&str]) -> TableModel {
        self.last_updated = Some(LastUpdated {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn claim_scope(mut self, scope: ClaimScope) -> TableModel {
        self.claim_scope = Some(scope);
        self
    }

    pub fn alignment(mut self, spec: AlignmentSpec) -> TableModel {
        self.alignment = Some(spec);
        self
    }

    pub fn derive(mut self, field: &str, expr: Expr) -> TableModel {
        self.derivations.push((field.to_string(), expr));
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Output names of every projected field (derived fields excluded).
    pub fn columns(&self) -> Vec<&str> {
        self.fields.iter().filter(|f| !f.is_derived()).map(|f| f.name.as_str()).collect()
    }

    /// Output names in fetch order: projected fields, then derived fields.
    pub fn fetched_columns(&self) -> Vec<&str> {
        let mut out = self.columns();
        out.extend(self.fields.iter().filter(|f| f.is_derived()).map(|f| f.name.as_str()));
        out
    }

    /// `{sourceExpr} AS {name}` for each projected field.
    pub fn projection(&self) -> Vec<(Expr, &str)> {
        self.fields
            .iter()
            .filter_map(|f| f.source_expr().map(|e| (e, f.name.as_str())))
            .collect()
    }

    pub fn primary_key(&self) -> Vec<&str> {
        self.fields.iter().filter(|f| f.primary_key).map(|f| f.name.as_str()).collect()
    }

    fn with_role(&self, role: TimestampRole) -> Vec<&str> {
        self.fields.iter().filter(|f| f.role == role).map(|f| f.name.as_str()).collect()
    }

    /// The historical set when requested and present, else the normal set.
    pub fn batch_timestamp_columns(&self, historical: bool) -> Vec<&str> {
        if historical {
            let hist = self.with_role(TimestampRole::HistoricalBatch);
            if !hist.is_empty() {
                return hist;
            }
        }
        self.with_role(TimestampRole::Batch)
    }

    pub fn update_timestamp_columns(&self) -> Vec<&str> {
        self.with_role(TimestampRole::Update)
    }

    /// Every field the loader writes, derived ones included.
    pub fn insertable_columns(&self) -> Vec<&str> {
        self.fields.iter().filter(|f| !f.insert_excluded).map(|f| f.name.as_str()).collect()
    }

    pub fn batch_id(&self) -> Option<&str> {
        self.fields.iter().find(|f| f.batch_id).map(|f| f.name.as_str())
    }

    pub fn last_updated_key(&self) -> Option<&str> {
        self.fields.iter().find(|f| f.last_updated_key).map(|f| f.name.as_str())
    }

    /// Models without update timestamps never rewrite a loaded row.
    pub fn is_immutable(&self) -> bool {
        self.update_timestamp_columns().is_empty()
    }

    pub fn meta_columns(&self) -> Vec<&'static str> {
        if self.is_immutable() {
            vec![CREATED_TS_COLUMN]
        } else {
            vec![CREATED_TS_COLUMN, UPDATED_TS_COLUMN]
        }
    }

    pub fn is_resumable(&self) -> bool {
        self.strategy == LoadStrategy::Incremental
    }

    /// Source expression for an output column, used for ordering and resume predicates.
    pub fn source_expr_for(&self, name: &str) -> Option<Expr> {
        let field = self.field(name)?;
        match field.source_expr() {
            Some(e) => Some(e),
            None => self.derivations.iter().find(|(n, _)| n == name).map(|(_, e)| e.clone()),
        }
    }

    /// Every relation alias a field may reference.
    pub fn join_targets(&self) -> Vec<&str> {
        let mut out = vec![self.base.effective_name()];
        if let Some(a) = &self.alignment {
            out.push(a.group_alias.as_str());
            out.extend(a.kinds.iter().map(|k| k.alias.as_str()));
        }
        out.extend(self.joins.iter().map(|j| j.right.effective_name()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TableModel {
        TableModel::new(
            "idr.sample",
            TableFamily::Beneficiary,
            LoadStrategy::Incremental,
            Relation::table("cms_vdm_view_mdcr_prd.v2_mdcr_bene_tp", "tp"),
        )
        .fields(vec![
            FieldSpec::int("bene_sk").alias("tp").pk().batch_id().last_updated_key(),
            FieldSpec::text("bene_tp_type_cd").pk(),
            FieldSpec::timestamp("idr_insrt_ts").batch_ts().insert_excluded(),
            FieldSpec::date("idr_ld_dt").historical_ts(),
            FieldSpec::timestamp("idr_updt_ts").update_ts(),
            FieldSpec::int("row_rank").derived(),
            FieldSpec::text("mbi").expr("UPPER(tp.bene_mbi_id)"),
        ])
        .derive("row_rank", Expr::raw("RANK() OVER (ORDER BY tp.bene_sk)"))
    }

    #[test]
    fn accessors_follow_field_flags() {
        let m = sample();
        assert_eq!(
            m.columns(),
            vec!["bene_sk", "bene_tp_type_cd", "idr_insrt_ts", "idr_ld_dt", "idr_updt_ts", "mbi"]
        );
        assert_eq!(m.primary_key(), vec!["bene_sk", "bene_tp_type_cd"]);
        assert_eq!(m.batch_timestamp_columns(false), vec!["idr_insrt_ts"]);
        assert_eq!(m.batch_timestamp_columns(true), vec!["idr_ld_dt"]);
        assert_eq!(m.update_timestamp_columns(), vec!["idr_updt_ts"]);
        assert!(m.insertable_columns().contains(&"row_rank"));
        assert!(!m.insertable_columns().contains(&"idr_insrt_ts"));
        assert_eq!(m.batch_id(), Some("bene_sk"));
        assert_eq!(m.last_updated_key(), Some("bene_sk"));
        assert_eq!(m.meta_columns(), vec![CREATED_TS_COLUMN, UPDATED_TS_COLUMN]);
    }

    #[test]
    fn projection_uses_expression_or_alias() {
        let m = sample();
        let proj = m.projection();
        assert_eq!(proj[0], (Expr::col("tp", "bene_sk"), "bene_sk"));
        assert_eq!(proj[1], (Expr::bare("bene_tp_type_cd"), "bene_tp_type_cd"));
        assert_eq!(proj.last().unwrap(), &(Expr::raw("UPPER(tp.bene_mbi_id)"), "mbi"));
        assert!(proj.iter().all(|(_, n)| *n != "row_rank"));
        assert_eq!(m.source_expr_for("row_rank"), Some(Expr::raw("RANK() OVER (ORDER BY tp.bene_sk)")));
    }

    #[test]
    fn historical_falls_back_to_normal_set() {
        let m = TableModel::new("idr.x", TableFamily::Reference, LoadStrategy::Incremental, Relation::table("a.b", "b"))
            .fields(vec![FieldSpec::int("id").pk(), FieldSpec::timestamp("ts").batch_ts()]);
        assert_eq!(m.batch_timestamp_columns(true), vec!["ts"]);
        assert!(m.is_immutable());
        assert_eq!(m.meta_columns(), vec![CREATED_TS_COLUMN]);
    }
}
