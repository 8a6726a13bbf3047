//! Typed query builder used by the planner.
//!
//! Statements are assembled as an AST and rendered once into text plus positional `$n`
//! parameters. Identifiers are checked against a conservative pattern at render time so a
//! model can never smuggle arbitrary text into a statement through an alias or column name;
//! `Raw` fragments are reserved for fixed, model-authored expressions.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PipelineError, PipelineResult};
use crate::value::SqlValue;

static IDENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*){0,2}$").expect("identifier pattern")
});

pub fn is_valid_ident(s: &str) -> bool {
    IDENT_RE.is_match(s)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp { Eq, Ne, Lt, Le, Gt, Ge }

impl CompOp {
    fn as_sql(&self) -> &'static str {
        match self {
            CompOp::Eq => "=",
            CompOp::Ne => "!=",
            CompOp::Lt => "<",
            CompOp::Le => "<=",
            CompOp::Gt => ">",
            CompOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunc { RowNumber, Rank }

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub asc: bool,
}

impl OrderBy {
    pub fn asc(expr: Expr) -> Self { OrderBy { expr, asc: true } }
    pub fn desc(expr: Expr) -> Self { OrderBy { expr, asc: false } }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column { alias: Option<String>, name: String },
    /// `alias.*`
    Star(String),
    Param(SqlValue),
    Int(i64),
    Str(String),
    Coalesce(Vec<Expr>),
    Greatest(Vec<Expr>),
    Window { func: WindowFunc, partition_by: Vec<Expr>, order_by: Vec<OrderBy> },
    /// Fixed SQL authored alongside a model definition.
    Raw(String),
}

impl Expr {
    pub fn col(alias: &str, name: &str) -> Expr {
        Expr::Column { alias: Some(alias.to_string()), name: name.to_string() }
    }
    pub fn bare(name: &str) -> Expr {
        Expr::Column { alias: None, name: name.to_string() }
    }
    pub fn raw<S: Into<String>>(s: S) -> Expr { Expr::Raw(s.into()) }
    pub fn param(v: SqlValue) -> Expr { Expr::Param(v) }

    pub fn cmp(self, op: CompOp, right: Expr) -> Predicate {
        Predicate::Comp { left: self, op, right }
    }
    pub fn eq(self, right: Expr) -> Predicate { self.cmp(CompOp::Eq, right) }
    pub fn ne(self, right: Expr) -> Predicate { self.cmp(CompOp::Ne, right) }
    pub fn gt(self, right: Expr) -> Predicate { self.cmp(CompOp::Gt, right) }
    pub fn ge(self, right: Expr) -> Predicate { self.cmp(CompOp::Ge, right) }
    pub fn lt(self, right: Expr) -> Predicate { self.cmp(CompOp::Lt, right) }
    pub fn le(self, right: Expr) -> Predicate { self.cmp(CompOp::Le, right) }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Comp { left: Expr, op: CompOp, right: Expr },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    InList { expr: Expr, list: Vec<Expr>, negated: bool },
    Between { expr: Expr, low: Expr, high: Expr, negated: bool },
    IsNull { expr: Expr, negated: bool },
    Exists { subquery: Box<Select>, negated: bool },
    Raw(String),
}

impl Predicate {
    /// Flattens nested conjunctions; an empty conjunction renders as TRUE.
    pub fn and(parts: Vec<Predicate>) -> Predicate {
        let mut out = Vec::with_capacity(parts.len());
        for p in parts {
            match p {
                Predicate::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        if out.len() == 1 {
            return out.remove(0);
        }
        Predicate::And(out)
    }

    pub fn or(parts: Vec<Predicate>) -> Predicate {
        if parts.len() == 1 {
            let mut parts = parts;
            return parts.remove(0);
        }
        Predicate::Or(parts)
    }

    pub fn raw<S: Into<String>>(s: S) -> Predicate { Predicate::Raw(s.into()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType { Inner, Left }

#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    /// A warehouse table or a CTE name, with an alias.
    Table { name: String, alias: Option<String> },
    Subquery { query: Box<Select>, alias: String },
}

impl Relation {
    pub fn table(name: &str, alias: &str) -> Relation {
        Relation::Table { name: name.to_string(), alias: Some(alias.to_string()) }
    }

    pub fn effective_name(&self) -> &str {
        match self {
            Relation::Table { name, alias } => alias.as_deref().unwrap_or(name.as_str()),
            Relation::Subquery { alias, .. } => alias.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub join_type: JoinType,
    pub right: Relation,
    pub on: Predicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn new(expr: Expr) -> Self { SelectItem { expr, alias: None } }
    pub fn aliased(expr: Expr, alias: &str) -> Self { SelectItem { expr, alias: Some(alias.to_string()) } }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub items: Vec<SelectItem>,
    pub from: Relation,
    pub joins: Vec<JoinClause>,
    pub where_clause: Option<Predicate>,
    pub group_by: Vec<Expr>,
    pub having: Option<Predicate>,
    pub order_by: Vec<OrderBy>,
}

impl Select {
    pub fn from(from: Relation) -> Select {
        Select {
            items: Vec::new(),
            from,
            joins: Vec::new(),
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
        }
    }

    pub fn item(mut self, item: SelectItem) -> Select {
        self.items.push(item);
        self
    }

    pub fn join(mut self, join_type: JoinType, right: Relation, on: Predicate) -> Select {
        self.joins.push(JoinClause { join_type, right, on });
        self
    }

    pub fn filter(mut self, p: Predicate) -> Select {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => Predicate::and(vec![existing, p]),
            None => p,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(Box<Select>),
    /// `UNION` (distinct) of the member selects.
    Union(Vec<Select>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub query: Query,
    pub not_materialized: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub ctes: Vec<Cte>,
    pub body: Select,
}

/// Rendered statement text and its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSql {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

struct Renderer {
    out: String,
    params: Vec<SqlValue>,
}

pub fn render(stmt: &Statement) -> PipelineResult<RenderedSql> {
    let mut r = Renderer { out: String::with_capacity(4096), params: Vec::new() };
    if !stmt.ctes.is_empty() {
        r.out.push_str("WITH ");
        for (i, cte) in stmt.ctes.iter().enumerate() {
            if i > 0 {
                r.out.push_str(",\n");
            }
            r.ident(&cte.name)?;
            r.out.push_str(" AS ");
            if cte.not_materialized {
                r.out.push_str("NOT MATERIALIZED ");
            }
            r.out.push('(');
            r.query(&cte.query)?;
            r.out.push(')');
        }
        r.out.push('\n');
    }
    r.select(&stmt.body)?;
    Ok(RenderedSql { sql: r.out, params: r.params })
}

/// Render a lone predicate, numbering parameters from `$1`.
pub fn render_predicate(p: &Predicate) -> PipelineResult<RenderedSql> {
    let mut r = Renderer { out: String::new(), params: Vec::new() };
    r.predicate(p)?;
    Ok(RenderedSql { sql: r.out, params: r.params })
}

impl Renderer {
    fn ident(&mut self, s: &str) -> PipelineResult<()> {
        if !is_valid_ident(s) {
            return Err(PipelineError::planning("bad_identifier".to_string(), format!("invalid identifier '{}'", s)));
        }
        self.out.push_str(s);
        Ok(())
    }

    fn query(&mut self, q: &Query) -> PipelineResult<()> {
        match q {
            Query::Select(s) => self.select(s),
            Query::Union(members) => {
                for (i, s) in members.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str("\nUNION\n");
                    }
                    self.select(s)?;
                }
                Ok(())
            }
        }
    }

    fn select(&mut self, s: &Select) -> PipelineResult<()> {
        self.out.push_str("SELECT ");
        if s.items.is_empty() {
            self.out.push('*');
        }
        for (i, item) in s.items.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(&item.expr)?;
            if let Some(a) = &item.alias {
                self.out.push_str(" AS ");
                self.ident(a)?;
            }
        }
        self.out.push_str("\nFROM ");
        self.relation(&s.from)?;
        for j in &s.joins {
            self.out.push_str(match j.join_type {
                JoinType::Inner => "\nJOIN ",
                JoinType::Left => "\nLEFT JOIN ",
            });
            self.relation(&j.right)?;
            self.out.push_str(" ON ");
            self.predicate(&j.on)?;
        }
        if let Some(w) = &s.where_clause {
            self.out.push_str("\nWHERE ");
            self.predicate(w)?;
        }
        if !s.group_by.is_empty() {
            self.out.push_str("\nGROUP BY ");
            self.expr_list(&s.group_by)?;
        }
        if let Some(h) = &s.having {
            self.out.push_str("\nHAVING ");
            self.predicate(h)?;
        }
        if !s.order_by.is_empty() {
            self.out.push_str("\nORDER BY ");
            self.order_list(&s.order_by)?;
        }
        Ok(())
    }

    fn relation(&mut self, rel: &Relation) -> PipelineResult<()> {
        match rel {
            Relation::Table { name, alias } => {
                self.ident(name)?;
                if let Some(a) = alias {
                    self.out.push(' ');
                    self.ident(a)?;
                }
            }
            Relation::Subquery { query, alias } => {
                self.out.push('(');
                self.select(query)?;
                self.out.push_str(") ");
                self.ident(alias)?;
            }
        }
        Ok(())
    }

    fn expr_list(&mut self, list: &[Expr]) -> PipelineResult<()> {
        for (i, e) in list.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(e)?;
        }
        Ok(())
    }

    fn order_list(&mut self, list: &[OrderBy]) -> PipelineResult<()> {
        for (i, o) in list.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(&o.expr)?;
            if !o.asc {
                self.out.push_str(" DESC");
            }
        }
        Ok(())
    }

    fn expr(&mut self, e: &Expr) -> PipelineResult<()> {
        match e {
            Expr::Column { alias, name } => {
                if let Some(a) = alias {
                    self.ident(a)?;
                    self.out.push('.');
                }
                self.ident(name)?;
            }
            Expr::Star(alias) => {
                self.ident(alias)?;
                self.out.push_str(".*");
            }
            Expr::Param(v) => {
                self.params.push(v.clone());
                self.out.push('$');
                self.out.push_str(&self.params.len().to_string());
            }
            Expr::Int(i) => self.out.push_str(&i.to_string()),
            Expr::Str(s) => {
                self.out.push('\'');
                self.out.push_str(&s.replace('\'', "''"));
                self.out.push('\'');
            }
            Expr::Coalesce(args) => {
                self.out.push_str("COALESCE(");
                self.expr_list(args)?;
                self.out.push(')');
            }
            Expr::Greatest(args) => {
                if args.len() == 1 {
                    return self.expr(&args[0]);
                }
                self.out.push_str("GREATEST(");
                self.expr_list(args)?;
                self.out.push(')');
            }
            Expr::Window { func, partition_by, order_by } => {
                self.out.push_str(match func {
                    WindowFunc::RowNumber => "ROW_NUMBER() OVER (",
                    WindowFunc::Rank => "RANK() OVER (",
                });
                if !partition_by.is_empty() {
                    self.out.push_str("PARTITION BY ");
                    self.expr_list(partition_by)?;
                }
                if !order_by.is_empty() {
                    if !partition_by.is_empty() {
                        self.out.push(' ');
                    }
                    self.out.push_str("ORDER BY ");
                    self.order_list(order_by)?;
                }
                self.out.push(')');
            }
            Expr::Raw(s) => self.out.push_str(s),
        }
        Ok(())
    }

    fn predicate(&mut self, p: &Predicate) -> PipelineResult<()> {
        match p {
            Predicate::Comp { left, op, right } => {
                self.expr(left)?;
                self.out.push(' ');
                self.out.push_str(op.as_sql());
                self.out.push(' ');
                self.expr(right)?;
            }
            Predicate::And(parts) => self.junction(parts, " AND ", "TRUE")?,
            Predicate::Or(parts) => self.junction(parts, " OR ", "FALSE")?,
            Predicate::InList { expr, list, negated } => {
                if list.is_empty() {
                    // x IN () is not valid SQL
                    self.out.push_str(if *negated { "TRUE" } else { "FALSE" });
                    return Ok(());
                }
                self.expr(expr)?;
                self.out.push_str(if *negated { " NOT IN (" } else { " IN (" });
                self.expr_list(list)?;
                self.out.push(')');
            }
            Predicate::Between { expr, low, high, negated } => {
                self.expr(expr)?;
                self.out.push_str(if *negated { " NOT BETWEEN " } else { " BETWEEN " });
                self.expr(low)?;
                self.out.push_str(" AND ");
                self.expr(high)?;
            }
            Predicate::IsNull { expr, negated } => {
                self.expr(expr)?;
                self.out.push_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Predicate::Exists { subquery, negated } => {
                self.out.push_str(if *negated { "NOT EXISTS (" } else { "EXISTS (" });
                self.select(subquery)?;
                self.out.push(')');
            }
            Predicate::Raw(s) => self.out.push_str(s),
        }
        Ok(())
    }

    fn junction(&mut self, parts: &[Predicate], sep: &str, empty: &str) -> PipelineResult<()> {
        if parts.is_empty() {
            self.out.push_str(empty);
            return Ok(());
        }
        self.out.push('(');
        for (i, p) in parts.iter().enumerate() {
            if i > 0 {
                self.out.push_str(sep);
            }
            self.predicate(p)?;
        }
        self.out.push(')');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_select_with_params_in_order() {
        let body = Select::from(Relation::table("warehouse.v2_mdcr_clm", "clm"))
            .item(SelectItem::aliased(Expr::col("clm", "clm_uniq_id"), "clm_uniq_id"))
            .filter(Expr::col("clm", "clm_from_dt").ge(Expr::param(SqlValue::Int(1))))
            .filter(Expr::col("clm", "bene_sk").ne(Expr::Int(0)))
            .filter(Expr::col("clm", "clm_thru_dt").le(Expr::param(SqlValue::Int(2))));
        let out = render(&Statement { ctes: vec![], body }).unwrap();
        assert_eq!(
            out.sql,
            "SELECT clm.clm_uniq_id AS clm_uniq_id\nFROM warehouse.v2_mdcr_clm clm\nWHERE (clm.clm_from_dt >= $1 AND clm.bene_sk != 0 AND clm.clm_thru_dt <= $2)"
        );
        assert_eq!(out.params, vec![SqlValue::Int(1), SqlValue::Int(2)]);
    }

    #[test]
    fn renders_ctes_unions_and_windows() {
        let lines = Select::from(Relation::table("src.line", "line"))
            .item(SelectItem::new(Expr::Star("line".into())))
            .item(SelectItem::aliased(
                Expr::Window {
                    func: WindowFunc::RowNumber,
                    partition_by: vec![Expr::col("line", "clm_uniq_id")],
                    order_by: vec![OrderBy::asc(Expr::col("line", "clm_line_num"))],
                },
                "bfd_row_id",
            ));
        let groups = Query::Union(vec![
            Select::from(Relation::Table { name: "claim_lines".into(), alias: None })
                .item(SelectItem::new(Expr::bare("clm_uniq_id"))),
            Select::from(Relation::Table { name: "claim_vals".into(), alias: None })
                .item(SelectItem::new(Expr::bare("clm_uniq_id"))),
        ]);
        let stmt = Statement {
            ctes: vec![
                Cte { name: "claim_lines".into(), query: Query::Select(Box::new(lines)), not_materialized: true },
                Cte { name: "claim_groups".into(), query: groups, not_materialized: false },
            ],
            body: Select::from(Relation::table("claim_groups", "g")),
        };
        let sql = render(&stmt).unwrap().sql;
        assert!(sql.starts_with("WITH claim_lines AS NOT MATERIALIZED (SELECT line.*, ROW_NUMBER() OVER (PARTITION BY line.clm_uniq_id ORDER BY line.clm_line_num) AS bfd_row_id"));
        assert!(sql.contains("claim_groups AS (SELECT clm_uniq_id\nFROM claim_lines\nUNION\nSELECT clm_uniq_id\nFROM claim_vals)"));
        assert!(sql.ends_with("SELECT *\nFROM claim_groups g"));
    }

    #[test]
    fn rejects_bad_identifiers() {
        let body = Select::from(Relation::table("t; DROP TABLE x", "a"));
        let err = render(&Statement { ctes: vec![], body }).unwrap_err();
        assert_eq!(err.code_str(), "bad_identifier");
        assert!(is_valid_ident("cms_vdm_view_mdcr_prd.v2_mdcr_clm"));
        assert!(!is_valid_ident("1abc"));
    }

    #[test]
    fn empty_in_list_is_false() {
        let p = Predicate::InList { expr: Expr::bare("x"), list: vec![], negated: false };
        assert_eq!(render_predicate(&p).unwrap().sql, "FALSE");
        let p = Predicate::and(vec![Predicate::and(vec![Predicate::raw("a"), Predicate::raw("b")]), Predicate::raw("c")]);
        assert_eq!(render_predicate(&p).unwrap().sql, "(a AND b AND c)");
    }
}
