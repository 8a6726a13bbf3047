//! Row alignment for claim-item models.
//!
//! Each child kind numbers its rows per parent with a stable slot ordering. The union of
//! `(parent, slot)` pairs over all kinds is the output row set and every kind is left joined back
//! by slot, so a parent with kind counts `a, b, c, d` yields `max(a, b, c, d)` rows and never
//! their product. [`alignment_ctes`] pushes this into the warehouse query; [`align`] does the same
//! for records already in memory.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::model::{AlignmentSpec, ChildKind, ALIAS_CLM};
use crate::sql::{Cte, Expr, JoinClause, JoinType, OrderBy, Predicate, Query, Relation, Select, SelectItem, WindowFunc};
use crate::value::SqlValue;

/// The filtered claim relation every kind joins against.
pub const CLAIMS_CTE: &str = "claims";

fn kind_cte(spec: &AlignmentSpec, kind: &ChildKind, not_materialized: bool) -> Cte {
    let mut select = Select::from(Relation::table(&kind.table, &kind.alias));
    if !kind.carries_parent_key {
        select = select.item(SelectItem::new(Expr::col(ALIAS_CLM, &spec.parent_key)));
    }
    select = select
        .item(SelectItem::new(Expr::Star(kind.alias.clone())))
        .item(SelectItem::aliased(
            Expr::Window {
                func: WindowFunc::RowNumber,
                partition_by: vec![Expr::col(ALIAS_CLM, &spec.parent_key)],
                order_by: kind.slot_order.iter().map(|c| OrderBy::asc(Expr::col(&kind.alias, c))).collect(),
            },
            &spec.slot_column,
        ))
        .join(
            JoinType::Inner,
            Relation::table(CLAIMS_CTE, ALIAS_CLM),
            Predicate::and(
                kind.join_keys
                    .iter()
                    .map(|k| Expr::col(&kind.alias, k).eq(Expr::col(ALIAS_CLM, k)))
                    .collect(),
            ),
        );
    if let Some(f) = &kind.parent_filter {
        select = select.filter(f.clone());
    }
    Cte { name: kind.cte.clone(), query: Query::Select(Box::new(select)), not_materialized }
}

/// One CTE per kind followed by the `(parent, slot)` union.
pub fn alignment_ctes(spec: &AlignmentSpec, not_materialized: bool) -> Vec<Cte> {
    let mut ctes: Vec<Cte> = spec.kinds.iter().map(|k| kind_cte(spec, k, not_materialized)).collect();
    let members = spec
        .kinds
        .iter()
        .map(|k| {
            Select::from(Relation::Table { name: k.cte.clone(), alias: None })
                .item(SelectItem::new(Expr::bare(&spec.parent_key)))
                .item(SelectItem::new(Expr::bare(&spec.slot_column)))
        })
        .collect();
    ctes.push(Cte { name: spec.group_cte.clone(), query: Query::Union(members), not_materialized: false });
    ctes
}

/// Join the slot union onto the claim relation, then every kind by `(parent, slot)`.
pub fn alignment_joins(spec: &AlignmentSpec) -> Vec<JoinClause> {
    let group = spec.group_alias.as_str();
    let mut joins = vec![JoinClause {
        join_type: JoinType::Inner,
        right: Relation::table(&spec.group_cte, group),
        on: Expr::col(group, &spec.parent_key).eq(Expr::col(ALIAS_CLM, &spec.parent_key)),
    }];
    for kind in &spec.kinds {
        joins.push(JoinClause {
            join_type: JoinType::Left,
            right: Relation::table(&kind.cte, &kind.alias),
            on: Predicate::and(vec![
                Expr::col(&kind.alias, &spec.parent_key).eq(Expr::col(ALIAS_CLM, &spec.parent_key)),
                Expr::col(&kind.alias, &spec.slot_column).eq(Expr::col(group, &spec.slot_column)),
            ]),
        });
    }
    joins
}

/// A child record keyed by bare column name.
pub type ChildRecord = HashMap<String, SqlValue>;

/// One aligned output slot. `members` maps a kind alias to its record at this slot; absent
/// kinds are missing from the map.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedRow {
    pub parent_key: i64,
    pub slot: i64,
    pub members: HashMap<String, ChildRecord>,
}

fn slot_cmp(order: &[String], a: &ChildRecord, b: &ChildRecord) -> Ordering {
    for col in order {
        let (x, y) = (a.get(col).unwrap_or(&SqlValue::Null), b.get(col).unwrap_or(&SqlValue::Null));
        let ord = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            // nulls sort last, as ROW_NUMBER's ascending order does
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => x.compare(y).unwrap_or(Ordering::Equal),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Align child records, each carrying the parent key column, into slot rows ordered by
/// `(parent, slot)`. Records without a parent key are dropped.
pub fn align(spec: &AlignmentSpec, children: &HashMap<String, Vec<ChildRecord>>) -> Vec<AlignedRow> {
    let mut out: BTreeMap<(i64, i64), AlignedRow> = BTreeMap::new();
    for kind in &spec.kinds {
        let Some(records) = children.get(&kind.alias) else { continue };
        let mut by_parent: BTreeMap<i64, Vec<&ChildRecord>> = BTreeMap::new();
        for r in records {
            if let Some(parent) = r.get(&spec.parent_key).and_then(|v| v.as_i64()) {
                by_parent.entry(parent).or_default().push(r);
            }
        }
        for (parent, mut group) in by_parent {
            // stable sort keeps input order for tied slot keys
            group.sort_by(|a, b| slot_cmp(&kind.slot_order, a, b));
            for (i, record) in group.into_iter().enumerate() {
                let slot = i as i64 + 1;
                out.entry((parent, slot))
                    .or_insert_with(|| AlignedRow { parent_key: parent, slot, members: HashMap::new() })
                    .members
                    .insert(kind.alias.clone(), record.clone());
            }
        }
    }
    out.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{render, Statement};
    use rand::Rng;

    fn kind(alias: &str, slot: &[&str]) -> ChildKind {
        ChildKind {
            cte: format!("claim_{}", alias),
            alias: alias.to_string(),
            table: format!("src.{}", alias),
            join_keys: vec!["clm_num_sk".into()],
            slot_order: slot.iter().map(|s| s.to_string()).collect(),
            carries_parent_key: false,
            parent_filter: None,
        }
    }

    fn spec() -> AlignmentSpec {
        AlignmentSpec {
            parent_key: "clm_uniq_id".into(),
            slot_column: "bfd_row_id".into(),
            group_cte: "claim_groups".into(),
            group_alias: "clm_grp".into(),
            kinds: vec![kind("line", &["num"]), kind("prod", &["type", "seq"]), kind("val", &["seq"]), kind("cond", &["seq"])],
        }
    }

    fn rec(parent: i64, pairs: &[(&str, SqlValue)]) -> ChildRecord {
        let mut r: ChildRecord = pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        r.insert("clm_uniq_id".into(), SqlValue::Int(parent));
        r
    }

    #[test]
    fn row_count_is_max_of_kind_counts() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let counts: Vec<usize> = (0..4).map(|_| rng.gen_range(0..6)).collect();
            let mut children = HashMap::new();
            for (k, n) in spec().kinds.iter().zip(&counts) {
                let rows = (0..*n).map(|i| rec(9, &[("seq", SqlValue::Int(i as i64)), ("num", SqlValue::Int(i as i64))])).collect();
                children.insert(k.alias.clone(), rows);
            }
            let rows = align(&spec(), &children);
            let max = *counts.iter().max().unwrap();
            assert_eq!(rows.len(), max, "counts {:?}", counts);
            for (kind, n) in spec().kinds.iter().zip(&counts) {
                let present = rows.iter().filter(|r| r.members.contains_key(&kind.alias)).count();
                assert_eq!(present, *n);
            }
        }
    }

    #[test]
    fn slots_follow_kind_ordering() {
        let mut children = HashMap::new();
        children.insert(
            "prod".to_string(),
            vec![
                rec(1, &[("type", SqlValue::text("P")), ("seq", SqlValue::Int(2))]),
                rec(1, &[("type", SqlValue::text("D")), ("seq", SqlValue::Int(9))]),
                rec(1, &[("type", SqlValue::text("P")), ("seq", SqlValue::Int(1))]),
            ],
        );
        children.insert("line".to_string(), vec![rec(1, &[("num", SqlValue::Int(1))]), rec(2, &[("num", SqlValue::Int(1))])]);
        let rows = align(&spec(), &children);
        assert_eq!(rows.iter().map(|r| (r.parent_key, r.slot)).collect::<Vec<_>>(), vec![(1, 1), (1, 2), (1, 3), (2, 1)]);
        assert_eq!(rows[0].members["prod"]["type"], SqlValue::text("D"));
        assert_eq!(rows[1].members["prod"]["seq"], SqlValue::Int(1));
        assert!(rows[1].members.get("line").is_none());
        assert!(rows[3].members.get("prod").is_none());
    }

    #[test]
    fn pushed_down_plan_joins_kinds_by_slot() {
        let s = spec();
        let mut ctes = vec![Cte {
            name: CLAIMS_CTE.into(),
            query: Query::Select(Box::new(Select::from(Relation::table("src.clm", "clm")))),
            not_materialized: false,
        }];
        ctes.extend(alignment_ctes(&s, true));
        let mut body = Select::from(Relation::table(CLAIMS_CTE, ALIAS_CLM));
        body.joins = alignment_joins(&s);
        let sql = render(&Statement { ctes, body }).unwrap().sql;
        assert!(sql.contains("claim_line AS NOT MATERIALIZED (SELECT clm.clm_uniq_id, line.*, ROW_NUMBER() OVER (PARTITION BY clm.clm_uniq_id ORDER BY line.num) AS bfd_row_id\nFROM src.line line\nJOIN claims clm ON line.clm_num_sk = clm.clm_num_sk)"));
        assert!(sql.contains("ORDER BY prod.type, prod.seq"));
        assert!(sql.contains("claim_groups AS (SELECT clm_uniq_id, bfd_row_id\nFROM claim_line\nUNION\n"));
        assert!(sql.contains("JOIN claim_groups clm_grp ON clm_grp.clm_uniq_id = clm.clm_uniq_id"));
        assert!(sql.contains("LEFT JOIN claim_val val ON (val.clm_uniq_id = clm.clm_uniq_id AND val.bfd_row_id = clm_grp.bfd_row_id)"));
    }
}
