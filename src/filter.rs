//! Claim row selection.
//!
//! A [`ClaimFilter`] is built once per (partition, run) and can either render itself as one
//! predicate on the claim alias or evaluate a fetched record in memory. Both paths apply the same
//! rules so in-process sources and the warehouse select identical rows.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::config::Settings;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{source_table, TableFamily};
use crate::partition::{Catalog, PartitionKind, PartitionUnit};
use crate::sql::{Expr, Predicate, Relation, Select, SelectItem};
use crate::value::SqlValue;

/// Claims dated before this are never loaded unless a partition says otherwise.
pub const MIN_CLAIM_LOAD_DATE: NaiveDate = match NaiveDate::from_ymd_opt(2014, 6, 30) {
    Some(d) => d,
    None => NaiveDate::MIN,
};

/// Prescription event claims are loaded regardless of the latest-claim indicator.
pub const PART_D_CLAIM_TYPE_CODES: [i64; 4] = [1, 2, 3, 4];

/// Partially adjudicated claim type codes subject to the recency cutoff.
pub const PAC_PHASE1_MIN: i64 = 1000;
pub const PAC_PHASE1_MAX: i64 = 1999;

/// FISS, MCS and VMS.
pub const PAC_SOURCES: [&str; 3] = ["21000", "22000", "23000"];

const DEATH_ALIAS: &str = "dth";

/// Correlated NOT EXISTS against verified deaths older than `years`.
pub fn deceased_exclusion(key: Expr, years: u32) -> Predicate {
    let subquery = Select::from(Relation::table(&source_table("v2_mdcr_bene_hstry"), DEATH_ALIAS))
        .item(SelectItem::new(Expr::col(DEATH_ALIAS, "bene_sk")))
        .filter(Expr::col(DEATH_ALIAS, "bene_vrfy_death_day_sw").eq(Expr::Str("Y".into())))
        .filter(Predicate::raw(format!(
            "{}.bene_death_dt < CURRENT_DATE - INTERVAL '{} years'",
            DEATH_ALIAS, years
        )))
        .filter(Expr::col(DEATH_ALIAS, "bene_sk").eq(key));
    Predicate::Exists { subquery: Box::new(subquery), negated: true }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimFilter {
    pub claim_type_codes: Vec<i64>,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub latest_only: bool,
    /// Part D codes bypass the latest-claim indicator.
    pub part_d_carve_out: bool,
    /// Present when the PAC recency rule applies.
    pub pac_cutoff: Option<DateTime<Utc>>,
    pub death_cutoff_years: u32,
}

impl ClaimFilter {
    pub fn build(
        family: TableFamily,
        unit: &PartitionUnit,
        run_start: DateTime<Utc>,
        settings: &Settings,
        catalog: &Catalog,
    ) -> PipelineResult<ClaimFilter> {
        if !family.is_claim() {
            return Err(PipelineError::config(
                "unfiltered_family".to_string(),
                format!("no claim filter rules for the {} family", family),
            ));
        }
        unit.partition.validate()?;
        let claim_type_codes = if unit.partition.claim_type_codes.is_empty() {
            catalog.codes_for(family)
        } else {
            unit.partition.claim_type_codes.clone()
        };
        if claim_type_codes.is_empty() {
            return Err(PipelineError::config(
                "unfiltered_family".to_string(),
                format!("the {} family recognizes no claim type codes", family),
            ));
        }
        let pac_cutoff = unit
            .kind
            .intersects(PartitionKind::PAC)
            .then(|| run_start - Duration::days(settings.pac_cutoff_days));
        Ok(ClaimFilter {
            claim_type_codes,
            date_range: unit.partition.date_range(),
            latest_only: settings.latest_claims,
            part_d_carve_out: unit.kind.intersects(PartitionKind::PART_D),
            pac_cutoff,
            death_cutoff_years: settings.death_cutoff_years,
        })
    }

    pub fn predicate(&self, alias: &str) -> Predicate {
        let c = |name: &str| Expr::col(alias, name);
        let mut parts = vec![
            c("bene_sk").ne(Expr::Int(0)),
            deceased_exclusion(c("bene_sk"), self.death_cutoff_years),
            Predicate::InList {
                expr: c("clm_type_cd"),
                list: self.claim_type_codes.iter().map(|v| Expr::Int(*v)).collect(),
                negated: false,
            },
        ];
        parts.push(match self.date_range {
            Some((start, end)) => Predicate::Between {
                expr: c("clm_from_dt"),
                low: Expr::param(SqlValue::Date(start)),
                high: Expr::param(SqlValue::Date(end)),
                negated: false,
            },
            None => c("clm_from_dt").ge(Expr::param(SqlValue::Date(MIN_CLAIM_LOAD_DATE))),
        });
        if self.latest_only {
            let latest = c("clm_ltst_clm_ind").eq(Expr::Str("Y".into()));
            parts.push(if self.part_d_carve_out {
                Predicate::or(vec![
                    latest,
                    Predicate::InList {
                        expr: c("clm_type_cd"),
                        list: PART_D_CLAIM_TYPE_CODES.iter().map(|v| Expr::Int(*v)).collect(),
                        negated: false,
                    },
                ])
            } else {
                latest
            });
        }
        if let Some(cutoff) = self.pac_cutoff {
            parts.push(Predicate::or(vec![
                Predicate::Between {
                    expr: c("clm_type_cd"),
                    low: Expr::Int(PAC_PHASE1_MIN),
                    high: Expr::Int(PAC_PHASE1_MAX),
                    negated: true,
                },
                Predicate::and(vec![
                    Predicate::InList {
                        expr: c("clm_src_id"),
                        list: PAC_SOURCES.iter().map(|s| Expr::Str(s.to_string())).collect(),
                        negated: false,
                    },
                    Expr::Coalesce(vec![c("idr_updt_ts"), c("idr_insrt_ts"), c("clm_idr_ld_dt")])
                        .ge(Expr::param(SqlValue::Timestamp(cutoff))),
                ]),
            ]));
        }
        parts.push(c("clm_from_dt").le(c("clm_thru_dt")));
        Predicate::and(parts)
    }

    /// Evaluate a claim record in memory. `column` reads an unqualified claim column; NULL
    /// comparisons reject the row as they would in SQL.
    pub fn matches<F>(&self, column: F, deceased: bool) -> bool
    where
        F: Fn(&str) -> SqlValue,
    {
        if deceased {
            return false;
        }
        if !matches!(column("bene_sk").as_i64(), Some(v) if v != 0) {
            return false;
        }
        let Some(type_cd) = column("clm_type_cd").as_i64() else {
            return false;
        };
        if !self.claim_type_codes.contains(&type_cd) {
            return false;
        }
        let (Some(from), Some(thru)) = (column("clm_from_dt").as_date(), column("clm_thru_dt").as_date()) else {
            return false;
        };
        let in_range = match self.date_range {
            Some((start, end)) => from >= start && from <= end,
            None => from >= MIN_CLAIM_LOAD_DATE,
        };
        if !in_range || from > thru {
            return false;
        }
        if self.latest_only {
            let latest = column("clm_ltst_clm_ind").as_str() == Some("Y");
            let carved = self.part_d_carve_out && PART_D_CLAIM_TYPE_CODES.contains(&type_cd);
            if !latest && !carved {
                return false;
            }
        }
        if let Some(cutoff) = self.pac_cutoff {
            if (PAC_PHASE1_MIN..=PAC_PHASE1_MAX).contains(&type_cd) {
                let recognized = column("clm_src_id").as_str().map(|s| PAC_SOURCES.contains(&s)).unwrap_or(false);
                let recent = ["idr_updt_ts", "idr_insrt_ts", "clm_idr_ld_dt"]
                    .iter()
                    .find_map(|c| column(c).as_timestamp())
                    .map(|ts| ts >= cutoff)
                    .unwrap_or(false);
                if !(recognized && recent) {
                    return false;
                }
            }
        }
        true
    }
}
