//! Partition catalog: the independently fetchable units of each table family.
//!
//! Partitions of one family never overlap: either their claim type codes are disjoint or both
//! carry non-overlapping date ranges. Families with no catalog entry fetch as one `default`
//! unit.

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;

use chrono::NaiveDate;

use crate::error::{PipelineError, PipelineResult};
use crate::model::TableFamily;

pub const DEFAULT_PARTITION: &str = "default";

/// Which claim filter rules a partition group selects.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionKind(u8);

impl PartitionKind {
    pub const ADJUDICATED: PartitionKind = PartitionKind(0b001);
    pub const PART_D: PartitionKind = PartitionKind(0b010);
    pub const PAC: PartitionKind = PartitionKind(0b100);
    pub const ALL: PartitionKind = PartitionKind(0b111);

    /// True when any bit of `other` is set here.
    pub fn intersects(self, other: PartitionKind) -> bool {
        self.0 & other.0 != 0
    }

    pub fn bits(self) -> u8 { self.0 }
}

impl BitOr for PartitionKind {
    type Output = PartitionKind;
    fn bitor(self, rhs: PartitionKind) -> PartitionKind { PartitionKind(self.0 | rhs.0) }
}

impl fmt::Debug for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == PartitionKind::ALL {
            return f.write_str("ALL");
        }
        let mut names = Vec::new();
        if self.intersects(PartitionKind::ADJUDICATED) { names.push("ADJUDICATED"); }
        if self.intersects(PartitionKind::PART_D) { names.push("PART_D"); }
        if self.intersects(PartitionKind::PAC) { names.push("PAC"); }
        f.write_str(&names.join("|"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    /// Empty means every code of the family.
    pub claim_type_codes: Vec<i64>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl Partition {
    pub fn new(name: &str, codes: &[i64]) -> Partition {
        Partition { name: name.to_string(), claim_type_codes: codes.to_vec(), start_date: None, end_date: None }
    }

    pub fn unpartitioned() -> Partition {
        Partition::new(DEFAULT_PARTITION, &[])
    }

    pub fn dated(mut self, start: NaiveDate, end: NaiveDate) -> Partition {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    /// Both bounds, or none when the partition is not date bounded.
    pub fn date_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        match (self.start_date, self.end_date) {
            (Some(s), Some(e)) => Some((s, e)),
            _ => None,
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.start_date.is_some() != self.end_date.is_some() {
            return Err(PipelineError::planning(
                "malformed_partition".to_string(),
                format!("partition {} has only one date bound", self.name),
            ));
        }
        if let Some((s, e)) = self.date_range() {
            if s > e {
                return Err(PipelineError::planning(
                    "malformed_partition".to_string(),
                    format!("partition {} starts {} after it ends {}", self.name, s, e),
                ));
            }
        }
        Ok(())
    }

    pub fn overlaps(&self, other: &Partition) -> bool {
        let codes_meet = self.claim_type_codes.is_empty()
            || other.claim_type_codes.is_empty()
            || self.claim_type_codes.iter().any(|c| other.claim_type_codes.contains(c));
        if !codes_meet {
            return false;
        }
        match (self.date_range(), other.date_range()) {
            (Some((s1, e1)), Some((s2, e2))) => s1 <= e2 && s2 <= e1,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionGroup {
    pub kind: PartitionKind,
    pub partitions: Vec<Partition>,
}

/// One fetchable unit: a partition plus the rule set of its group.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionUnit {
    pub kind: PartitionKind,
    pub partition: Partition,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    groups: HashMap<TableFamily, Vec<PartitionGroup>>,
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or(NaiveDate::MIN)
}

impl Catalog {
    pub fn empty() -> Catalog { Catalog::default() }

    pub fn with_group(mut self, family: TableFamily, kind: PartitionKind, partitions: Vec<Partition>) -> Catalog {
        self.groups.entry(family).or_default().push(PartitionGroup { kind, partitions });
        self
    }

    /// Claim partitions used in production.
    pub fn standard() -> Catalog {
        Catalog::empty()
            .with_group(
                TableFamily::Institutional,
                PartitionKind::ADJUDICATED,
                vec![
                    Partition::new("inst_hha", &[10]),
                    Partition::new("inst_snf", &[20, 30]),
                    Partition::new("inst_op", &[40]),
                    Partition::new("inst_hospice", &[50]),
                    Partition::new("inst_ip", &[60, 61, 62, 63, 64]),
                ],
            )
            .with_group(
                TableFamily::Institutional,
                PartitionKind::PAC,
                vec![
                    Partition::new("inst_pac_phase1", &[1011, 1041, 1013, 1071, 1032, 1033, 1021, 1018, 1081, 1082]),
                    Partition::new("inst_pac_phase2", &[2011, 2041, 2013, 2071, 2032, 2033, 2021, 2018, 2081, 2082]),
                ],
            )
            .with_group(
                TableFamily::Professional,
                PartitionKind::ADJUDICATED,
                vec![Partition::new("prof_carrier", &[71, 72]), Partition::new("prof_dme", &[81, 82])],
            )
            .with_group(
                TableFamily::Professional,
                PartitionKind::PAC,
                vec![Partition::new("prof_pac_phase1", &[1700, 1800]), Partition::new("prof_pac_phase2", &[2700, 2800])],
            )
            .with_group(
                TableFamily::Prescription,
                PartitionKind::PART_D,
                vec![
                    Partition::new("part_d_hist", &[1, 2, 3, 4]).dated(ymd(2014, 1, 1), ymd(2019, 12, 31)),
                    Partition::new("part_d_recent", &[1, 2, 3, 4]).dated(ymd(2020, 1, 1), ymd(9999, 12, 31)),
                ],
            )
    }

    pub fn groups_for(&self, family: TableFamily) -> &[PartitionGroup] {
        self.groups.get(&family).map(|g| g.as_slice()).unwrap_or(&[])
    }

    /// Ordered units of a family; a single `default` unit when nothing is catalogued.
    pub fn units_for(&self, family: TableFamily) -> Vec<PartitionUnit> {
        let units: Vec<PartitionUnit> = self
            .groups_for(family)
            .iter()
            .flat_map(|g| g.partitions.iter().map(move |p| PartitionUnit { kind: g.kind, partition: p.clone() }))
            .collect();
        if units.is_empty() {
            return vec![PartitionUnit { kind: PartitionKind::ALL, partition: Partition::unpartitioned() }];
        }
        units
    }

    pub fn partitions_for(&self, family: TableFamily) -> Vec<Partition> {
        self.units_for(family).into_iter().map(|u| u.partition).collect()
    }

    /// Every claim type code the family's partitions recognize.
    pub fn codes_for(&self, family: TableFamily) -> Vec<i64> {
        let mut codes: Vec<i64> = self
            .groups_for(family)
            .iter()
            .flat_map(|g| g.partitions.iter().flat_map(|p| p.claim_type_codes.iter().copied()))
            .collect();
        codes.sort_unstable();
        codes.dedup();
        codes
    }

    /// Every partition is well formed and no two partitions of a family overlap.
    pub fn check_disjoint(&self) -> PipelineResult<()> {
        for (family, groups) in &self.groups {
            let all: Vec<&Partition> = groups.iter().flat_map(|g| g.partitions.iter()).collect();
            for (i, a) in all.iter().enumerate() {
                a.validate()?;
                if let Some(b) = all[i + 1..].iter().find(|b| a.overlaps(b)) {
                    return Err(PipelineError::config(
                        "overlapping_partitions".to_string(),
                        format!("{} partitions {} and {} overlap", family, a.name, b.name),
                    ));
                }
            }
        }
        Ok(())
    }
}
