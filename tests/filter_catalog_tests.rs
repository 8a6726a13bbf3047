use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use idrload::config::Settings;
use idrload::filter::ClaimFilter;
use idrload::model::TableFamily;
use idrload::partition::{Catalog, Partition, PartitionKind, PartitionUnit};
use idrload::progress::{historical_epoch, is_historical, LoadProgress};
use idrload::value::SqlValue;

fn run_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
}

fn pac_filter() -> ClaimFilter {
    let unit = PartitionUnit { kind: PartitionKind::PAC, partition: Partition::new("pac", &[1011, 1041]) };
    ClaimFilter::build(TableFamily::Institutional, &unit, run_start(), &Settings::default(), &Catalog::standard()).unwrap()
}

fn pac_claim(source: &str, updated_days_ago: i64) -> impl Fn(&str) -> SqlValue {
    let source = source.to_string();
    move |c: &str| match c {
        "bene_sk" => SqlValue::Int(42),
        "clm_type_cd" => SqlValue::Int(1011),
        "clm_from_dt" => SqlValue::Date(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
        "clm_thru_dt" => SqlValue::Date(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()),
        "clm_src_id" => SqlValue::text(source.clone()),
        "idr_updt_ts" => SqlValue::Timestamp(run_start() - Duration::days(updated_days_ago)),
        _ => SqlValue::Null,
    }
}

#[test]
fn pac_rows_need_a_recent_update_from_a_known_source() {
    let f = pac_filter();
    assert!(f.matches(pac_claim("21000", 10), false));
    assert!(!f.matches(pac_claim("21000", 90), false));
    assert!(!f.matches(pac_claim("99999", 10), false));
    assert!(!f.matches(pac_claim("99999", 1), false));
    // deceased beneficiaries are dropped whatever the claim looks like
    assert!(!f.matches(pac_claim("21000", 10), true));
}

#[test]
fn pac_cutoff_follows_settings() {
    let unit = PartitionUnit { kind: PartitionKind::PAC, partition: Partition::new("pac", &[1011]) };
    let settings = Settings { pac_cutoff_days: 120, ..Settings::default() };
    let f = ClaimFilter::build(TableFamily::Institutional, &unit, run_start(), &settings, &Catalog::standard()).unwrap();
    assert!(f.matches(pac_claim("22000", 90), false));
}

#[test]
fn standard_catalog_is_disjoint() {
    let cat = Catalog::standard();
    cat.check_disjoint().unwrap();
    for family in [TableFamily::Institutional, TableFamily::Professional, TableFamily::Prescription] {
        let parts = cat.partitions_for(family);
        assert!(!parts.is_empty());
        for (i, a) in parts.iter().enumerate() {
            for b in &parts[i + 1..] {
                assert!(!a.overlaps(b), "{} overlaps {}", a.name, b.name);
            }
        }
    }
}

#[test]
fn overlapping_partitions_are_rejected() {
    let d = |y, m, dd| NaiveDate::from_ymd_opt(y, m, dd).unwrap();
    let cat = Catalog::empty().with_group(
        TableFamily::Prescription,
        PartitionKind::PART_D,
        vec![
            Partition::new("a", &[1, 2]).dated(d(2020, 1, 1), d(2021, 1, 1)),
            Partition::new("b", &[2, 3]).dated(d(2020, 6, 1), d(2022, 1, 1)),
        ],
    );
    let err = cat.check_disjoint().unwrap_err();
    assert_eq!(err.code_str(), "overlapping_partitions");

    let cat = Catalog::empty().with_group(
        TableFamily::Prescription,
        PartitionKind::PART_D,
        vec![
            Partition::new("a", &[1, 2]).dated(d(2020, 1, 1), d(2020, 12, 31)),
            Partition::new("b", &[1, 2]).dated(d(2021, 1, 1), d(2022, 1, 1)),
        ],
    );
    cat.check_disjoint().unwrap();
}

#[test]
fn historical_switch_is_at_the_epoch() {
    let at = historical_epoch();
    let p = |ts| LoadProgress { last_ts: ts, last_id: 9, job_start_ts: ts, batch_start_ts: ts, batch_complete_ts: ts };
    assert!(is_historical(Some(&p(at))));
    assert!(!is_historical(Some(&p(at + Duration::seconds(1)))));
    assert!(is_historical(None));
}
