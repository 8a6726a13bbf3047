//! End-to-end runs over the in-memory warehouse, loader and checkpoint store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use idrload::config::{LoadMode, Settings};
use idrload::executor::Executor;
use idrload::loader::{MemoryLoader, UpsertLoader};
use idrload::model::{Registry, TableFamily};
use idrload::partition::{Catalog, Partition, PartitionKind, PartitionUnit};
use idrload::planner::{Planner, RunContext};
use idrload::progress::{CheckpointStore, MemoryCheckpointStore, ProgressKey};
use idrload::scheduler::{Scheduler, UnitStatus};
use idrload::source::{ClaimBundle, MemoryWarehouse, Warehouse};
use idrload::value::{Row, SqlValue};

const CLAIMS: &str = "idr.claim_institutional";
const ITEMS: &str = "idr.claim_item_institutional";

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
}

fn date(y: i32, m: u32, d: u32) -> SqlValue {
    SqlValue::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

fn p1_catalog() -> Catalog {
    Catalog::empty().with_group(TableFamily::Institutional, PartitionKind::ADJUDICATED, vec![Partition::new("p1", &[10, 20])])
}

fn p1_unit() -> PartitionUnit {
    PartitionUnit { kind: PartitionKind::ADJUDICATED, partition: Partition::new("p1", &[10, 20]) }
}

fn run() -> RunContext {
    RunContext { run_start: day(28), mode: LoadMode::Production }
}

fn header(id: i64, type_cd: i64, loaded: u32) -> HashMap<String, SqlValue> {
    let mut r = HashMap::new();
    r.insert("clm_uniq_id".to_string(), SqlValue::Int(id));
    r.insert("clm_type_cd".to_string(), SqlValue::Int(type_cd));
    r.insert("bene_sk".to_string(), SqlValue::Int(id + 100));
    r.insert("clm_from_dt".to_string(), date(2024, 1, 1));
    r.insert("clm_thru_dt".to_string(), date(2024, 1, 5));
    r.insert("clm_src_id".to_string(), SqlValue::text("20000"));
    r.insert("clm_ltst_clm_ind".to_string(), SqlValue::text("Y"));
    r.insert("idr_insrt_ts".to_string(), SqlValue::Timestamp(day(loaded)));
    r.insert("clm_idr_ld_dt".to_string(), SqlValue::Date(day(loaded).date_naive()));
    r
}

/// A claim header as the flat institutional model reads it.
fn claim(id: i64, type_cd: i64, loaded: u32) -> HashMap<String, SqlValue> {
    header(id, type_cd, loaded).into_iter().map(|(k, v)| (format!("clm.{}", k), v)).collect()
}

struct Pipeline {
    warehouse: Arc<MemoryWarehouse>,
    loader: Arc<MemoryLoader>,
    store: Arc<MemoryCheckpointStore>,
    exec: Arc<Executor>,
    settings: Arc<Settings>,
    catalog: Arc<Catalog>,
}

fn pipeline(settings: Settings) -> Pipeline {
    let settings = Arc::new(settings);
    let catalog = Arc::new(p1_catalog());
    let warehouse = Arc::new(MemoryWarehouse::new());
    let loader = Arc::new(MemoryLoader::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    let exec = Arc::new(Executor::new(settings.clone(), catalog.clone(), warehouse.clone(), loader.clone(), store.clone()));
    Pipeline { warehouse, loader, store, exec, settings, catalog }
}

fn ids(rows: &[idrload::loader::StoredRow]) -> Vec<i64> {
    rows.iter().filter_map(|r| r.values.get("clm_uniq_id").and_then(|v| v.as_i64())).collect()
}

#[tokio::test]
async fn p1_first_run_then_only_the_new_claim() {
    let p = pipeline(Settings::default());
    let registry = Registry::load().unwrap();
    let model = registry.get(CLAIMS).unwrap();
    p.warehouse.insert(CLAIMS, vec![claim(2, 20, 2), claim(1, 10, 1), claim(3, 30, 3), claim(4, 10, 2)]);

    let out = p.exec.run_unit(model, &p1_unit(), &run(), &CancellationToken::new()).await.unwrap();
    assert!(out.finished);
    assert_eq!(out.rows, 3);
    let key = ProgressKey::new(CLAIMS, "p1");
    let stored = p.store.snapshot(&key).unwrap();
    assert_eq!(stored.cursor(), (day(2), 4));
    let mut loaded = ids(&p.loader.rows(CLAIMS));
    loaded.sort();
    assert_eq!(loaded, vec![1, 2, 4]);

    p.warehouse.insert(CLAIMS, vec![claim(5, 10, 9)]);
    let out = p.exec.run_unit(model, &p1_unit(), &run(), &CancellationToken::new()).await.unwrap();
    assert_eq!(out.rows, 1);
    assert_eq!(out.checkpoint, Some((day(9), 5)));
    assert_eq!(p.loader.rows(CLAIMS).len(), 4);
}

#[tokio::test]
async fn second_fetch_never_returns_rows_at_or_before_the_cursor() {
    let p = pipeline(Settings { batch_size: 1, ..Settings::default() });
    let registry = Registry::load().unwrap();
    let model = registry.get(CLAIMS).unwrap();
    p.warehouse.insert(CLAIMS, (1..=6).map(|i| claim(i, 10, (i as u32 % 3) + 1)).collect());
    p.exec.run_unit(model, &p1_unit(), &run(), &CancellationToken::new()).await.unwrap();

    let key = ProgressKey::new(CLAIMS, "p1");
    let progress = p.store.get(&key).await.unwrap();
    let last = progress.as_ref().unwrap().cursor();
    p.warehouse.insert(CLAIMS, vec![claim(7, 10, 3), claim(8, 20, 1), claim(9, 10, 2)]);

    let plan = Planner::new(&p.settings, &p.catalog).plan(model, &p1_unit(), &run(), progress.as_ref()).unwrap();
    let cursor = plan.cursor.clone().unwrap();
    let rows: Vec<Row> = p.warehouse.fetch(model, &plan).await.unwrap().map(|r| r.unwrap()).collect().await;
    assert!(!rows.is_empty());
    for r in &rows {
        assert!(cursor.cursor_of(r) > last, "{:?} not after {:?}", cursor.cursor_of(r), last);
    }
}

#[test]
fn every_built_in_model_registers() {
    let registry = Registry::load().unwrap();
    for table in [CLAIMS, ITEMS, "idr.claim_item_professional", "idr.beneficiary_mbi_id", "idr.beneficiary_low_income_subsidy"] {
        assert!(registry.get(table).is_some(), "{} missing", table);
    }
}

fn mbi(id: &str, loaded: u32) -> HashMap<String, SqlValue> {
    let mut r = HashMap::new();
    r.insert("mbi.bene_mbi_id".to_string(), SqlValue::text(id));
    r.insert("mbi.bene_mbi_efctv_dt".to_string(), date(2020, 1, 1));
    r.insert("mbi.idr_ltst_trans_flg".to_string(), SqlValue::text("Y"));
    r.insert("mbi.idr_trans_efctv_ts".to_string(), SqlValue::Timestamp(day(1)));
    r.insert("mbi.idr_insrt_ts".to_string(), SqlValue::Timestamp(day(loaded)));
    r
}

#[tokio::test]
async fn tables_without_batch_id_do_not_refetch_the_last_timestamp() {
    const MBI: &str = "idr.beneficiary_mbi_id";
    let p = pipeline(Settings::default());
    let registry = Registry::load().unwrap();
    let model = registry.get(MBI).unwrap();
    assert!(model.batch_id().is_none());
    let unit = PartitionUnit { kind: PartitionKind::ALL, partition: Partition::unpartitioned() };
    p.warehouse.insert(MBI, vec![mbi("1S00A00AA00", 5), mbi("1S00A00AA01", 5), mbi("1S00A00AA02", 3)]);

    let out = p.exec.run_unit(model, &unit, &run(), &CancellationToken::new()).await.unwrap();
    assert_eq!(out.rows, 3);
    assert_eq!(out.checkpoint, Some((day(5), 0)));

    let out = p.exec.run_unit(model, &unit, &run(), &CancellationToken::new()).await.unwrap();
    assert!(out.finished);
    assert_eq!(out.rows, 0);
    assert_eq!(p.loader.rows(MBI).len(), 3);

    p.warehouse.insert(MBI, vec![mbi("1S00A00AA03", 6)]);
    let out = p.exec.run_unit(model, &unit, &run(), &CancellationToken::new()).await.unwrap();
    assert_eq!(out.rows, 1);
    assert_eq!(out.checkpoint, Some((day(6), 0)));
}

#[tokio::test]
async fn reloading_a_batch_leaves_the_same_rows() {
    let p = pipeline(Settings::default());
    let registry = Registry::load().unwrap();
    let model = registry.get(CLAIMS).unwrap();
    p.warehouse.insert(CLAIMS, vec![claim(1, 10, 1), claim(2, 20, 2)]);
    let plan = Planner::new(&p.settings, &p.catalog).plan(model, &p1_unit(), &run(), None).unwrap();
    let rows: Vec<Row> = p.warehouse.fetch(model, &plan).await.unwrap().map(|r| r.unwrap()).collect().await;

    let ts = day(20);
    p.loader.load_batch(model, &plan, &rows, ts).await.unwrap();
    let once = p.loader.rows(CLAIMS);
    p.loader.load_batch(model, &plan, &rows, ts).await.unwrap();
    let twice = p.loader.rows(CLAIMS);
    assert_eq!(once.len(), twice.len());
    for (a, b) in once.iter().zip(&twice) {
        assert_eq!(a.values, b.values);
        assert_eq!(a.created, b.created);
    }
    p.loader.load_batch(model, &plan, &rows, ts).await.unwrap();
    assert_eq!(p.loader.rows(CLAIMS), twice);
}

#[tokio::test]
async fn failed_batch_changes_nothing_and_retry_catches_up() {
    let p = pipeline(Settings::default());
    let registry = Registry::load().unwrap();
    let model = registry.get(CLAIMS).unwrap();
    p.warehouse.insert(CLAIMS, vec![claim(1, 10, 1)]);
    p.loader.fail_next(1);
    let err = p.exec.run_unit(model, &p1_unit(), &run(), &CancellationToken::new()).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(p.loader.rows(CLAIMS).is_empty());
    assert!(p.store.snapshot(&ProgressKey::new(CLAIMS, "p1")).unwrap().is_initial());

    let out = p.exec.run_unit(model, &p1_unit(), &run(), &CancellationToken::new()).await.unwrap();
    assert_eq!(out.rows, 1);
}

fn child(pairs: &[(&str, SqlValue)]) -> HashMap<String, SqlValue> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn bundle(id: i64, lines: i64, procs: i64, vals: i64) -> ClaimBundle {
    let mut parent = header(id, 10, 4);
    parent.insert("clm_rlt_cond_sgntr_sk".to_string(), SqlValue::Int(0));
    let mut children = HashMap::new();
    children.insert("line".to_string(), (1..=lines).map(|n| child(&[("clm_line_num", SqlValue::Int(n))])).collect());
    children.insert(
        "prod".to_string(),
        (1..=procs)
            .map(|n| child(&[("clm_prod_type_cd", SqlValue::text("P")), ("clm_val_sqnc_num", SqlValue::Int(n))]))
            .collect(),
    );
    children.insert(
        "val".to_string(),
        (1..=vals).map(|n| child(&[("clm_val_sqnc_num", SqlValue::Int(n)), ("clm_val_amt", SqlValue::Float(n as f64))])).collect(),
    );
    ClaimBundle { parent, children }
}

#[tokio::test]
async fn claim_items_load_one_row_per_slot() {
    let p = pipeline(Settings::default());
    let registry = Registry::load().unwrap();
    let model = registry.get(ITEMS).unwrap();
    p.warehouse.insert_bundles(ITEMS, vec![bundle(7, 3, 2, 4), bundle(8, 1, 0, 0)]);

    let out = p.exec.run_unit(model, &p1_unit(), &run(), &CancellationToken::new()).await.unwrap();
    assert_eq!(out.rows, 5);
    let rows = p.loader.rows(ITEMS);
    let of_seven: Vec<_> = rows.iter().filter(|r| r.values["clm_uniq_id"] == SqlValue::Int(7)).collect();
    assert_eq!(of_seven.len(), 4);
    let slot4 = of_seven.iter().find(|r| r.values["bfd_row_id"] == SqlValue::Int(4)).unwrap();
    assert_eq!(slot4.values["clm_line_num"], SqlValue::Null);
    assert_eq!(slot4.values["clm_val_sqnc_num_val"], SqlValue::Int(4));
    let slot3 = of_seven.iter().find(|r| r.values["bfd_row_id"] == SqlValue::Int(3)).unwrap();
    assert_eq!(slot3.values["clm_line_num"], SqlValue::Int(3));
    assert_eq!(slot3.values["clm_val_sqnc_num_prod"], SqlValue::Null);
}

#[tokio::test]
async fn scheduler_isolates_failing_units() {
    let p = pipeline(Settings { workers: 1, max_attempts: 1, ..Settings::default() });
    let registry = Arc::new(Registry::load().unwrap());
    p.warehouse.insert(CLAIMS, vec![claim(1, 10, 1)]);
    p.warehouse.insert_bundles(ITEMS, vec![bundle(1, 2, 1, 0)]);
    p.warehouse.fail_next(1);
    let scheduler = Scheduler::new(p.settings.clone(), registry, p.catalog.clone(), p.exec.clone());
    let tables = vec![CLAIMS.to_string(), ITEMS.to_string()];
    let report = scheduler.run(&tables, run(), CancellationToken::new()).await.unwrap();

    assert_eq!(report.units.len(), 2);
    assert_eq!(report.failed().len(), 1);
    assert_eq!(report.completed().len(), 1);
    assert!(matches!(report.failed()[0].status, UnitStatus::Failed { retryable: true, .. }));
    assert!(report.completed()[0].checkpoint.is_some());
    assert!(!report.is_success());
}
