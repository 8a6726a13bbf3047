//! Claim header, claim item and prescription models.

use crate::sql::{Cte, Expr, JoinType, OrderBy, Predicate, Query, Relation, Select, SelectItem, WindowFunc};

use super::beneficiary::not_obsolete;
use super::transform::Transform;
use super::{
    source_table, AlignmentSpec, ChildKind, ClaimScope, FieldSpec, LoadStrategy, TableFamily, TableModel, ALIAS_CLM,
    CLAIM_TABLE,
};

pub const CLAIM_INSTITUTIONAL_TABLE: &str = "idr.claim_institutional";
pub const CLAIM_PROFESSIONAL_TABLE: &str = "idr.claim_professional";
pub const CLAIM_RX_TABLE: &str = "idr.claim_rx";

const CLAIM_UPDATED_COLUMN: &str = "bfd_claim_updated_ts";
const CLAIM_KEYS: [&str; 4] = ["geo_bene_sk", "clm_type_cd", "clm_num_sk", "clm_dt_sgntr_sk"];
const LINE_KEYS: [&str; 5] = ["geo_bene_sk", "clm_type_cd", "clm_num_sk", "clm_dt_sgntr_sk", "clm_line_num"];

const SGNTR: &str = "sgntr";
const LINE: &str = "line";
const PROD: &str = "prod";
const VAL: &str = "val";
const RLT_COND: &str = "rlt_cond";
const CLM_GRP: &str = "clm_grp";

/// `left.k = right.k` for every key column.
fn keys_eq(left: &str, right: &str, keys: &[&str]) -> Predicate {
    Predicate::and(keys.iter().map(|k| Expr::col(left, k).eq(Expr::col(right, k))).collect())
}

/// Current provider history row for an NPI column.
fn provider_join(alias: &str, npi: Expr) -> Predicate {
    Predicate::and(vec![
        Expr::col(alias, "prvdr_npi_num").eq(npi),
        not_obsolete(alias, "prvdr_hstry_obslt_dt"),
    ])
}

fn provider_fields(alias: &str, prefix: &str) -> Vec<FieldSpec> {
    let f = |suffix: &str, column: &str| FieldSpec::text(&format!("{}_{}", prefix, suffix)).alias(alias).column(column);
    vec![
        f("prvdr_npi_num", "prvdr_npi_num").transform(Transform::DefaultString),
        FieldSpec::int(&format!("{}_sk", prefix))
            .alias(alias)
            .column("prvdr_sk")
            .transform(Transform::DefaultIntToNull),
        f("type_cd", "prvdr_type_cd").transform(Transform::DefaultString),
        f("txnmy_cmpst_cd", "prvdr_txnmy_cmpst_cd").transform(Transform::DefaultString),
        f("1st_name", "prvdr_1st_name").transform(Transform::DefaultString),
        f("name", "prvdr_name").transform(Transform::ProviderName),
        f("lgl_name", "prvdr_lgl_name").transform(Transform::DefaultString),
        f("last_name", "prvdr_last_name").transform(Transform::DefaultString),
    ]
}

/// Header columns read from the claim relation.
fn header_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::int("clm_uniq_id").alias(ALIAS_CLM).pk().batch_id().last_updated_key(),
        FieldSpec::int("clm_type_cd").alias(ALIAS_CLM),
        FieldSpec::int("bene_sk").alias(ALIAS_CLM),
        FieldSpec::text("clm_cntl_num").alias(ALIAS_CLM),
        FieldSpec::text("clm_orig_cntl_num").expr(
            "CASE WHEN clm.clm_cntl_num = clm.clm_orig_cntl_num THEN '' ELSE clm.clm_orig_cntl_num END",
        ),
        FieldSpec::date("clm_from_dt").alias(ALIAS_CLM),
        FieldSpec::date("clm_thru_dt").alias(ALIAS_CLM),
        FieldSpec::date("clm_efctv_dt").alias(ALIAS_CLM),
        FieldSpec::date("clm_obslt_dt").alias(ALIAS_CLM).transform(Transform::DefaultDateToNull),
        FieldSpec::text("clm_finl_actn_ind").alias(ALIAS_CLM),
        FieldSpec::text("clm_src_id").alias(ALIAS_CLM),
        FieldSpec::float("clm_pmt_amt").alias(ALIAS_CLM),
        FieldSpec::float("clm_sbmt_chrg_amt").alias(ALIAS_CLM),
        FieldSpec::date("clm_pd_dt").alias(ALIAS_CLM).transform(Transform::DefaultDateToNull),
        FieldSpec::text("clm_ltst_clm_ind").alias(ALIAS_CLM),
        FieldSpec::text("clm_adjstmt_type_cd").alias(ALIAS_CLM).transform(Transform::DefaultString),
        FieldSpec::timestamp("idr_insrt_ts_clm")
            .alias(ALIAS_CLM)
            .column("idr_insrt_ts")
            .batch_ts()
            .insert_excluded()
            .transform(Transform::NullDateToMin),
        FieldSpec::timestamp("idr_updt_ts_clm")
            .alias(ALIAS_CLM)
            .column("idr_updt_ts")
            .update_ts()
            .insert_excluded()
            .transform(Transform::NullDateToMin),
        FieldSpec::date("clm_idr_ld_dt").alias(ALIAS_CLM).historical_ts().insert_excluded(),
    ]
}

/// Batch and update timestamps of one joined relation.
fn relation_timestamps(alias: &str, suffix: &str, excluded: bool) -> Vec<FieldSpec> {
    let mut insrt = FieldSpec::timestamp(&format!("idr_insrt_ts_{}", suffix))
        .alias(alias)
        .column("idr_insrt_ts")
        .batch_ts()
        .transform(Transform::NullDateToMin);
    let mut updt = FieldSpec::timestamp(&format!("idr_updt_ts_{}", suffix))
        .alias(alias)
        .column("idr_updt_ts")
        .update_ts()
        .transform(Transform::NullDateToMin);
    if excluded {
        insrt = insrt.insert_excluded();
        updt = updt.insert_excluded();
    }
    vec![insrt, updt]
}

fn signature_join(model: TableModel) -> TableModel {
    model.join(
        JoinType::Inner,
        Relation::table(&source_table("v2_mdcr_clm_dt_sgntr"), SGNTR),
        Expr::col(SGNTR, "clm_dt_sgntr_sk").eq(Expr::col(ALIAS_CLM, "clm_dt_sgntr_sk")),
    )
}

fn claim_institutional() -> TableModel {
    let model = TableModel::new(
        CLAIM_INSTITUTIONAL_TABLE,
        TableFamily::Institutional,
        LoadStrategy::Incremental,
        Relation::table(CLAIM_TABLE, ALIAS_CLM),
    )
    .fields(header_fields())
    .fields(vec![
        FieldSpec::date("clm_submsn_dt").alias(SGNTR).transform(Transform::DefaultDateToNull),
        FieldSpec::date("clm_actv_care_from_dt").alias(SGNTR).transform(Transform::DefaultDateToNull),
        FieldSpec::date("clm_dschrg_dt").alias(SGNTR).transform(Transform::DefaultDateToNull),
    ])
    .fields(relation_timestamps(SGNTR, "sgntr", true))
    .fields(vec![
        FieldSpec::text("clm_admsn_type_cd").alias("instnl").transform(Transform::DefaultString),
        FieldSpec::text("bene_ptnt_stus_cd").alias("instnl").transform(Transform::DefaultString),
        FieldSpec::text("dgns_drg_cd").alias("instnl").transform(Transform::DefaultString),
        FieldSpec::float("clm_mdcr_instnl_tot_chrg_amt").alias("instnl"),
        FieldSpec::text("clm_fi_actn_cd").alias("instnl").transform(Transform::DefaultString),
    ])
    .fields(relation_timestamps("instnl", "instnl", true))
    .claim_scope(ClaimScope { cte_columns: vec![], min_transaction_date: false, filter_outer: true })
    .join(
        JoinType::Inner,
        Relation::table(&source_table("v2_mdcr_clm_instnl"), "instnl"),
        keys_eq(ALIAS_CLM, "instnl", &CLAIM_KEYS),
    )
    .last_updated(CLAIM_INSTITUTIONAL_TABLE, &[CLAIM_UPDATED_COLUMN]);
    signature_join(model)
}

fn latest_location_cte() -> Cte {
    let lctn = "lctn_hstry";
    let mut select = Select::from(Relation::table(&source_table("v2_mdcr_clm_lctn_hstry"), lctn));
    for k in CLAIM_KEYS {
        select = select.item(SelectItem::new(Expr::col("claims", k)));
    }
    select = select
        .item(SelectItem::aliased(Expr::raw("MAX(lctn_hstry.clm_lctn_cd_sqnc_num)"), "max_clm_lctn_cd_sqnc_num"))
        .join(JoinType::Inner, Relation::Table { name: "claims".into(), alias: None }, keys_eq(lctn, "claims", &CLAIM_KEYS));
    select.group_by = CLAIM_KEYS.iter().map(|k| Expr::col("claims", k)).collect();
    Cte { name: "latest_clm_lctn_hstry".into(), query: Query::Select(Box::new(select)), not_materialized: false }
}

fn claim_professional() -> TableModel {
    let lctn = "lctn_hstry";
    let model = TableModel::new(
        CLAIM_PROFESSIONAL_TABLE,
        TableFamily::Professional,
        LoadStrategy::Incremental,
        Relation::table(CLAIM_TABLE, ALIAS_CLM),
    )
    .fields(header_fields())
    .fields(vec![FieldSpec::date("clm_submsn_dt").alias(SGNTR).transform(Transform::DefaultDateToNull)])
    .fields(relation_timestamps(SGNTR, "sgntr", true))
    .fields(vec![
        FieldSpec::text("clm_clncl_tril_num").alias("prfnl").transform(Transform::DefaultString),
        FieldSpec::float("clm_mdcr_ddctbl_amt").alias("prfnl"),
        FieldSpec::text("clm_mdcr_prfnl_prvdr_asgnmt_sw").alias("prfnl").transform(Transform::DefaultString),
    ])
    .fields(relation_timestamps("prfnl", "prfnl", true))
    .fields(vec![FieldSpec::text("clm_audt_trl_stus_cd").alias(lctn).transform(Transform::NullString)])
    .fields(relation_timestamps(lctn, "lctn_hstry", true))
    .fields(vec![FieldSpec::text("clm_nrln_ric_cd").alias("dcmtn").transform(Transform::NullString)])
    .claim_scope(ClaimScope {
        cte_columns: vec![
            "clm_uniq_id".into(),
            "geo_bene_sk".into(),
            "clm_type_cd".into(),
            "clm_num_sk".into(),
            "clm_dt_sgntr_sk".into(),
            "clm_idr_ld_dt".into(),
        ],
        min_transaction_date: false,
        filter_outer: true,
    })
    .cte(latest_location_cte());
    signature_join(model)
        .join(
            JoinType::Inner,
            Relation::table(&source_table("v2_mdcr_clm_prfnl"), "prfnl"),
            keys_eq(ALIAS_CLM, "prfnl", &CLAIM_KEYS),
        )
        .join(
            JoinType::Left,
            Relation::table(&source_table("v2_mdcr_clm_dcmtn"), "dcmtn"),
            keys_eq(ALIAS_CLM, "dcmtn", &CLAIM_KEYS),
        )
        .join(
            JoinType::Left,
            Relation::table("latest_clm_lctn_hstry", "latest_lctn"),
            keys_eq(ALIAS_CLM, "latest_lctn", &CLAIM_KEYS),
        )
        .join(
            JoinType::Left,
            Relation::table(&source_table("v2_mdcr_clm_lctn_hstry"), lctn),
            Predicate::and(vec![
                keys_eq(ALIAS_CLM, lctn, &CLAIM_KEYS),
                Expr::col(lctn, "clm_lctn_cd_sqnc_num").eq(Expr::col("latest_lctn", "max_clm_lctn_cd_sqnc_num")),
            ]),
        )
        .last_updated(CLAIM_PROFESSIONAL_TABLE, &[CLAIM_UPDATED_COLUMN])
}

fn child(cte: &str, alias: &str, table: &str, slot_order: &[&str], carries_parent_key: bool) -> ChildKind {
    ChildKind {
        cte: cte.to_string(),
        alias: alias.to_string(),
        table: source_table(table),
        join_keys: CLAIM_KEYS.iter().map(|k| k.to_string()).collect(),
        slot_order: slot_order.iter().map(|k| k.to_string()).collect(),
        carries_parent_key,
        parent_filter: None,
    }
}

fn lines() -> ChildKind {
    // the line relation already carries clm_uniq_id
    child("claim_lines", LINE, "v2_mdcr_clm_line", &["clm_line_num"], true)
}

fn procedures() -> ChildKind {
    child("claim_procedures", PROD, "v2_mdcr_clm_prod", &["clm_prod_type_cd", "clm_val_sqnc_num"], false)
}

fn values() -> ChildKind {
    child("claim_vals", VAL, "v2_mdcr_clm_val", &["clm_val_sqnc_num"], false)
}

fn related_conditions() -> ChildKind {
    let mut kind = child(
        "claim_related_conditions",
        RLT_COND,
        "v2_mdcr_clm_rlt_cond_sgntr_mbr",
        &["clm_rlt_cond_cd", "clm_rlt_cond_sgntr_sqnc_num"],
        false,
    );
    kind.join_keys = vec!["clm_rlt_cond_sgntr_sk".into()];
    // 0 and 1 are placeholder signatures
    kind.parent_filter = Some(Predicate::InList {
        expr: Expr::col(ALIAS_CLM, "clm_rlt_cond_sgntr_sk"),
        list: vec![Expr::Int(0), Expr::Int(1)],
        negated: true,
    });
    kind
}

fn item_scope() -> ClaimScope {
    ClaimScope {
        cte_columns: vec![
            "clm_uniq_id".into(),
            "geo_bene_sk".into(),
            "clm_type_cd".into(),
            "clm_num_sk".into(),
            "clm_dt_sgntr_sk".into(),
            "clm_rlt_cond_sgntr_sk".into(),
            "clm_idr_ld_dt".into(),
        ],
        min_transaction_date: true,
        filter_outer: false,
    }
}

fn item_keys() -> Vec<FieldSpec> {
    vec![
        FieldSpec::int("clm_uniq_id").alias(ALIAS_CLM).pk().batch_id().last_updated_key(),
        FieldSpec::int("bfd_row_id").alias(CLM_GRP).pk(),
        FieldSpec::date("clm_idr_ld_dt").alias(ALIAS_CLM).historical_ts().insert_excluded(),
    ]
}

fn sub_line_join(model: TableModel, alias: &str, table: &str) -> TableModel {
    model.join(JoinType::Left, Relation::table(&source_table(table), alias), keys_eq(alias, LINE, &LINE_KEYS))
}

fn claim_item_institutional() -> TableModel {
    let model = TableModel::new(
        "idr.claim_item_institutional",
        TableFamily::Institutional,
        LoadStrategy::Incremental,
        Relation::table("claims", ALIAS_CLM),
    )
    .fields(item_keys())
    .fields(vec![
        FieldSpec::int("clm_line_num").alias(LINE),
        FieldSpec::float("clm_line_sbmt_chrg_amt").alias(LINE),
        FieldSpec::float("clm_line_cvrd_pd_amt").alias(LINE),
        FieldSpec::text("clm_line_hcpcs_cd").alias(LINE).transform(Transform::DefaultString),
        FieldSpec::text("clm_line_rev_ctr_cd").alias(LINE).transform(Transform::DefaultString),
        FieldSpec::float("clm_line_srvc_unit_qty").alias(LINE),
    ])
    .fields(relation_timestamps(LINE, "line", false))
    .fields(vec![
        FieldSpec::int("clm_val_sqnc_num_prod").alias(PROD).column("clm_val_sqnc_num"),
        FieldSpec::text("clm_prod_type_cd").alias(PROD).transform(Transform::NullString),
        FieldSpec::text("clm_dgns_prcdr_icd_ind").alias(PROD).transform(Transform::DefaultString),
        FieldSpec::text("clm_dgns_cd").alias(PROD).transform(Transform::DefaultString),
        FieldSpec::text("clm_prcdr_cd").alias(PROD).transform(Transform::DefaultString),
        FieldSpec::date("clm_prcdr_prfrm_dt").alias(PROD).transform(Transform::DefaultDateToNull),
        FieldSpec::text("clm_poa_ind").alias(PROD).transform(Transform::DefaultString),
    ])
    .fields(relation_timestamps(PROD, "prod", false))
    .fields(vec![
        FieldSpec::int("clm_val_sqnc_num_val").alias(VAL).column("clm_val_sqnc_num"),
        FieldSpec::text("clm_val_cd").alias(VAL).transform(Transform::DefaultString),
        FieldSpec::float("clm_val_amt").alias(VAL),
    ])
    .fields(relation_timestamps(VAL, "val", false))
    .fields(vec![
        FieldSpec::int("clm_rlt_cond_sgntr_sqnc_num").alias(RLT_COND),
        FieldSpec::text("clm_rlt_cond_cd").alias(RLT_COND).transform(Transform::DefaultString),
    ])
    .fields(relation_timestamps(RLT_COND, "rlt_cond", false))
    .fields(vec![
        FieldSpec::text("clm_rev_apc_hipps_cd").alias("line_instnl").transform(Transform::DefaultHippsCode),
        FieldSpec::text("clm_otaf_one_ind_cd").alias("line_instnl").transform(Transform::DefaultString),
        FieldSpec::float("clm_rev_cntr_tdapa_amt").alias("line_instnl"),
        FieldSpec::text("clm_line_pa_uniq_trkng_num").alias("line_dcmtn").transform(Transform::NullString),
        FieldSpec::text("clm_line_fiss_rev_dt_ind").alias("line_fiss").transform(Transform::DefaultAndZeroString),
        FieldSpec::float("clm_bnft_svg_amt").alias("line_fiss_bnft").column("clm_line_fiss_bnft_svg_amt"),
    ])
    .fields(relation_timestamps("line_instnl", "line_instnl", false))
    .claim_scope(item_scope())
    .alignment(AlignmentSpec {
        parent_key: "clm_uniq_id".into(),
        slot_column: "bfd_row_id".into(),
        group_cte: "claim_groups".into(),
        group_alias: CLM_GRP.into(),
        kinds: vec![lines(), procedures(), values(), related_conditions()],
    })
    .last_updated(CLAIM_INSTITUTIONAL_TABLE, &[CLAIM_UPDATED_COLUMN]);
    let model = sub_line_join(model, "line_instnl", "v2_mdcr_clm_line_instnl");
    let model = sub_line_join(model, "line_dcmtn", "v2_mdcr_clm_line_dcmtn");
    let model = sub_line_join(model, "line_fiss", "v2_mdcr_clm_line_fiss");
    sub_line_join(model, "line_fiss_bnft", "v2_mdcr_clm_line_fiss_bnft_svg")
}

fn claim_item_professional() -> TableModel {
    let model = TableModel::new(
        "idr.claim_item_professional",
        TableFamily::Professional,
        LoadStrategy::Incremental,
        Relation::table("claims", ALIAS_CLM),
    )
    .fields(item_keys())
    .fields(vec![
        FieldSpec::int("clm_line_num").alias(LINE),
        FieldSpec::float("clm_line_sbmt_chrg_amt").alias(LINE),
        FieldSpec::float("clm_line_alowd_chrg_amt").alias(LINE),
        FieldSpec::text("clm_line_dgns_cd").alias(LINE).transform(Transform::NullString),
        FieldSpec::date("clm_line_from_dt").alias(LINE).transform(Transform::DefaultDateToNull),
        FieldSpec::date("clm_line_thru_dt").alias(LINE).transform(Transform::DefaultDateToNull),
        FieldSpec::text("clm_line_hcpcs_cd").alias(LINE).transform(Transform::DefaultString),
        FieldSpec::text("clm_line_ndc_cd").alias(LINE).transform(Transform::DefaultString),
        FieldSpec::text("clm_pos_cd").alias(LINE).transform(Transform::DefaultString),
    ])
    .fields(relation_timestamps(LINE, "line", false))
    .fields(vec![
        FieldSpec::int("clm_val_sqnc_num_prod").alias(PROD).column("clm_val_sqnc_num"),
        FieldSpec::text("clm_prod_type_cd").alias(PROD).transform(Transform::NullString),
        FieldSpec::text("clm_dgns_prcdr_icd_ind").alias(PROD).transform(Transform::DefaultString),
        FieldSpec::text("clm_dgns_cd").alias(PROD).transform(Transform::DefaultString),
        FieldSpec::text("clm_poa_ind").alias(PROD).transform(Transform::DefaultString),
    ])
    .fields(relation_timestamps(PROD, "prod", false))
    .fields(vec![
        FieldSpec::text("clm_fed_type_srvc_cd").alias("line_prfnl").transform(Transform::DefaultString),
        FieldSpec::text("clm_prvdr_spclty_cd").alias("line_prfnl").transform(Transform::DefaultString),
        FieldSpec::float("clm_line_prfnl_dme_price_amt").alias("line_prfnl"),
        FieldSpec::text("clm_line_rbndlg_crtfctn_num").alias("line_mcs").transform(Transform::DefaultString),
        FieldSpec::int("clm_line_hct_lvl_num").alias("line_mcs"),
        FieldSpec::text("clm_line_pa_uniq_trkng_num").alias("line_dcmtn").transform(Transform::NullString),
    ])
    .fields(relation_timestamps("line_prfnl", "line_prfnl", false))
    .fields(provider_fields("prvdr_rndrng", "prvdr_rndrng"))
    .claim_scope(item_scope())
    .alignment(AlignmentSpec {
        parent_key: "clm_uniq_id".into(),
        slot_column: "bfd_row_id".into(),
        group_cte: "claim_groups".into(),
        group_alias: CLM_GRP.into(),
        kinds: vec![lines(), procedures()],
    })
    .last_updated(CLAIM_PROFESSIONAL_TABLE, &[CLAIM_UPDATED_COLUMN]);
    let model = sub_line_join(model, "line_prfnl", "v2_mdcr_clm_line_prfnl");
    let model = sub_line_join(model, "line_mcs", "v2_mdcr_clm_line_mcs");
    let model = sub_line_join(model, "line_dcmtn", "v2_mdcr_clm_line_dcmtn");
    model.join(
        JoinType::Left,
        Relation::table(&source_table("v2_mdcr_prvdr_hstry"), "prvdr_rndrng"),
        provider_join("prvdr_rndrng", Expr::col(LINE, "prvdr_rndrng_prvdr_npi_num")),
    )
}

fn contracts_cte() -> Cte {
    let select = Select::from(Relation::table(&source_table("v2_mdcr_cntrct_pbp_num"), "c"))
        .item(SelectItem::new(Expr::col("c", "cntrct_pbp_name")))
        .item(SelectItem::new(Expr::col("c", "cntrct_num")))
        .item(SelectItem::new(Expr::col("c", "cntrct_pbp_num")))
        .item(SelectItem::aliased(
            Expr::Window {
                func: WindowFunc::Rank,
                partition_by: vec![Expr::col("c", "cntrct_num"), Expr::col("c", "cntrct_pbp_num")],
                order_by: vec![OrderBy::desc(Expr::col("c", "cntrct_pbp_sk_obslt_dt"))],
            },
            "contract_version_rank",
        ));
    Cte { name: "contracts".into(), query: Query::Select(Box::new(select)), not_materialized: false }
}

fn claim_rx() -> TableModel {
    let model = TableModel::new(
        CLAIM_RX_TABLE,
        TableFamily::Prescription,
        LoadStrategy::Incremental,
        Relation::table(CLAIM_TABLE, ALIAS_CLM),
    )
    .fields(vec![
        FieldSpec::int("clm_uniq_id").alias(ALIAS_CLM).pk().batch_id().last_updated_key(),
        FieldSpec::int("clm_type_cd").alias(ALIAS_CLM),
        FieldSpec::int("bene_sk").alias(ALIAS_CLM),
        FieldSpec::text("clm_cntl_num").alias(ALIAS_CLM),
        FieldSpec::date("clm_from_dt").alias(ALIAS_CLM),
        FieldSpec::date("clm_thru_dt").alias(ALIAS_CLM),
        FieldSpec::text("clm_ltst_clm_ind").alias(ALIAS_CLM),
        FieldSpec::text("clm_sbmtr_cntrct_num").alias(ALIAS_CLM).transform(Transform::DefaultString),
        FieldSpec::text("clm_sbmtr_cntrct_pbp_num").alias(ALIAS_CLM).transform(Transform::DefaultString),
        FieldSpec::float("clm_othr_tp_pd_amt").alias(ALIAS_CLM),
        FieldSpec::timestamp("idr_insrt_ts")
            .alias(ALIAS_CLM)
            .batch_ts()
            .insert_excluded()
            .transform(Transform::NullDateToMin),
        FieldSpec::timestamp("idr_updt_ts")
            .alias(ALIAS_CLM)
            .update_ts()
            .insert_excluded()
            .transform(Transform::NullDateToMin),
        FieldSpec::date("clm_idr_ld_dt").alias(ALIAS_CLM).historical_ts().insert_excluded(),
        FieldSpec::date("clm_submsn_dt").alias(SGNTR).transform(Transform::DefaultDateToNull),
        FieldSpec::float("clm_line_cvrd_pd_amt").alias(LINE),
        FieldSpec::text("clm_line_ndc_cd").alias(LINE).transform(Transform::DefaultString),
        FieldSpec::float("clm_line_ndc_qty").alias(LINE),
        FieldSpec::text("clm_line_rx_num").alias(LINE).transform(Transform::DefaultString),
        FieldSpec::text("clm_brnd_gnrc_cd").alias("rx_line").transform(Transform::DefaultString),
        FieldSpec::text("clm_dspnsng_stus_cd").alias("rx_line").transform(Transform::DefaultString),
        FieldSpec::int("clm_line_days_suply_qty").alias("rx_line"),
        FieldSpec::text("cntrct_pbp_name").alias("pbp_num").transform(Transform::NullString),
    ])
    .fields(provider_fields("prvdr_srvc", "prvdr_srvc"))
    .fields(provider_fields("prvdr_prscrbng", "prvdr_prscrbng"))
    .claim_scope(ClaimScope { cte_columns: vec![], min_transaction_date: false, filter_outer: true })
    .cte(contracts_cte())
    .last_updated(CLAIM_RX_TABLE, &[CLAIM_UPDATED_COLUMN]);
    signature_join(model)
        .join(JoinType::Inner, Relation::table(&source_table("v2_mdcr_clm_line"), LINE), keys_eq(ALIAS_CLM, LINE, &CLAIM_KEYS))
        .join(
            JoinType::Left,
            Relation::table(&source_table("v2_mdcr_clm_line_rx"), "rx_line"),
            keys_eq(ALIAS_CLM, "rx_line", &CLAIM_KEYS),
        )
        .join(
            JoinType::Left,
            Relation::table(&source_table("v2_mdcr_prvdr_hstry"), "prvdr_srvc"),
            provider_join("prvdr_srvc", Expr::col(ALIAS_CLM, "prvdr_srvc_prvdr_npi_num")),
        )
        .join(
            JoinType::Left,
            Relation::table(&source_table("v2_mdcr_prvdr_hstry"), "prvdr_prscrbng"),
            provider_join("prvdr_prscrbng", Expr::col(ALIAS_CLM, "prvdr_prscrbng_prvdr_npi_num")),
        )
        .join(
            JoinType::Left,
            Relation::table("contracts", "pbp_num"),
            Predicate::and(vec![
                Expr::col("pbp_num", "cntrct_num").eq(Expr::col(ALIAS_CLM, "clm_sbmtr_cntrct_num")),
                Expr::col("pbp_num", "cntrct_pbp_num").eq(Expr::col(ALIAS_CLM, "clm_sbmtr_cntrct_pbp_num")),
                Expr::col("pbp_num", "contract_version_rank").eq(Expr::Int(1)),
            ]),
        )
}

pub(super) fn models() -> Vec<TableModel> {
    vec![claim_institutional(), claim_professional(), claim_item_institutional(), claim_item_professional(), claim_rx()]
}
