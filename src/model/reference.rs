//! Contract reference data and provider history.

use crate::sql::{Cte, Expr, JoinType, OrderBy, Predicate, Query, Relation, Select, SelectItem, WindowFunc};

use super::beneficiary::not_obsolete;
use super::transform::Transform;
use super::{source_table, FieldSpec, LoadStrategy, TableFamily, TableModel};

const PBP_NUM: &str = "pbp_num";
const PRVDR: &str = "prvdr";
const CNTCT: &str = "cntct";

// META keys encode a date as (YYYYMMDD - 19000000) * 1000 + sequence.
// meta_sk = 501 marks rows whose real insert date lives in meta_lst_updt_sk.
const META_INSERT_TS: &str = "CASE WHEN prvdr.meta_sk = 501 \
THEN TO_DATE(TRUNC(prvdr.meta_lst_updt_sk / 1000 + 19000000)::text, 'YYYYMMDD')::timestamp \
ELSE TO_DATE(TRUNC(prvdr.meta_sk / 1000 + 19000000)::text, 'YYYYMMDD')::timestamp END";
const META_UPDATE_TS: &str = "CASE WHEN prvdr.meta_sk != 501 AND prvdr.meta_lst_updt_sk > 0 \
THEN TO_DATE(TRUNC(prvdr.meta_lst_updt_sk / 1000 + 19000000)::text, 'YYYYMMDD')::timestamp \
ELSE NULL END";

fn segment_cte() -> Cte {
    // segments that map to exactly one plan
    let mut select = Select::from(Relation::table(&source_table("v2_mdcr_cntrct_pbp_sgmt"), "s"))
        .item(SelectItem::new(Expr::col("s", "cntrct_pbp_sk")))
        .item(SelectItem::new(Expr::col("s", "cntrct_pbp_sgmt_num")));
    select.group_by = vec![Expr::col("s", "cntrct_pbp_sk"), Expr::col("s", "cntrct_pbp_sgmt_num")];
    select.having = Some(Predicate::raw("COUNT(*) = 1"));
    Cte { name: "sgmt".into(), query: Query::Select(Box::new(select)), not_materialized: false }
}

fn contract_pbp_number() -> TableModel {
    // Obsolete plan rows are kept: enrollments still point at them. Readers pick rank 1.
    TableModel::new(
        "idr.contract_pbp_number",
        TableFamily::Reference,
        LoadStrategy::FullRefresh,
        Relation::table(&source_table("v2_mdcr_cntrct_pbp_num"), PBP_NUM),
    )
    .fields(vec![
        FieldSpec::int("cntrct_pbp_sk").alias(PBP_NUM).pk().batch_id(),
        FieldSpec::text("cntrct_drug_plan_ind_cd").alias(PBP_NUM).transform(Transform::DefaultString),
        FieldSpec::text("cntrct_pbp_type_cd").alias(PBP_NUM).transform(Transform::DefaultString),
        FieldSpec::text("cntrct_pbp_name").alias(PBP_NUM).transform(Transform::NullString),
        FieldSpec::text("cntrct_num").alias(PBP_NUM).transform(Transform::DefaultString),
        FieldSpec::text("cntrct_pbp_num").alias(PBP_NUM).transform(Transform::DefaultString),
        FieldSpec::text("cntrct_pbp_sgmt_num").alias("sgmt").transform(Transform::DefaultString),
        FieldSpec::int("bfd_contract_version_rank").derived(),
    ])
    .cte(segment_cte())
    .join(
        JoinType::Left,
        Relation::table("sgmt", "sgmt"),
        Expr::col(PBP_NUM, "cntrct_pbp_sk").eq(Expr::col("sgmt", "cntrct_pbp_sk")),
    )
    .static_filter(Expr::col(PBP_NUM, "cntrct_pbp_sk").ne(Expr::Int(0)))
    .derive(
        "bfd_contract_version_rank",
        Expr::Window {
            func: WindowFunc::Rank,
            partition_by: vec![Expr::col(PBP_NUM, "cntrct_num"), Expr::col(PBP_NUM, "cntrct_pbp_num")],
            order_by: vec![OrderBy::desc(Expr::col(PBP_NUM, "cntrct_pbp_sk_obslt_dt"))],
        },
    )
}

fn contact_cte() -> Cte {
    // one contact per plan: earliest upcoming period, customer service (62) before general (30)
    let contact_rank = Expr::raw(
        "CASE WHEN cntct.cntrct_plan_cntct_type_cd = '62' THEN 1 \
         WHEN cntct.cntrct_plan_cntct_type_cd = '30' THEN 2 ELSE 3 END",
    );
    let select = Select::from(Relation::table(&source_table("v2_mdcr_cntrct_pbp_cntct"), CNTCT))
        .item(SelectItem::new(Expr::Star(CNTCT.into())))
        .item(SelectItem::aliased(
            Expr::Window {
                func: WindowFunc::RowNumber,
                partition_by: vec![Expr::col(CNTCT, "cntrct_pbp_sk")],
                order_by: vec![OrderBy::asc(Expr::col(CNTCT, "cntrct_pbp_bgn_dt")), OrderBy::asc(contact_rank)],
            },
            "row_order",
        ))
        .filter(not_obsolete(CNTCT, "cntrct_plan_cntct_obslt_dt"))
        .filter(Expr::col(CNTCT, "cntrct_pbp_bgn_dt").ge(Expr::raw("DATE_TRUNC('MONTH', CURRENT_DATE)")))
        .filter(Expr::col(CNTCT, "cntrct_pbp_bgn_dt").lt(Expr::col(CNTCT, "cntrct_pbp_end_dt")));
    Cte { name: "contract_contacts".into(), query: Query::Select(Box::new(select)), not_materialized: false }
}

fn contract_pbp_contact() -> TableModel {
    let text = |name: &str, t: Transform| FieldSpec::text(name).alias(CNTCT).transform(t);
    TableModel::new(
        "idr.contract_pbp_contact",
        TableFamily::Reference,
        LoadStrategy::FullRefresh,
        Relation::table("contract_contacts", CNTCT),
    )
    .fields(vec![
        FieldSpec::int("cntrct_pbp_sk").alias(CNTCT).pk().batch_id(),
        FieldSpec::date("cntrct_plan_cntct_obslt_dt").alias(CNTCT),
        text("cntrct_plan_cntct_type_cd", Transform::DefaultString),
        text("cntrct_plan_free_extnsn_num", Transform::DefaultString),
        text("cntrct_plan_cntct_free_num", Transform::DefaultString),
        text("cntrct_plan_cntct_extnsn_num", Transform::DefaultString),
        text("cntrct_plan_cntct_tel_num", Transform::NullString),
        FieldSpec::date("cntrct_pbp_end_dt").alias(CNTCT),
        FieldSpec::date("cntrct_pbp_bgn_dt").alias(CNTCT),
        text("cntrct_plan_cntct_st_1_adr", Transform::NullString),
        text("cntrct_plan_cntct_st_2_adr", Transform::NullString),
        text("cntrct_plan_cntct_city_name", Transform::DefaultString),
        text("cntrct_plan_cntct_state_cd", Transform::DefaultString),
        text("cntrct_plan_cntct_zip_cd", Transform::DefaultString),
    ])
    .cte(contact_cte())
    .static_filter(Expr::col(CNTCT, "row_order").eq(Expr::Int(1)))
}

fn provider_history() -> TableModel {
    TableModel::new(
        "idr.provider_history",
        TableFamily::Provider,
        LoadStrategy::Incremental,
        Relation::table(&source_table("v2_mdcr_prvdr_hstry"), PRVDR),
    )
    .fields(vec![
        FieldSpec::text("prvdr_npi_num").alias(PRVDR).pk(),
        FieldSpec::int("prvdr_sk").alias(PRVDR).batch_id(),
        FieldSpec::timestamp("prvdr_hstry_efctv_dt").alias(PRVDR),
        FieldSpec::text("prvdr_mdl_name").alias(PRVDR).transform(Transform::NullString),
        FieldSpec::text("prvdr_type_cd").alias(PRVDR).transform(Transform::DefaultString),
        FieldSpec::text("prvdr_txnmy_cmpst_cd").alias(PRVDR).transform(Transform::DefaultString),
        FieldSpec::text("prvdr_oscar_num").alias(PRVDR).transform(Transform::DefaultString),
        FieldSpec::text("prvdr_1st_name").alias(PRVDR).transform(Transform::NullString),
        FieldSpec::text("prvdr_name").alias(PRVDR).transform(Transform::NullString),
        FieldSpec::date("prvdr_hstry_obslt_dt").alias(PRVDR).transform(Transform::NullDateToMax),
        FieldSpec::text("prvdr_lgl_name").alias(PRVDR).transform(Transform::NullString),
        FieldSpec::text("prvdr_emplr_id_num").alias(PRVDR).transform(Transform::NullString),
        FieldSpec::text("prvdr_last_name").alias(PRVDR).transform(Transform::NullString),
        FieldSpec::timestamp("idr_insrt_ts").derived().batch_ts().transform(Transform::NullDateToMin),
        FieldSpec::timestamp("idr_updt_ts").derived().update_ts().transform(Transform::NullDateToMin),
    ])
    .static_filter(not_obsolete(PRVDR, "prvdr_hstry_obslt_dt"))
    .derive("idr_insrt_ts", Expr::raw(META_INSERT_TS))
    .derive("idr_updt_ts", Expr::raw(META_UPDATE_TS))
}

pub(super) fn models() -> Vec<TableModel> {
    vec![contract_pbp_number(), contract_pbp_contact(), provider_history()]
}
