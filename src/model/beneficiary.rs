//! Beneficiary tables. All of them stamp the `idr.beneficiary` parent row on incremental loads.

use crate::sql::{Cte, Expr, JoinType, OrderBy, Predicate, Query, Relation, Select, SelectItem, WindowFunc};
use crate::value::SqlValue;

use super::transform::{Transform, DEFAULT_MAX_DATE};
use super::{source_table, FieldSpec, LoadStrategy, TableFamily, TableModel};

pub const BENEFICIARY_TABLE: &str = "idr.beneficiary";

const PART_AB_COVERAGE: &[&str] = &["bfd_part_a_coverage_updated_ts", "bfd_part_b_coverage_updated_ts"];
const PART_D_COVERAGE: &[&str] = &["bfd_part_d_coverage_updated_ts"];

const HSTRY: &str = "hstry";
const XREF: &str = "xref";

/// `{alias}.{column} >= '9999-12-31'`: current records only.
pub(super) fn not_obsolete(alias: &str, column: &str) -> Predicate {
    Expr::col(alias, column).ge(Expr::Param(SqlValue::Date(DEFAULT_MAX_DATE)))
}

/// Transaction columns shared by the per-beneficiary history tables. Tables that only
/// keep current rows do not key on the effective timestamp.
fn transaction_fields(alias: &str, keyed: bool) -> Vec<FieldSpec> {
    let efctv = FieldSpec::timestamp("idr_trans_efctv_ts").alias(alias);
    vec![
        FieldSpec::text("idr_ltst_trans_flg").alias(alias).transform(Transform::NullString),
        if keyed { efctv.pk() } else { efctv },
        FieldSpec::timestamp("idr_trans_obslt_ts").alias(alias),
        FieldSpec::timestamp("idr_insrt_ts").alias(alias).batch_ts(),
        FieldSpec::timestamp("idr_updt_ts").alias(alias).update_ts().transform(Transform::NullDateToMin),
    ]
}

fn current_xref_ctes() -> Vec<Cte> {
    // Several xref rows can exist per pair; keep the most recently updated one.
    let ordered = Select::from(Relation::table(&source_table("v2_mdcr_bene_xref"), "x"))
        .item(SelectItem::new(Expr::col("x", "bene_sk")))
        .item(SelectItem::new(Expr::col("x", "bene_xref_sk")))
        .item(SelectItem::new(Expr::col("x", "bene_hicn_num")))
        .item(SelectItem::new(Expr::col("x", "src_rec_crte_ts")))
        .item(SelectItem::aliased(
            Expr::Window {
                func: WindowFunc::RowNumber,
                partition_by: vec![Expr::col("x", "bene_sk"), Expr::col("x", "bene_xref_sk")],
                order_by: vec![OrderBy::desc(Expr::col("x", "src_rec_updt_ts"))],
            },
            "row_order",
        ));

    let key = |c: &str| Expr::col("bx", c).eq(Expr::col("ox", c));
    let current = Select::from(Relation::table("ordered_xref", "ox"))
        .item(SelectItem::new(Expr::col("ox", "bene_sk")))
        .item(SelectItem::new(Expr::col("ox", "bene_xref_sk")))
        .item(SelectItem::new(Expr::col("bx", "bene_kill_cred_cd")))
        .item(SelectItem::new(Expr::col("bx", "src_rec_updt_ts")))
        .item(SelectItem::new(Expr::col("bx", "idr_insrt_ts")))
        .item(SelectItem::new(Expr::col("bx", "idr_updt_ts")))
        .join(
            JoinType::Inner,
            Relation::table(&source_table("v2_mdcr_bene_xref"), "bx"),
            Predicate::and(vec![key("bene_sk"), key("bene_xref_sk"), key("bene_hicn_num"), key("src_rec_crte_ts")]),
        )
        .filter(Expr::col("ox", "row_order").eq(Expr::Int(1)));

    vec![
        Cte { name: "ordered_xref".into(), query: Query::Select(Box::new(ordered)), not_materialized: false },
        Cte { name: "current_xref".into(), query: Query::Select(Box::new(current)), not_materialized: false },
    ]
}

fn beneficiary() -> TableModel {
    let mut model = TableModel::new(
        BENEFICIARY_TABLE,
        TableFamily::Beneficiary,
        LoadStrategy::Incremental,
        Relation::table(&source_table("v2_mdcr_bene_hstry"), HSTRY),
    )
    .fields(vec![
        FieldSpec::int("bene_sk").alias(HSTRY).pk().batch_id().last_updated_key(),
        FieldSpec::int("bene_xref_efctv_sk").alias(HSTRY),
        FieldSpec::text("bene_mbi_id").alias(HSTRY),
        FieldSpec::text("bene_1st_name").alias(HSTRY),
        FieldSpec::text("bene_midl_name").alias(HSTRY).transform(Transform::NullString),
        FieldSpec::text("bene_last_name").alias(HSTRY),
        FieldSpec::date("bene_brth_dt").alias(HSTRY),
        FieldSpec::date("bene_death_dt").alias(HSTRY).transform(Transform::NullDateToMax),
        FieldSpec::text("bene_vrfy_death_day_sw").alias(HSTRY).transform(Transform::DefaultString),
        FieldSpec::text("bene_sex_cd").alias(HSTRY),
        FieldSpec::text("bene_race_cd").alias(HSTRY).transform(Transform::DefaultString),
        FieldSpec::text("geo_usps_state_cd").alias(HSTRY).transform(Transform::DefaultString),
        FieldSpec::text("geo_zip5_cd").alias(HSTRY).transform(Transform::DefaultString),
        FieldSpec::text("geo_zip_plc_name").alias(HSTRY).transform(Transform::DefaultString),
        FieldSpec::text("bene_line_1_adr").alias(HSTRY).transform(Transform::NullString),
        FieldSpec::text("bene_line_2_adr").alias(HSTRY).transform(Transform::NullString),
        FieldSpec::text("bene_line_3_adr").alias(HSTRY).transform(Transform::NullString),
        FieldSpec::text("bene_line_4_adr").alias(HSTRY).transform(Transform::NullString),
        FieldSpec::text("bene_line_5_adr").alias(HSTRY).transform(Transform::NullString),
        FieldSpec::text("bene_line_6_adr").alias(HSTRY).transform(Transform::NullString),
        FieldSpec::text("cntct_lang_cd").alias(HSTRY).transform(Transform::DefaultString),
        FieldSpec::text("idr_ltst_trans_flg").alias(HSTRY).transform(Transform::NullString),
        FieldSpec::timestamp("idr_trans_efctv_ts").alias(HSTRY).pk(),
        FieldSpec::timestamp("idr_trans_obslt_ts").alias(HSTRY),
        FieldSpec::timestamp("idr_insrt_ts_bene").alias(HSTRY).column("idr_insrt_ts").batch_ts(),
        FieldSpec::timestamp("idr_updt_ts_bene")
            .alias(HSTRY)
            .column("idr_updt_ts")
            .update_ts()
            .transform(Transform::NullDateToMin),
        FieldSpec::text("bene_kill_cred_cd").alias(XREF).transform(Transform::DefaultString),
        FieldSpec::timestamp("src_rec_updt_ts").alias(XREF).transform(Transform::NullDateToMin),
        FieldSpec::timestamp("idr_insrt_ts_xref")
            .alias(XREF)
            .column("idr_insrt_ts")
            .batch_ts()
            .transform(Transform::NullDateToMin),
        FieldSpec::timestamp("idr_updt_ts_xref")
            .alias(XREF)
            .column("idr_updt_ts")
            .update_ts()
            .transform(Transform::NullDateToMin),
    ])
    // xref mirrors bene_sk and bene_xref_sk
    .join(
        JoinType::Left,
        Relation::table("current_xref", XREF),
        Predicate::and(vec![
            Expr::col(XREF, "bene_sk").eq(Expr::col(HSTRY, "bene_xref_sk")),
            Expr::col(XREF, "bene_xref_sk").eq(Expr::col(HSTRY, "bene_sk")),
        ]),
    )
    .static_filter(Predicate::IsNull { expr: Expr::col(HSTRY, "bene_mbi_id"), negated: true })
    .deceased_key(Expr::col(HSTRY, "bene_sk"))
    .computed_key("bene_xref_efctv_sk_computed")
    .last_updated(BENEFICIARY_TABLE, &["bfd_patient_updated_ts"]);
    for cte in current_xref_ctes() {
        model = model.cte(cte);
    }
    model
}

fn beneficiary_mbi_id() -> TableModel {
    TableModel::new(
        "idr.beneficiary_mbi_id",
        TableFamily::Beneficiary,
        LoadStrategy::Incremental,
        Relation::table(&source_table("v2_mdcr_bene_mbi_id"), "mbi"),
    )
    .fields(vec![
        FieldSpec::text("bene_mbi_id").alias("mbi").pk().last_updated_key(),
        FieldSpec::date("bene_mbi_efctv_dt").alias("mbi"),
        FieldSpec::date("bene_mbi_obslt_dt").alias("mbi").transform(Transform::NullDateToMax),
    ])
    .fields(transaction_fields("mbi", true))
    .last_updated(BENEFICIARY_TABLE, &["bfd_patient_updated_ts"])
}

fn beneficiary_overshare_mbi() -> TableModel {
    // MBIs shared by several bene_sk without a CME-backed xref are withheld.
    let trusted_xref = Select::from(Relation::table(&source_table("v2_mdcr_bene_xref"), XREF))
        .item(SelectItem::new(Expr::Int(1)))
        .filter(Expr::col(HSTRY, "bene_xref_efctv_sk").eq(Expr::col(XREF, "bene_sk")))
        .filter(Expr::col(HSTRY, "bene_sk").eq(Expr::col(XREF, "bene_xref_sk")))
        .filter(Expr::col(XREF, "bene_kill_cred_cd").eq(Expr::Str("2".into())));
    let mut model = TableModel::new(
        "idr.beneficiary_overshare_mbi",
        TableFamily::Beneficiary,
        LoadStrategy::Replace,
        Relation::table(&source_table("v2_mdcr_bene_hstry"), HSTRY),
    )
    .fields(vec![FieldSpec::text("bene_mbi_id").alias(HSTRY).pk()])
    .static_filter(Predicate::Exists { subquery: Box::new(trusted_xref), negated: true })
    .static_filter(Predicate::IsNull { expr: Expr::col(HSTRY, "bene_mbi_id"), negated: true });
    model.group_by = vec![Expr::col(HSTRY, "bene_mbi_id")];
    model.having = Some(Predicate::raw("COUNT(DISTINCT hstry.bene_sk) > 1"));
    model
}

fn beneficiary_third_party() -> TableModel {
    TableModel::new(
        "idr.beneficiary_third_party",
        TableFamily::Beneficiary,
        LoadStrategy::Incremental,
        Relation::table(&source_table("v2_mdcr_bene_tp"), "tp"),
    )
    .fields(vec![
        FieldSpec::int("bene_sk").alias("tp").pk().batch_id().last_updated_key(),
        FieldSpec::text("bene_buyin_cd").alias("tp").transform(Transform::DefaultString),
        FieldSpec::text("bene_tp_type_cd").alias("tp").pk(),
        FieldSpec::date("bene_rng_bgn_dt").alias("tp").pk(),
        FieldSpec::date("bene_rng_end_dt").alias("tp").pk(),
    ])
    .fields(transaction_fields("tp", true))
    .deceased_key(Expr::col("tp", "bene_sk"))
    .last_updated(BENEFICIARY_TABLE, PART_AB_COVERAGE)
}

fn beneficiary_status() -> TableModel {
    TableModel::new(
        "idr.beneficiary_status",
        TableFamily::Beneficiary,
        LoadStrategy::Incremental,
        Relation::table(&source_table("v2_mdcr_bene_mdcr_stus"), "stus"),
    )
    .fields(vec![
        FieldSpec::int("bene_sk").alias("stus").pk().batch_id().last_updated_key(),
        FieldSpec::text("bene_mdcr_stus_cd").alias("stus"),
        FieldSpec::date("mdcr_stus_bgn_dt").alias("stus").pk(),
        FieldSpec::date("mdcr_stus_end_dt").alias("stus").pk(),
    ])
    .fields(transaction_fields("stus", true))
    .deceased_key(Expr::col("stus", "bene_sk"))
    .static_filter(not_obsolete("stus", "idr_trans_obslt_ts"))
    .last_updated(BENEFICIARY_TABLE, PART_AB_COVERAGE)
}

fn beneficiary_entitlement() -> TableModel {
    TableModel::new(
        "idr.beneficiary_entitlement",
        TableFamily::Beneficiary,
        LoadStrategy::Incremental,
        Relation::table(&source_table("v2_mdcr_bene_mdcr_entlmt"), "entlmt"),
    )
    .fields(vec![
        FieldSpec::int("bene_sk").alias("entlmt").pk().batch_id().last_updated_key(),
        FieldSpec::date("bene_rng_bgn_dt").alias("entlmt").pk(),
        FieldSpec::date("bene_rng_end_dt").alias("entlmt").pk(),
        FieldSpec::text("bene_mdcr_entlmt_type_cd").alias("entlmt").pk(),
        FieldSpec::text("bene_mdcr_entlmt_stus_cd").alias("entlmt"),
        FieldSpec::text("bene_mdcr_enrlmt_rsn_cd").alias("entlmt").transform(Transform::DefaultString),
    ])
    .fields(transaction_fields("entlmt", true))
    .deceased_key(Expr::col("entlmt", "bene_sk"))
    .last_updated(BENEFICIARY_TABLE, PART_AB_COVERAGE)
}

fn beneficiary_entitlement_reason() -> TableModel {
    TableModel::new(
        "idr.beneficiary_entitlement_reason",
        TableFamily::Beneficiary,
        LoadStrategy::Incremental,
        Relation::table(&source_table("v2_mdcr_bene_mdcr_entlmt_rsn"), "rsn"),
    )
    .fields(vec![
        FieldSpec::int("bene_sk").alias("rsn").pk().batch_id().last_updated_key(),
        FieldSpec::date("bene_rng_bgn_dt").alias("rsn").pk(),
        FieldSpec::date("bene_rng_end_dt").alias("rsn").pk(),
        FieldSpec::text("bene_mdcr_entlmt_rsn_cd").alias("rsn"),
    ])
    .fields(transaction_fields("rsn", true))
    .deceased_key(Expr::col("rsn", "bene_sk"))
    .last_updated(BENEFICIARY_TABLE, PART_AB_COVERAGE)
}

fn beneficiary_dual_eligibility() -> TableModel {
    TableModel::new(
        "idr.beneficiary_dual_eligibility",
        TableFamily::Beneficiary,
        LoadStrategy::Incremental,
        Relation::table(&source_table("v2_mdcr_bene_cmbnd_dual_mdcr"), "dual"),
    )
    .fields(vec![
        FieldSpec::int("bene_sk").alias("dual").pk().batch_id().last_updated_key(),
        FieldSpec::date("bene_mdcd_elgblty_bgn_dt").alias("dual").pk(),
        FieldSpec::date("bene_mdcd_elgblty_end_dt").alias("dual"),
        FieldSpec::text("bene_dual_stus_cd").alias("dual"),
        FieldSpec::text("bene_dual_type_cd").alias("dual"),
        FieldSpec::text("geo_usps_state_cd").alias("dual").transform(Transform::DefaultString),
    ])
    .fields(transaction_fields("dual", true))
    .deceased_key(Expr::col("dual", "bene_sk"))
    .last_updated(BENEFICIARY_TABLE, &["bfd_part_dual_coverage_updated_ts"])
}

fn beneficiary_ma_part_d_enrollment() -> TableModel {
    TableModel::new(
        "idr.beneficiary_ma_part_d_enrollment",
        TableFamily::Beneficiary,
        LoadStrategy::Incremental,
        Relation::table(&source_table("v2_mdcr_bene_mapd_enrlmt"), "enrlmt"),
    )
    .fields(vec![
        FieldSpec::int("bene_sk").alias("enrlmt").pk().batch_id().last_updated_key(),
        FieldSpec::int("cntrct_pbp_sk").alias("enrlmt"),
        FieldSpec::text("bene_pbp_num").alias("enrlmt"),
        FieldSpec::date("bene_enrlmt_bgn_dt").alias("enrlmt").pk(),
        FieldSpec::date("bene_enrlmt_end_dt").alias("enrlmt").transform(Transform::NullDateToMax),
        FieldSpec::text("bene_cntrct_num").alias("enrlmt"),
        FieldSpec::text("bene_cvrg_type_cd").alias("enrlmt").transform(Transform::DefaultString),
        FieldSpec::text("bene_enrlmt_pgm_type_cd").alias("enrlmt").pk(),
        FieldSpec::text("bene_enrlmt_emplr_sbsdy_sw").alias("enrlmt").transform(Transform::DefaultString),
    ])
    .fields(transaction_fields("enrlmt", false))
    .deceased_key(Expr::col("enrlmt", "bene_sk"))
    .static_filter(not_obsolete("enrlmt", "idr_trans_obslt_ts"))
    // the few current '~' program codes are all decades old
    .static_filter(Expr::col("enrlmt", "bene_enrlmt_pgm_type_cd").ne(Expr::Str("~".into())))
    .last_updated(BENEFICIARY_TABLE, &["bfd_part_c_coverage_updated_ts", "bfd_part_d_coverage_updated_ts"])
}

fn beneficiary_ma_part_d_enrollment_rx() -> TableModel {
    TableModel::new(
        "idr.beneficiary_ma_part_d_enrollment_rx",
        TableFamily::Beneficiary,
        LoadStrategy::Incremental,
        Relation::table(&source_table("v2_mdcr_bene_mapd_enrlmt_rx"), "enrlmt_rx"),
    )
    .fields(vec![
        FieldSpec::int("bene_sk").alias("enrlmt_rx").pk().batch_id().last_updated_key(),
        FieldSpec::int("cntrct_pbp_sk").alias("enrlmt_rx"),
        FieldSpec::text("bene_cntrct_num").alias("enrlmt_rx").pk(),
        FieldSpec::text("bene_pbp_num").alias("enrlmt_rx").pk(),
        FieldSpec::date("bene_enrlmt_bgn_dt").alias("enrlmt_rx").pk(),
        FieldSpec::text("bene_pdp_enrlmt_mmbr_id_num").alias("enrlmt_rx").transform(Transform::DefaultString),
        FieldSpec::text("bene_pdp_enrlmt_grp_num").alias("enrlmt_rx").transform(Transform::DefaultString),
        FieldSpec::text("bene_pdp_enrlmt_prcsr_num").alias("enrlmt_rx").transform(Transform::DefaultString),
        FieldSpec::text("bene_pdp_enrlmt_bank_id_num").alias("enrlmt_rx").transform(Transform::DefaultString),
        FieldSpec::date("bene_enrlmt_pdp_rx_info_bgn_dt").alias("enrlmt_rx").pk(),
    ])
    .fields(transaction_fields("enrlmt_rx", false))
    .deceased_key(Expr::col("enrlmt_rx", "bene_sk"))
    .static_filter(not_obsolete("enrlmt_rx", "idr_trans_obslt_ts"))
    .last_updated(BENEFICIARY_TABLE, PART_D_COVERAGE)
}

fn beneficiary_low_income_subsidy() -> TableModel {
    TableModel::new(
        "idr.beneficiary_low_income_subsidy",
        TableFamily::Beneficiary,
        LoadStrategy::Incremental,
        Relation::table(&source_table("v2_mdcr_bene_lis"), "bene_lis"),
    )
    .fields(vec![
        FieldSpec::int("bene_sk").alias("bene_lis").pk().batch_id().last_updated_key(),
        FieldSpec::timestamp("bene_rng_bgn_dt").alias("bene_lis").pk(),
        FieldSpec::date("bene_rng_end_dt").alias("bene_lis"),
        FieldSpec::text("bene_lis_copmt_lvl_cd").alias("bene_lis"),
        FieldSpec::text("bene_lis_ptd_prm_pct").alias("bene_lis"),
    ])
    .fields(transaction_fields("bene_lis", false))
    .deceased_key(Expr::col("bene_lis", "bene_sk"))
    .static_filter(not_obsolete("bene_lis", "idr_trans_obslt_ts"))
    .last_updated(BENEFICIARY_TABLE, PART_D_COVERAGE)
}

pub(super) fn models() -> Vec<TableModel> {
    vec![
        beneficiary(),
        beneficiary_mbi_id(),
        beneficiary_overshare_mbi(),
        beneficiary_third_party(),
        beneficiary_status(),
        beneficiary_entitlement(),
        beneficiary_entitlement_reason(),
        beneficiary_dual_eligibility(),
        beneficiary_ma_part_d_enrollment(),
        beneficiary_ma_part_d_enrollment_rx(),
        beneficiary_low_income_subsidy(),
    ]
}
