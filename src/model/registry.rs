//! The immutable set of table models, validated once at startup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::sql::is_valid_ident;

use super::{FieldSource, LoadStrategy, TableModel};

#[derive(Debug, Clone)]
pub struct Registry {
    models: Vec<Arc<TableModel>>,
    by_table: HashMap<String, usize>,
}

impl Registry {
    /// Build and validate every built-in model.
    pub fn load() -> PipelineResult<Registry> {
        let mut models = super::beneficiary::models();
        models.extend(super::reference::models());
        models.extend(super::claim::models());
        Registry::from_models(models)
    }

    pub fn from_models(models: Vec<TableModel>) -> PipelineResult<Registry> {
        let mut by_table = HashMap::new();
        for (i, m) in models.iter().enumerate() {
            validate(m)?;
            if by_table.insert(m.table.clone(), i).is_some() {
                return Err(PipelineError::config("duplicate_table".to_string(), format!("table {} is defined twice", m.table)));
            }
            debug!(target: "idrload::model", table = %m.table, family = %m.family, fields = m.fields.len(), "model registered");
        }
        Ok(Registry { models: models.into_iter().map(Arc::new).collect(), by_table })
    }

    pub fn models(&self) -> &[Arc<TableModel>] { &self.models }

    pub fn get(&self, table: &str) -> Option<&Arc<TableModel>> {
        self.by_table.get(table).map(|i| &self.models[*i])
    }

    /// Resolve a table selection; an empty selection means every model.
    pub fn select(&self, tables: &[String]) -> PipelineResult<Vec<Arc<TableModel>>> {
        if tables.is_empty() {
            return Ok(self.models.clone());
        }
        tables
            .iter()
            .map(|t| {
                self.get(t)
                    .cloned()
                    .ok_or_else(|| PipelineError::config("unknown_table".to_string(), format!("no model for table {}", t)))
            })
            .collect()
    }
}

fn invalid(model: &TableModel, msg: String) -> PipelineError {
    PipelineError::config("invalid_model".to_string(), format!("{}: {}", model.table, msg))
}

fn validate(m: &TableModel) -> PipelineResult<()> {
    if !is_valid_ident(&m.table) {
        return Err(invalid(m, "table name is not a valid identifier".into()));
    }
    if m.fields.is_empty() {
        return Err(invalid(m, "model has no fields".into()));
    }

    let mut names = HashSet::new();
    for f in &m.fields {
        if !is_valid_ident(&f.name) || !names.insert(f.name.as_str()) {
            return Err(invalid(m, format!("field name '{}' is invalid or repeated", f.name)));
        }
        if let FieldSource::Expr(e) = &f.source {
            if e.is_empty() {
                return Err(invalid(m, format!("field {} has an empty expression", f.name)));
            }
        }
        if f.is_derived() && !m.derivations.iter().any(|(n, _)| n == &f.name) {
            return Err(invalid(m, format!("derived field {} has no derivation", f.name)));
        }
    }
    for (name, _) in &m.derivations {
        if !m.field(name).map(|f| f.is_derived()).unwrap_or(false) {
            return Err(invalid(m, format!("derivation {} does not name a derived field", name)));
        }
    }

    if m.primary_key().is_empty() {
        return Err(invalid(m, "no primary key".into()));
    }
    if m.fields.iter().filter(|f| f.batch_id).count() > 1 {
        return Err(invalid(m, "more than one batch id".into()));
    }
    if m.fields.iter().filter(|f| f.last_updated_key).count() > 1 {
        return Err(invalid(m, "more than one last-updated key".into()));
    }
    if m.strategy == LoadStrategy::Incremental && m.batch_timestamp_columns(false).is_empty() {
        return Err(invalid(m, "incremental model has no batch timestamp".into()));
    }
    if let Some(lu) = &m.last_updated {
        if m.last_updated_key().is_none() || lu.columns.is_empty() {
            return Err(invalid(m, format!("last-updated table {} needs a key field and columns", lu.table)));
        }
    }

    // Alias graph: targets unique, every field alias resolvable.
    let targets = m.join_targets();
    let mut seen = HashSet::new();
    for t in &targets {
        if !seen.insert(*t) {
            return Err(invalid(m, format!("alias {} is joined more than once", t)));
        }
    }
    for f in &m.fields {
        if let Some(alias) = f.source_alias() {
            if !seen.contains(alias) {
                return Err(invalid(m, format!("field {} uses alias {} with no join", f.name, alias)));
            }
        }
    }

    if let Some(a) = &m.alignment {
        let scope = m
            .claim_scope
            .as_ref()
            .ok_or_else(|| invalid(m, "aligned model needs a claim scope".into()))?;
        if !scope.cte_columns.iter().any(|c| c == &a.parent_key) {
            return Err(invalid(m, format!("claims relation does not carry {}", a.parent_key)));
        }
        if a.kinds.is_empty() {
            return Err(invalid(m, "aligned model has no child kinds".into()));
        }
        if a.kinds.iter().any(|k| k.slot_order.is_empty() || k.join_keys.is_empty()) {
            return Err(invalid(m, "child kind needs slot ordering and join keys".into()));
        }
    }
    if m.claim_scope.is_some() && !m.family.is_claim() {
        return Err(invalid(m, "claim scope on a non-claim family".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldSpec, TableFamily};
    use crate::sql::Relation;

    fn base(strategy: LoadStrategy) -> TableModel {
        TableModel::new("idr.t", TableFamily::Reference, strategy, Relation::table("src.t", "t"))
    }

    #[test]
    fn built_in_models_validate() {
        let reg = Registry::load().unwrap();
        assert!(reg.get("idr.beneficiary").is_some());
        assert!(reg.get("idr.claim_item_institutional").unwrap().alignment.is_some());
        let picked = reg.select(&["idr.claim_rx".to_string()]).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(reg.select(&[]).unwrap().len(), reg.models().len());
    }

    #[test]
    fn unknown_alias_is_rejected() {
        let m = base(LoadStrategy::FullRefresh)
            .fields(vec![FieldSpec::int("id").alias("t").pk(), FieldSpec::text("x").alias("missing")]);
        let err = Registry::from_models(vec![m]).unwrap_err();
        assert!(err.is_fatal_for_run());
        assert!(err.message().contains("alias missing"));
    }

    #[test]
    fn incremental_without_batch_timestamp_is_rejected() {
        let m = base(LoadStrategy::Incremental).fields(vec![FieldSpec::int("id").pk()]);
        let err = Registry::from_models(vec![m]).unwrap_err();
        assert_eq!(err.code_str(), "invalid_model");
    }

    #[test]
    fn duplicate_tables_and_batch_ids_are_rejected() {
        let ok = || base(LoadStrategy::FullRefresh).fields(vec![FieldSpec::int("id").pk()]);
        assert_eq!(Registry::from_models(vec![ok(), ok()]).unwrap_err().code_str(), "duplicate_table");

        let two_ids = base(LoadStrategy::FullRefresh)
            .fields(vec![FieldSpec::int("a").pk().batch_id(), FieldSpec::int("b").batch_id()]);
        assert!(Registry::from_models(vec![two_ids]).is_err());
    }

    #[test]
    fn derived_fields_need_a_derivation() {
        let m = base(LoadStrategy::FullRefresh).fields(vec![FieldSpec::int("id").pk(), FieldSpec::int("rank").derived()]);
        assert!(Registry::from_models(vec![m]).is_err());
        assert!(Registry::load().unwrap().get("idr.unknown").is_none());
        assert!(Registry::load().unwrap().select(&["idr.unknown".into()]).is_err());
    }
}
