//! Connection pools and backend wiring for a production run.

use std::sync::Arc;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{PipelineError, PipelineResult};
use crate::loader::{PgLoader, UpsertLoader};
use crate::progress::{CheckpointStore, MemoryCheckpointStore, PgCheckpointStore};
use crate::source::{PgWarehouse, Warehouse};

/// Build a bounded pool from a libpq-style DSN. Connections are opened lazily.
pub fn pool(role: &str, dsn: &str, max_size: usize) -> PipelineResult<Pool> {
    if dsn.trim().is_empty() {
        return Err(PipelineError::config("missing_dsn".to_string(), format!("no {} connection string configured", role)));
    }
    let config: tokio_postgres::Config = dsn
        .parse()
        .map_err(|e| PipelineError::config("bad_dsn".to_string(), format!("{} connection string: {}", role, e)))?;
    let mgr = Manager::from_config(config, tokio_postgres::NoTls, ManagerConfig { recycling_method: RecyclingMethod::Fast });
    Pool::builder(mgr)
        .max_size(max_size)
        .build()
        .map_err(|e| PipelineError::config("pool_build".to_string(), format!("{} pool: {}", role, e)))
}

/// Check out one connection and run a trivial query so bad credentials fail before any unit starts.
pub async fn ping(role: &str, pool: &Pool) -> PipelineResult<()> {
    let client = pool.get().await?;
    client
        .simple_query("SELECT 1")
        .await
        .map_err(|e| PipelineError::fetch("connect".to_string(), format!("{}: {}", role, e)))?;
    info!(target: "idrload::db", role, max_size = pool.status().max_size, "connected");
    Ok(())
}

pub struct Backends {
    pub warehouse: Arc<dyn Warehouse>,
    pub loader: Arc<dyn UpsertLoader>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

/// Postgres-backed warehouse and loader. Progress goes to `idr.load_progress` only when
/// enabled for the mode; otherwise it lives for this process only.
pub async fn connect(settings: &Settings) -> PipelineResult<Backends> {
    let warehouse = pool("warehouse", &settings.warehouse_dsn, settings.warehouse_pool_size)?;
    let target = pool("target", &settings.target_dsn, settings.target_pool_size)?;
    ping("warehouse", &warehouse).await?;
    ping("target", &target).await?;

    let checkpoints: Arc<dyn CheckpointStore> = if settings.progress_enabled() {
        Arc::new(PgCheckpointStore::new(target.clone()))
    } else {
        warn!(target: "idrload::db", mode = settings.mode.as_str(), "load progress is not persisted in this mode");
        Arc::new(MemoryCheckpointStore::new())
    };
    Ok(Backends {
        warehouse: Arc::new(PgWarehouse::new(warehouse)),
        loader: Arc::new(PgLoader::new(target)),
        checkpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_problems_are_configuration_errors() {
        let err = pool("warehouse", "  ", 4).unwrap_err();
        assert_eq!(err.code_str(), "missing_dsn");
        let err = pool("target", "host=localhost port=notaport", 4).unwrap_err();
        assert_eq!(err.code_str(), "bad_dsn");
        assert!(err.is_fatal_for_run());
    }

    #[tokio::test]
    async fn pools_build_without_connecting() {
        let p = pool("target", "host=localhost user=idr dbname=fhirdb", 3).unwrap();
        assert_eq!(p.status().max_size, 3);
        assert_eq!(p.status().size, 0);
    }
}
