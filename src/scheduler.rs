//! Run scheduling across (table, partition) units.
//!
//! Units run on a bounded pool (`workers` permits) and are isolated from each other: a failing
//! unit is retried with linear backoff while its error is retryable, then reported, and never
//! stops its siblings. Cancellation stops new units and new batches; units that did not finish
//! are reported as pending at their last durable checkpoint.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{PipelineError, PipelineResult};
use crate::executor::Executor;
use crate::model::{Registry, TableModel};
use crate::partition::{Catalog, PartitionUnit};
use crate::planner::RunContext;
use crate::progress::{LoadProgress, ProgressKey};

#[derive(Debug, Clone, PartialEq)]
pub enum UnitStatus {
    Completed,
    /// Not started or stopped by cancellation.
    Pending,
    Failed { retryable: bool, code: String, message: String },
}

#[derive(Debug, Clone)]
pub struct UnitReport {
    pub key: ProgressKey,
    pub status: UnitStatus,
    pub attempts: u32,
    pub rows: u64,
    /// Stored progress after the unit stopped, when it could be read.
    pub checkpoint: Option<LoadProgress>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub run_start: DateTime<Utc>,
    pub units: Vec<UnitReport>,
}

impl RunReport {
    fn with(&self, f: impl Fn(&UnitStatus) -> bool) -> Vec<&UnitReport> {
        self.units.iter().filter(|u| f(&u.status)).collect()
    }

    pub fn completed(&self) -> Vec<&UnitReport> { self.with(|s| *s == UnitStatus::Completed) }
    pub fn pending(&self) -> Vec<&UnitReport> { self.with(|s| *s == UnitStatus::Pending) }
    pub fn failed(&self) -> Vec<&UnitReport> { self.with(|s| matches!(s, UnitStatus::Failed { .. })) }

    pub fn rows(&self) -> u64 {
        self.units.iter().map(|u| u.rows).sum()
    }

    /// Every unit completed.
    pub fn is_success(&self) -> bool {
        self.units.iter().all(|u| u.status == UnitStatus::Completed)
    }

    pub fn unit(&self, key: &ProgressKey) -> Option<&UnitReport> {
        self.units.iter().find(|u| &u.key == key)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "run {} started {}: {} completed, {} pending, {} failed, {} rows",
            self.run_id,
            self.run_start.to_rfc3339(),
            self.completed().len(),
            self.pending().len(),
            self.failed().len(),
            self.rows()
        )?;
        for u in &self.units {
            let cp = match &u.checkpoint {
                Some(p) => format!("{} / {}", p.last_ts.to_rfc3339(), p.last_id),
                None => "-".to_string(),
            };
            match &u.status {
                UnitStatus::Completed => writeln!(f, "  completed  {}  rows={} checkpoint={}", u.key, u.rows, cp)?,
                UnitStatus::Pending => writeln!(f, "  pending    {}  checkpoint={}", u.key, cp)?,
                UnitStatus::Failed { retryable, code, message } => writeln!(
                    f,
                    "  failed     {}  attempts={} retryable={} [{}] {} checkpoint={}",
                    u.key, u.attempts, retryable, code, message, cp
                )?,
            }
        }
        Ok(())
    }
}

pub struct Scheduler {
    settings: Arc<Settings>,
    registry: Arc<Registry>,
    catalog: Arc<Catalog>,
    executor: Arc<Executor>,
}

struct Job {
    model: Arc<TableModel>,
    unit: PartitionUnit,
    key: ProgressKey,
}

impl Scheduler {
    pub fn new(settings: Arc<Settings>, registry: Arc<Registry>, catalog: Arc<Catalog>, executor: Arc<Executor>) -> Scheduler {
        Scheduler { settings, registry, catalog, executor }
    }

    fn jobs(&self, tables: &[String]) -> PipelineResult<Vec<Job>> {
        let mut jobs = Vec::new();
        for model in self.registry.select(tables)? {
            for unit in self.catalog.units_for(model.family) {
                let key = ProgressKey::new(&model.table, &unit.partition.name);
                jobs.push(Job { model: model.clone(), unit, key });
            }
        }
        Ok(jobs)
    }

    /// Process the selected tables (all when empty). Only configuration errors fail the call;
    /// unit failures land in the report.
    #[tracing::instrument(skip_all, fields(run_start = %run.run_start), err)]
    pub async fn run(&self, tables: &[String], run: RunContext, cancel: CancellationToken) -> PipelineResult<RunReport> {
        let run_id = Uuid::new_v4();
        let jobs = self.jobs(tables)?;
        info!(
            target: "idrload::scheduler",
            run_id = %run_id,
            mode = run.mode.as_str(),
            units = jobs.len(),
            workers = self.settings.workers,
            "run starting"
        );

        let permits = Arc::new(Semaphore::new(self.settings.workers));
        let mut set = JoinSet::new();
        let order: Vec<ProgressKey> = jobs.iter().map(|j| j.key.clone()).collect();
        for job in jobs {
            let exec = self.executor.clone();
            let settings = self.settings.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    p = permits.acquire_owned() => p.ok(),
                };
                let report = match permit {
                    Some(_permit) => run_with_retry(&exec, &settings, &job, &run, &cancel).await,
                    None => UnitReport { key: job.key.clone(), status: UnitStatus::Pending, attempts: 0, rows: 0, checkpoint: None },
                };
                finish(&exec, report).await
            });
        }

        let mut reports: HashMap<ProgressKey, UnitReport> = HashMap::new();
        let mut aborted = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => {
                    reports.insert(report.key.clone(), report);
                }
                Err(e) => {
                    error!(target: "idrload::scheduler", error = %e, "unit task aborted");
                    aborted = Some(e.to_string());
                }
            }
        }

        // a unit without a report is one whose task panicked
        let units = order
            .into_iter()
            .map(|k| {
                reports.remove(&k).unwrap_or_else(|| {
                    let message = aborted.clone().unwrap_or_else(|| "task ended without a report".to_string());
                    UnitReport {
                        key: k,
                        status: UnitStatus::Failed { retryable: false, code: "task_panic".into(), message },
                        attempts: 0,
                        rows: 0,
                        checkpoint: None,
                    }
                })
            })
            .collect();
        let report = RunReport { run_id, run_start: run.run_start, units };
        info!(
            target: "idrload::scheduler",
            run_id = %run_id,
            completed = report.completed().len(),
            pending = report.pending().len(),
            failed = report.failed().len(),
            rows = report.rows(),
            "run finished"
        );
        Ok(report)
    }
}

async fn run_with_retry(
    exec: &Executor,
    settings: &Settings,
    job: &Job,
    run: &RunContext,
    cancel: &CancellationToken,
) -> UnitReport {
    let mut attempts = 0;
    let mut rows = 0;
    loop {
        attempts += 1;
        match exec.run_unit(&job.model, &job.unit, run, cancel).await {
            Ok(outcome) => {
                rows += outcome.rows;
                let status = if outcome.finished { UnitStatus::Completed } else { UnitStatus::Pending };
                return UnitReport { key: job.key.clone(), status, attempts, rows, checkpoint: None };
            }
            Err(e) => {
                let retryable = e.is_retryable();
                if retryable && attempts < settings.max_attempts && !cancel.is_cancelled() {
                    let wait = settings.retry_backoff() * attempts;
                    warn!(
                        target: "idrload::scheduler",
                        key = %job.key,
                        attempt = attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "retrying unit"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return UnitReport { key: job.key.clone(), status: UnitStatus::Pending, attempts, rows, checkpoint: None };
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                    continue;
                }
                return UnitReport { key: job.key.clone(), status: failed_status(&e), attempts, rows, checkpoint: None };
            }
        }
    }
}

fn failed_status(e: &PipelineError) -> UnitStatus {
    UnitStatus::Failed { retryable: e.is_retryable(), code: e.code_str().to_string(), message: e.message().to_string() }
}

/// Attach the stored checkpoint to a unit report.
async fn finish(exec: &Executor, mut report: UnitReport) -> UnitReport {
    match exec.checkpoints().get(&report.key).await {
        Ok(p) => report.checkpoint = p,
        Err(e) => warn!(target: "idrload::scheduler", key = %report.key, error = %e, "checkpoint unreadable for report"),
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadMode;
    use crate::loader::MemoryLoader;
    use crate::progress::MemoryCheckpointStore;
    use crate::source::MemoryWarehouse;

    fn scheduler(settings: Settings, warehouse: Arc<MemoryWarehouse>) -> Scheduler {
        let settings = Arc::new(settings);
        let catalog = Arc::new(Catalog::standard());
        let exec = Executor::new(
            settings.clone(),
            catalog.clone(),
            warehouse,
            Arc::new(MemoryLoader::new()),
            Arc::new(MemoryCheckpointStore::new()),
        );
        Scheduler::new(settings, Arc::new(Registry::load().unwrap()), catalog, Arc::new(exec))
    }

    fn run() -> RunContext {
        RunContext { run_start: Utc::now(), mode: LoadMode::Local }
    }

    #[tokio::test]
    async fn unknown_table_fails_the_run() {
        let s = scheduler(Settings::default(), Arc::new(MemoryWarehouse::new()));
        let err = s.run(&["idr.nope".to_string()], run(), CancellationToken::new()).await.unwrap_err();
        assert!(err.is_fatal_for_run());
    }

    #[tokio::test]
    async fn fetch_failures_are_retried_until_attempts_run_out() {
        let settings = Settings { retry_backoff_ms: 1, max_attempts: 3, ..Settings::default() };
        let wh = Arc::new(MemoryWarehouse::new());
        wh.fail_next(2);
        let s = scheduler(settings, wh.clone());
        let report = s.run(&["idr.contract_pbp_number".to_string()], run(), CancellationToken::new()).await.unwrap();
        assert!(report.is_success(), "{}", report);
        assert_eq!(report.units[0].attempts, 3);

        wh.fail_next(5);
        let report = s.run(&["idr.contract_pbp_number".to_string()], run(), CancellationToken::new()).await.unwrap();
        let failed = report.failed();
        assert_eq!(failed.len(), 1);
        assert!(matches!(&failed[0].status, UnitStatus::Failed { retryable: true, .. }));
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn cancelled_run_reports_every_unit_pending() {
        let s = scheduler(Settings::default(), Arc::new(MemoryWarehouse::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = s.run(&[], run(), cancel).await.unwrap();
        assert!(!report.units.is_empty());
        assert_eq!(report.pending().len(), report.units.len());
        assert!(report.to_string().contains("pending"));
    }
}
