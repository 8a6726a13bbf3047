//! Incremental claims extraction and load.
//!
//! Declarative [`model`]s describe each target table, the [`partition`] catalog splits claim
//! tables into disjoint units, the [`planner`] turns a unit and its stored [`progress`] into one
//! warehouse statement, and the [`executor`] streams that statement into the [`loader`] batch by
//! batch. The [`scheduler`] runs units on a bounded pool.

pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod filter;
pub mod loader;
pub mod model;
pub mod partition;
pub mod planner;
pub mod progress;
pub mod scheduler;
pub mod source;
pub mod sql;
pub mod value;

pub use config::{LoadMode, Settings};
pub use error::{PipelineError, PipelineResult};
pub use executor::Executor;
pub use scheduler::{RunReport, Scheduler};
