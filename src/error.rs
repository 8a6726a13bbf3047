//! Pipeline error model.
//! One enum shared by the registry, planner, executor and the storage adapters. Variants map onto
//! how a failure is handled: configuration problems stop the process, planning problems stop one
//! unit, fetch and load problems are retried at the unit level.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad model, partition or filter setup. Fatal at startup, never retried.
    #[error("configuration error [{code}]: {message}")]
    Configuration { code: String, message: String },

    /// A unit could not be planned (malformed partition, unresolvable alias).
    #[error("planning error [{code}]: {message}")]
    Planning { code: String, message: String },

    /// Warehouse query, timeout or connection failure. The checkpoint is untouched.
    #[error("fetch error [{code}]: {message}")]
    Fetch { code: String, message: String },

    /// Target-store transaction failure. The batch is re-fetched and re-applied.
    #[error("load error [{code}]: {message}")]
    Load { code: String, message: String },

    /// Progress could not be persisted after a durable load.
    #[error("checkpoint error [{code}]: {message}")]
    Checkpoint { code: String, message: String },

    /// The run was cancelled before the unit finished.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl PipelineError {
    pub fn config<S: Into<String>>(code: S, msg: S) -> Self { PipelineError::Configuration { code: code.into(), message: msg.into() } }
    pub fn planning<S: Into<String>>(code: S, msg: S) -> Self { PipelineError::Planning { code: code.into(), message: msg.into() } }
    pub fn fetch<S: Into<String>>(code: S, msg: S) -> Self { PipelineError::Fetch { code: code.into(), message: msg.into() } }
    pub fn load<S: Into<String>>(code: S, msg: S) -> Self { PipelineError::Load { code: code.into(), message: msg.into() } }
    pub fn checkpoint<S: Into<String>>(code: S, msg: S) -> Self { PipelineError::Checkpoint { code: code.into(), message: msg.into() } }

    pub fn code_str(&self) -> &str {
        match self {
            PipelineError::Configuration { code, .. }
            | PipelineError::Planning { code, .. }
            | PipelineError::Fetch { code, .. }
            | PipelineError::Load { code, .. }
            | PipelineError::Checkpoint { code, .. } => code.as_str(),
            PipelineError::Cancelled(_) => "cancelled",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            PipelineError::Configuration { message, .. }
            | PipelineError::Planning { message, .. }
            | PipelineError::Fetch { message, .. }
            | PipelineError::Load { message, .. }
            | PipelineError::Checkpoint { message, .. } => message.as_str(),
            PipelineError::Cancelled(m) => m.as_str(),
        }
    }

    /// Whether the scheduler may run the unit again from its last durable checkpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Fetch { .. } | PipelineError::Load { .. } | PipelineError::Checkpoint { .. })
    }

    /// Configuration errors abort the whole run; everything else is scoped to one unit.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, PipelineError::Configuration { .. })
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Classify a tokio-postgres error raised while reading from the warehouse.
pub fn fetch_error(context: &str, err: tokio_postgres::Error) -> PipelineError {
    PipelineError::fetch("warehouse_query".to_string(), format!("{}: {}", context, err))
}

/// Classify a tokio-postgres error raised while writing to the target store.
pub fn load_error(context: &str, err: tokio_postgres::Error) -> PipelineError {
    PipelineError::load("target_write".to_string(), format!("{}: {}", context, err))
}

impl From<deadpool_postgres::PoolError> for PipelineError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        // Pool checkout failures are connection failures; retry the unit.
        PipelineError::Fetch { code: "pool_checkout".into(), message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(!PipelineError::config("missing_alias", "x").is_retryable());
        assert!(!PipelineError::planning("bad_partition", "x").is_retryable());
        assert!(PipelineError::fetch("timeout", "x").is_retryable());
        assert!(PipelineError::load("tx", "x").is_retryable());
        assert!(PipelineError::checkpoint("advance", "x").is_retryable());
        assert!(!PipelineError::Cancelled("stop".into()).is_retryable());
    }

    #[test]
    fn code_and_message_accessors() {
        let e = PipelineError::planning("unknown_alias", "alias foo has no join");
        assert_eq!(e.code_str(), "unknown_alias");
        assert_eq!(e.message(), "alias foo has no join");
        assert_eq!(e.to_string(), "planning error [unknown_alias]: alias foo has no join");
        assert!(PipelineError::config("c", "m").is_fatal_for_run());
        assert!(!PipelineError::fetch("c", "m").is_fatal_for_run());
    }
}
