use std::time::Duration;

use thiserror::Error;

use crate::models::FailureReason;

/// Why an adapter could not produce raw output.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("tool unavailable: {0}")]
    Unavailable(String),
    #[error("exited with status {code:?}: {stderr}")]
    NonzeroExit { code: Option<i32>, stderr: String },
    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("platform unsupported: {0}")]
    PlatformUnsupported(String),
    #[error("adapter task aborted: {0}")]
    Internal(String),
}

impl ExecutionError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ExecutionError::Unavailable(_) => FailureReason::Unavailable,
            ExecutionError::NonzeroExit { .. } => FailureReason::NonzeroExit,
            ExecutionError::Timeout(_) => FailureReason::Timeout,
            ExecutionError::PlatformUnsupported(_) => FailureReason::PlatformUnsupported,
            ExecutionError::Internal(_) => FailureReason::Internal,
        }
    }
}

/// Failures of the asset store. These are the only errors that reach callers.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("asset not found: {0}")]
    NotFound(String),
    #[error("finding not found on asset {asset_id}: {name} ({finding_type})")]
    FindingNotFound {
        asset_id: String,
        name: String,
        finding_type: String,
    },
}
