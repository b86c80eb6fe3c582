use std::time::Duration;

use thiserror::Error;

/// Internal error type for the insight engine.
///
/// None of these cross the coordinator boundary for generation requests; they are
/// normalized into a `GenerationOutcome` there. Read-only paths (status, recent)
/// convert them into `AppError` at the handler.
#[derive(Debug, Error)]
pub enum InsightError {
    #[error("Unknown insight category: {0}")]
    InvalidCategory(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Lock backend error: {0}")]
    Lock(#[from] redis::RedisError),

    #[error("Generation lock for {0} is held by another worker")]
    LockBusy(String),

    #[error("Snapshot provider error: {0}")]
    Snapshot(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0} did not finish before the generation lease deadline")]
    Deadline(&'static str),

    #[error("Invalid policy configuration: {0}")]
    Policy(String),
}
