use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the job engine.
///
/// Stage failures are not represented here: they are converted into job
/// state (status, error field, log lines) at the stage-runner boundary and
/// observed asynchronously through status polling.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid job parameters: {0}")]
    InvalidParams(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
