//! Error types for gigflow.

use std::time::Duration;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("Submit error: {0}")]
    Submit(#[from] SubmitError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid cron schedule '{schedule}': {message}")]
    InvalidSchedule { schedule: String, message: String },
}

/// Job record store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Ingestion errors. Fatal for the run that raised them; no job records
/// are created past the point of failure.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("No source connector registered for '{0}'")]
    UnknownSource(String),

    #[error("Source '{source_name}' returned no results")]
    NoResults { source_name: String },

    #[error("Malformed query for source '{source_name}': {reason}")]
    MalformedQuery { source_name: String, reason: String },

    #[error("Connector '{source_name}' failed: {reason}")]
    Connector { source_name: String, reason: String },

    #[error("Another ingestion run is already in progress")]
    RunInProgress,
}

/// Stage executor errors.
///
/// `Transient` errors are retried with backoff inside the owning stage and
/// never bubble past it; `Unrecoverable` moves the job straight to `error`.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Stage {stage} hit a transient failure: {reason}")]
    Transient { stage: String, reason: String },

    #[error("Stage {stage} failed: {reason}")]
    Unrecoverable { stage: String, reason: String },
}

impl StageError {
    /// Name of the stage that raised this error.
    pub fn stage(&self) -> &str {
        match self {
            Self::Transient { stage, .. } | Self::Unrecoverable { stage, .. } => stage,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Job state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Job {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        state: String,
        target: String,
    },

    #[error("Unknown status '{0}'")]
    UnknownStatus(String),
}

/// Active-task registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("A {category} task is already active for job {job_id}")]
    AlreadyActive { category: String, job_id: String },

    #[error("No {category} task found for job {job_id}")]
    NotFound { category: String, job_id: String },
}

/// Approval gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("Failed to post approval request: {0}")]
    PostFailed(String),

    #[error("Unknown approval reference: {0}")]
    UnknownRef(String),
}

/// Submission agent errors.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Submission already in flight for job {job_id}")]
    AlreadyInFlight { job_id: String },

    #[error("Submission timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Submission driver failed: {0}")]
    Driver(String),

    #[error("Job {job_id} is {status}, not submittable")]
    NotSubmittable { job_id: String, status: String },
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
