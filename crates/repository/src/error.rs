use thiserror::Error;

use batchrepo_core::{DomainError, JobInstanceId};
use batchrepo_store::StoreError;

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Repository operation error.
///
/// Every failure reaches the caller; nothing here is retried or swallowed.
///
/// ## Error Categories
///
/// - **Validation**: a required field is missing or a precondition is broken (caller defect)
/// - **NotFound**: an update targets a record that was never saved
/// - **OptimisticLock**: the stored version moved on since the caller read it
/// - **Integrity**: the stored data breaks an invariant the repository relies on
/// - **Serialization**: the context codec failed
/// - **DuplicateInstance / JobExecutionAlreadyRunning / JobInstanceAlreadyComplete /
///   JobRestart**: launch-time checks of the facade
/// - **Store**: the backend failed
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(
        "optimistic lock conflict on {entity} {id}: attempted update at version {attempted}, stored version is {current}"
    )]
    OptimisticLock {
        entity: &'static str,
        id: i64,
        attempted: u32,
        current: u32,
    },

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("execution context serialization failed: {0}")]
    Serialization(String),

    #[error("job instance already exists for job '{job_name}' and key {job_key}")]
    DuplicateInstance { job_name: String, job_key: String },

    #[error("a job execution for instance {instance_id} of job '{job_name}' is already running")]
    JobExecutionAlreadyRunning {
        job_name: String,
        instance_id: JobInstanceId,
    },

    #[error("job instance {instance_id} of job '{job_name}' is already complete")]
    JobInstanceAlreadyComplete {
        job_name: String,
        instance_id: JobInstanceId,
    },

    #[error("job restart refused: {0}")]
    JobRestart(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RepositoryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, RepositoryError::OptimisticLock { .. })
    }
}

/// Validation failures stay validation failures; anything else coming out of
/// the domain while reading stored data means the data is broken.
impl From<DomainError> for RepositoryError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => RepositoryError::Validation(msg),
            DomainError::InvariantViolation(msg) => RepositoryError::Integrity(msg),
            other @ DomainError::UnknownVariant { .. } => RepositoryError::Integrity(other.to_string()),
        }
    }
}
