//! `batchrepo-core`: batch execution model.
//!
//! This crate contains the **pure domain** of the job repository: identifiers,
//! statuses, parameters, execution contexts and the execution records
//! themselves. It performs no IO.

pub mod context;
pub mod error;
pub mod execution;
pub mod fingerprint;
pub mod id;
pub mod parameters;
pub mod status;
pub mod versioned;

pub use context::{ContextValue, ExecutionContext};
pub use error::{DomainError, DomainResult};
pub use execution::{JobExecution, JobInstance, StepExecution};
pub use fingerprint::{DefaultJobKeyGenerator, JobKeyGenerator};
pub use id::{JobExecutionId, JobInstanceId, StepExecutionId};
pub use parameters::{JobParameter, JobParameters, ParameterType, ParameterValue};
pub use status::{BatchStatus, ExitStatus};
pub use versioned::Versioned;
