//! `batchrepo-repository`: persistence of batch job metadata.
//!
//! Job instances, job executions, step executions and execution contexts are
//! written to a [`batchrepo_store::DocumentStore`] so that a batch engine can
//! find out, after a crash, what ran and where to restart from.
//!
//! [`JobRepository`] is the entry point for writers and [`JobExplorer`] for
//! readers. Updates use optimistic locking on a per-record version; nothing
//! spans more than one document atomically.

pub mod config;
pub mod error;
pub mod execution_context;
pub mod explorer;
pub mod incrementer;
pub mod job_execution;
pub mod job_instance;
pub mod locking;
pub mod repository;
pub mod schema;
pub mod serializer;
pub mod step_execution;

pub use config::RepositoryConfig;
pub use error::{RepositoryError, RepositoryResult};
pub use execution_context::{ContextOwner, ExecutionContextStore};
pub use explorer::{ExecutionView, JobExplorer};
pub use incrementer::{DocumentIdGenerator, DocumentIdGeneratorFactory, IdGenerator, IdGeneratorFactory};
pub use job_execution::JobExecutionStore;
pub use job_instance::JobInstanceStore;
pub use locking::KeyedLocks;
pub use repository::{JobRepository, JobRepositoryBuilder};
pub use serializer::{ExecutionContextSerializer, JsonExecutionContextSerializer};
pub use step_execution::StepExecutionStore;
