//! Job instances, job executions and step executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::{DomainError, DomainResult};
use crate::id::{JobExecutionId, JobInstanceId, StepExecutionId};
use crate::parameters::JobParameters;
use crate::status::{BatchStatus, ExitStatus};
use crate::versioned::Versioned;

/// Logical unit of work: a job name plus a parameter fingerprint.
///
/// Instances are created once and never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub job_name: String,
}

impl JobInstance {
    pub fn new(id: JobInstanceId, job_name: impl Into<String>) -> Self {
        Self {
            id,
            job_name: job_name.into(),
        }
    }

    /// Instances are never updated, so their version is always 0.
    pub fn version(&self) -> u32 {
        0
    }
}

/// One run attempt of a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: Option<JobExecutionId>,
    pub version: Option<u32>,
    pub job_instance_id: JobInstanceId,
    pub job_parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Loaded separately from the context collection.
    #[serde(skip)]
    pub execution_context: ExecutionContext,
    /// Hydrated on demand from the step collection.
    #[serde(skip)]
    pub step_executions: Vec<StepExecution>,
}

impl JobExecution {
    /// A fresh, unsaved execution in `STARTING` state.
    pub fn new(job_instance_id: JobInstanceId, job_parameters: JobParameters) -> Self {
        Self {
            id: None,
            version: None,
            job_instance_id,
            job_parameters,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::unknown(),
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// Move the status forward, never back (see [`BatchStatus::upgrade_to`]).
    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    /// A new step execution belonging to this (already saved) execution.
    pub fn new_step_execution(&self, step_name: impl Into<String>) -> DomainResult<StepExecution> {
        let id = self.id.ok_or_else(|| {
            DomainError::validation("job execution must be saved before creating step executions")
        })?;
        Ok(StepExecution::new(step_name, id))
    }

    /// Check the fields every persisted execution must carry.
    pub fn validate(&self) -> DomainResult<()> {
        if self.job_instance_id.get() <= 0 {
            return Err(DomainError::validation("JobExecution job instance id must be positive"));
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if end < start {
                return Err(DomainError::validation("JobExecution end time precedes start time"));
            }
        }
        self.job_parameters.validate()
    }
}

impl Versioned for JobExecution {
    const ENTITY: &'static str = "JobExecution";

    fn raw_id(&self) -> Option<i64> {
        self.id.map(|id| id.get())
    }

    fn version(&self) -> Option<u32> {
        self.version
    }

    fn set_version(&mut self, version: u32) {
        self.version = Some(version);
    }
}

/// One run attempt of a step inside a job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Option<StepExecutionId>,
    pub version: Option<u32>,
    pub job_execution_id: JobExecutionId,
    pub step_name: String,
    pub status: BatchStatus,
    pub read_count: u64,
    pub write_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub filter_count: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub exit_status: ExitStatus,
    #[serde(skip)]
    pub execution_context: ExecutionContext,
}

impl StepExecution {
    /// A fresh, unsaved step execution, started now.
    pub fn new(step_name: impl Into<String>, job_execution_id: JobExecutionId) -> Self {
        Self {
            id: None,
            version: None,
            job_execution_id,
            step_name: step_name.into(),
            status: BatchStatus::Starting,
            read_count: 0,
            write_count: 0,
            commit_count: 0,
            rollback_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            filter_count: 0,
            start_time: Some(Utc::now()),
            end_time: None,
            last_updated: None,
            exit_status: ExitStatus::executing(),
            execution_context: ExecutionContext::new(),
        }
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    /// Step name and start time are required before any write.
    pub fn validate(&self) -> DomainResult<()> {
        if self.step_name.trim().is_empty() {
            return Err(DomainError::validation("StepExecution step name cannot be empty"));
        }
        if self.start_time.is_none() {
            return Err(DomainError::validation("StepExecution start time cannot be null"));
        }
        Ok(())
    }
}

impl Versioned for StepExecution {
    const ENTITY: &'static str = "StepExecution";

    fn raw_id(&self) -> Option<i64> {
        self.id.map(|id| id.get())
    }

    fn version(&self) -> Option<u32> {
        self.version
    }

    fn set_version(&mut self, version: u32) {
        self.version = Some(version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_execution_defaults() {
        let execution = JobExecution::new(JobInstanceId::new(1), JobParameters::new());
        assert_eq!(execution.status, BatchStatus::Starting);
        assert_eq!(execution.exit_status.exit_code, ExitStatus::UNKNOWN);
        assert!(execution.id.is_none());
        assert!(execution.version.is_none());
        assert!(execution.is_running());
    }

    #[test]
    fn increment_version_starts_at_zero() {
        let mut execution = JobExecution::new(JobInstanceId::new(1), JobParameters::new());
        execution.increment_version();
        assert_eq!(execution.version, Some(0));
        execution.increment_version();
        assert_eq!(execution.version, Some(1));
    }

    #[test]
    fn step_requires_saved_parent() {
        let mut execution = JobExecution::new(JobInstanceId::new(1), JobParameters::new());
        assert!(execution.new_step_execution("load").is_err());
        execution.id = Some(JobExecutionId::new(7));
        let step = execution.new_step_execution("load").unwrap();
        assert_eq!(step.job_execution_id, JobExecutionId::new(7));
        assert!(step.start_time.is_some());
        assert_eq!(step.exit_status.exit_code, ExitStatus::EXECUTING);
    }

    #[test]
    fn step_validation() {
        let mut step = StepExecution::new("  ", JobExecutionId::new(1));
        assert!(step.validate().is_err());
        step.step_name = "load".into();
        step.start_time = None;
        assert!(step.validate().is_err());
    }

    #[test]
    fn end_before_start_is_rejected() {
        let mut execution = JobExecution::new(JobInstanceId::new(1), JobParameters::new());
        let now = Utc::now();
        execution.start_time = Some(now);
        execution.end_time = Some(now - chrono::Duration::seconds(1));
        assert!(execution.validate().is_err());
    }
}
