//! Step execution persistence.

use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use batchrepo_core::{
    ExitStatus, JobExecution, JobExecutionId, JobInstanceId, StepExecution, StepExecutionId, Versioned,
};
use batchrepo_store::{Document, DocumentExt, DocumentStore, Filter, FindQuery, SortOrder};

use crate::config::RepositoryConfig;
use crate::error::{RepositoryError, RepositoryResult};
use crate::incrementer::IdGenerator;
use crate::locking::{KeyedLocks, optimistic_update, stored_version};
use crate::schema::{
    COMMIT_COUNT, END_TIME, EXIT_CODE, EXIT_MESSAGE, FILTER_COUNT, JOB_EXECUTION_COLLECTION, JOB_EXECUTION_ID,
    JOB_INSTANCE_ID, LAST_UPDATED, PROCESS_SKIP_COUNT, READ_COUNT, READ_SKIP_COUNT, ROLLBACK_COUNT, START_TIME,
    STATUS, STEP_EXECUTION_COLLECTION, STEP_EXECUTION_ID, STEP_NAME, VERSION, WRITE_COUNT, WRITE_SKIP_COUNT,
    opt_datetime_value,
};

pub struct StepExecutionStore<S> {
    store: S,
    steps: String,
    executions: String,
    ids: Option<Arc<dyn IdGenerator>>,
    locks: KeyedLocks,
    max_exit_message_length: usize,
}

impl<S> StepExecutionStore<S>
where
    S: DocumentStore,
{
    pub fn new(store: S, config: &RepositoryConfig, ids: Arc<dyn IdGenerator>) -> Self {
        let mut this = Self::read_only(store, config);
        this.ids = Some(ids);
        this
    }

    pub fn read_only(store: S, config: &RepositoryConfig) -> Self {
        Self {
            store,
            steps: config.collection(STEP_EXECUTION_COLLECTION),
            executions: config.collection(JOB_EXECUTION_COLLECTION),
            ids: None,
            locks: KeyedLocks::new(),
            max_exit_message_length: config.max_exit_message_length,
        }
    }

    /// Persist a new step execution, assigning its id and version 0.
    #[instrument(skip(self, step), fields(step_name = %step.step_name, job_execution_id = %step.job_execution_id), err)]
    pub fn save(&self, step: &mut StepExecution) -> RepositoryResult<()> {
        if step.id.is_some() {
            return Err(RepositoryError::validation("StepExecution already has an id"));
        }
        if step.version.is_some() {
            return Err(RepositoryError::validation("StepExecution already has a version"));
        }
        step.validate()?;
        let ids = self
            .ids
            .as_ref()
            .ok_or_else(|| RepositoryError::validation("step execution store is read-only"))?;

        step.id = Some(StepExecutionId::new(ids.next_id()?));
        step.increment_version();
        let version = step.version.unwrap_or_default();
        self.store.insert(&self.steps, self.to_document(step, version))?;
        Ok(())
    }

    /// Save each step in turn; stops at the first failure.
    pub fn save_all(&self, steps: &mut [StepExecution]) -> RepositoryResult<()> {
        steps.iter_mut().try_for_each(|step| self.save(step))
    }

    /// Optimistic update, see [`crate::JobExecutionStore::update`].
    #[instrument(skip(self, step), fields(step_id = ?step.id, version = ?step.version), err)]
    pub fn update(&self, step: &mut StepExecution) -> RepositoryResult<()> {
        step.validate()?;
        optimistic_update(
            &self.store,
            &self.locks,
            &self.steps,
            STEP_EXECUTION_ID,
            step,
            |s, version| self.to_document(s, version),
        )
    }

    /// One step of one job execution.
    #[instrument(skip(self), err)]
    pub fn get(
        &self,
        job_execution_id: JobExecutionId,
        step_id: StepExecutionId,
    ) -> RepositoryResult<Option<StepExecution>> {
        let filter = Filter::new()
            .eq(STEP_EXECUTION_ID, step_id.get())
            .eq(JOB_EXECUTION_ID, job_execution_id.get());
        self.store
            .find_one(&self.steps, &filter)?
            .map(|doc| from_document(&doc))
            .transpose()
    }

    /// Steps of a job execution in creation order.
    #[instrument(skip(self), err)]
    pub fn find_by_execution(&self, job_execution_id: JobExecutionId) -> RepositoryResult<Vec<StepExecution>> {
        let query = FindQuery::new(Filter::new().eq(JOB_EXECUTION_ID, job_execution_id.get()))
            .sort_by(STEP_EXECUTION_ID, SortOrder::Ascending);
        self.store
            .find(&self.steps, &query)?
            .iter()
            .map(from_document)
            .collect()
    }

    /// Replace `execution.step_executions` with what is stored.
    pub fn load_all(&self, execution: &mut JobExecution) -> RepositoryResult<()> {
        let id = execution
            .id
            .ok_or_else(|| RepositoryError::validation("JobExecution must be saved before loading its steps"))?;
        execution.step_executions = self.find_by_execution(id)?;
        Ok(())
    }

    /// Latest run of `step_name` across every execution of an instance.
    ///
    /// Ordered by start time, then by id when two steps started together.
    #[instrument(skip(self), err)]
    pub fn get_last(&self, instance_id: JobInstanceId, step_name: &str) -> RepositoryResult<Option<StepExecution>> {
        let execution_ids = self.execution_ids(instance_id)?;
        if execution_ids.is_empty() {
            return Ok(None);
        }
        let query = FindQuery::new(
            Filter::new()
                .is_in(JOB_EXECUTION_ID, execution_ids)
                .eq(STEP_NAME, step_name),
        )
        .sort_by(START_TIME, SortOrder::Descending)
        .sort_by(STEP_EXECUTION_ID, SortOrder::Descending)
        .limit(1);
        self.store
            .find(&self.steps, &query)?
            .first()
            .map(from_document)
            .transpose()
    }

    /// How many times `step_name` ran across every execution of an instance.
    #[instrument(skip(self), err)]
    pub fn count(&self, instance_id: JobInstanceId, step_name: &str) -> RepositoryResult<u64> {
        let execution_ids = self.execution_ids(instance_id)?;
        if execution_ids.is_empty() {
            return Ok(0);
        }
        let filter = Filter::new()
            .is_in(JOB_EXECUTION_ID, execution_ids)
            .eq(STEP_NAME, step_name);
        Ok(self.store.count(&self.steps, &filter)?)
    }

    fn execution_ids(&self, instance_id: JobInstanceId) -> RepositoryResult<Vec<Value>> {
        Ok(self.store.distinct(
            &self.executions,
            JOB_EXECUTION_ID,
            &Filter::new().eq(JOB_INSTANCE_ID, instance_id.get()),
        )?)
    }

    fn to_document(&self, step: &StepExecution, version: u32) -> Document {
        let description = step.exit_status.truncated_description(self.max_exit_message_length);

        let mut doc = Document::new();
        doc.insert(STEP_EXECUTION_ID.into(), step.id.map(|id| id.get()).into());
        doc.insert(STEP_NAME.into(), step.step_name.clone().into());
        doc.insert(JOB_EXECUTION_ID.into(), step.job_execution_id.get().into());
        doc.insert(START_TIME.into(), opt_datetime_value(step.start_time));
        doc.insert(END_TIME.into(), opt_datetime_value(step.end_time));
        doc.insert(STATUS.into(), step.status.as_str().into());
        doc.insert(COMMIT_COUNT.into(), step.commit_count.into());
        doc.insert(READ_COUNT.into(), step.read_count.into());
        doc.insert(FILTER_COUNT.into(), step.filter_count.into());
        doc.insert(WRITE_COUNT.into(), step.write_count.into());
        doc.insert(EXIT_CODE.into(), step.exit_status.exit_code.clone().into());
        doc.insert(EXIT_MESSAGE.into(), description.into());
        doc.insert(READ_SKIP_COUNT.into(), step.read_skip_count.into());
        doc.insert(WRITE_SKIP_COUNT.into(), step.write_skip_count.into());
        doc.insert(PROCESS_SKIP_COUNT.into(), step.process_skip_count.into());
        doc.insert(ROLLBACK_COUNT.into(), step.rollback_count.into());
        doc.insert(LAST_UPDATED.into(), opt_datetime_value(step.last_updated));
        doc.insert(VERSION.into(), version.into());
        doc
    }
}

fn from_document(doc: &Document) -> RepositoryResult<StepExecution> {
    let mut step = StepExecution::new(
        doc.require_str(STEP_NAME)?,
        JobExecutionId::new(doc.require_i64(JOB_EXECUTION_ID)?),
    );
    step.id = Some(StepExecutionId::new(doc.require_i64(STEP_EXECUTION_ID)?));
    step.version = Some(stored_version(doc)?);
    step.status = doc.require_str(STATUS)?.parse()?;
    step.commit_count = doc.require_u64(COMMIT_COUNT)?;
    step.read_count = doc.require_u64(READ_COUNT)?;
    step.filter_count = doc.require_u64(FILTER_COUNT)?;
    step.write_count = doc.require_u64(WRITE_COUNT)?;
    step.read_skip_count = doc.require_u64(READ_SKIP_COUNT)?;
    step.write_skip_count = doc.require_u64(WRITE_SKIP_COUNT)?;
    step.process_skip_count = doc.require_u64(PROCESS_SKIP_COUNT)?;
    step.rollback_count = doc.require_u64(ROLLBACK_COUNT)?;
    step.start_time = doc.opt_datetime(START_TIME)?;
    step.end_time = doc.opt_datetime(END_TIME)?;
    step.last_updated = doc.opt_datetime(LAST_UPDATED)?;
    step.exit_status = ExitStatus::with_description(
        doc.opt_str(EXIT_CODE)?.unwrap_or(ExitStatus::UNKNOWN),
        doc.opt_str(EXIT_MESSAGE)?.unwrap_or_default(),
    );
    Ok(step)
}

#[cfg(test)]
mod tests {
    use batchrepo_core::{BatchStatus, JobParameters};
    use batchrepo_store::InMemoryDocumentStore;
    use chrono::{Duration, Utc};

    use super::*;
    use crate::incrementer::{DocumentIdGeneratorFactory, IdGeneratorFactory};
    use crate::job_execution::JobExecutionStore;
    use crate::schema::{JOB_EXECUTION_SEQUENCE, STEP_EXECUTION_SEQUENCE};

    struct Fixture {
        executions: JobExecutionStore<Arc<InMemoryDocumentStore>>,
        steps: StepExecutionStore<Arc<InMemoryDocumentStore>>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryDocumentStore::new());
        let config = RepositoryConfig::default();
        let factory = DocumentIdGeneratorFactory::new(backend.clone(), &config);
        Fixture {
            executions: JobExecutionStore::new(backend.clone(), &config, factory.generator(JOB_EXECUTION_SEQUENCE)),
            steps: StepExecutionStore::new(backend, &config, factory.generator(STEP_EXECUTION_SEQUENCE)),
        }
    }

    fn saved_execution(f: &Fixture, instance: i64) -> JobExecution {
        let mut execution = JobExecution::new(JobInstanceId::new(instance), JobParameters::new());
        f.executions.save(&mut execution).unwrap();
        execution
    }

    #[test]
    fn save_and_get_round_trip() {
        let f = fixture();
        let execution = saved_execution(&f, 1);
        let mut step = execution.new_step_execution("load").unwrap();
        step.read_count = 10;
        step.filter_count = 2;
        step.process_skip_count = 1;
        step.status = BatchStatus::Started;
        f.steps.save(&mut step).unwrap();
        assert_eq!(step.id, Some(StepExecutionId::new(1)));
        assert_eq!(step.version, Some(0));

        let loaded = f.steps.get(execution.id.unwrap(), step.id.unwrap()).unwrap();
        assert_eq!(loaded, Some(step.clone()));
        assert_eq!(f.steps.get(JobExecutionId::new(99), step.id.unwrap()).unwrap(), None);
    }

    #[test]
    fn save_rejects_saved_or_invalid_steps() {
        let f = fixture();
        let execution = saved_execution(&f, 1);

        let mut versioned = execution.new_step_execution("load").unwrap();
        versioned.version = Some(2);
        assert!(matches!(f.steps.save(&mut versioned), Err(RepositoryError::Validation(_))));

        let mut unstarted = execution.new_step_execution("load").unwrap();
        unstarted.start_time = None;
        assert!(matches!(f.steps.save(&mut unstarted), Err(RepositoryError::Validation(_))));
    }

    #[test]
    fn update_uses_versions() {
        let f = fixture();
        let execution = saved_execution(&f, 1);
        let mut step = execution.new_step_execution("load").unwrap();
        f.steps.save(&mut step).unwrap();
        let mut stale = step.clone();

        step.commit_count = 3;
        f.steps.update(&mut step).unwrap();
        assert_eq!(step.version, Some(1));

        assert!(f.steps.update(&mut stale).unwrap_err().is_optimistic_lock());
    }

    #[test]
    fn steps_load_in_creation_order() {
        let f = fixture();
        let mut execution = saved_execution(&f, 1);
        let mut steps = vec![
            execution.new_step_execution("load").unwrap(),
            execution.new_step_execution("transform").unwrap(),
            execution.new_step_execution("write").unwrap(),
        ];
        f.steps.save_all(&mut steps).unwrap();

        f.steps.load_all(&mut execution).unwrap();
        let names: Vec<&str> = execution.step_executions.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["load", "transform", "write"]);
    }

    #[test]
    fn last_and_count_span_executions_of_an_instance() {
        let f = fixture();
        let first = saved_execution(&f, 1);
        let second = saved_execution(&f, 1);
        let unrelated = saved_execution(&f, 2);

        let now = Utc::now();
        let mut early = first.new_step_execution("load").unwrap();
        early.start_time = Some(now - Duration::minutes(5));
        let mut late = second.new_step_execution("load").unwrap();
        late.start_time = Some(now);
        let mut other = unrelated.new_step_execution("load").unwrap();
        other.start_time = Some(now + Duration::minutes(5));
        for step in [&mut early, &mut late, &mut other] {
            f.steps.save(step).unwrap();
        }

        let instance = JobInstanceId::new(1);
        assert_eq!(f.steps.count(instance, "load").unwrap(), 2);
        assert_eq!(f.steps.count(instance, "write").unwrap(), 0);
        let last = f.steps.get_last(instance, "load").unwrap().unwrap();
        assert_eq!(last.id, late.id);
        assert_eq!(f.steps.get_last(JobInstanceId::new(7), "load").unwrap(), None);
    }

    #[test]
    fn equal_start_times_fall_back_to_id() {
        let f = fixture();
        let execution = saved_execution(&f, 1);
        let at = Utc::now();
        let mut ids = Vec::new();
        for _ in 0..2 {
            let mut step = execution.new_step_execution("load").unwrap();
            step.start_time = Some(at);
            f.steps.save(&mut step).unwrap();
            ids.push(step.id);
        }
        let last = f.steps.get_last(JobInstanceId::new(1), "load").unwrap().unwrap();
        assert_eq!(last.id, ids[1]);
    }
}
