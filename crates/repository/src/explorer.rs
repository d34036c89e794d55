//! Read-only queries over job metadata.

use std::sync::Arc;

use tracing::instrument;

use batchrepo_core::{
    DefaultJobKeyGenerator, JobExecution, JobExecutionId, JobInstance, JobInstanceId, JobKeyGenerator, StepExecution,
    StepExecutionId,
};
use batchrepo_store::DocumentStore;

use crate::config::RepositoryConfig;
use crate::error::{RepositoryError, RepositoryResult};
use crate::execution_context::{ContextOwner, ExecutionContextStore};
use crate::job_execution::JobExecutionStore;
use crate::job_instance::JobInstanceStore;
use crate::serializer::{ExecutionContextSerializer, JsonExecutionContextSerializer};
use crate::step_execution::StepExecutionStore;

/// A job execution together with the instance it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionView {
    pub instance: JobInstance,
    pub execution: JobExecution,
}

/// Browses what a [`crate::JobRepository`] wrote without being able to
/// change it. Holds no id generators.
pub struct JobExplorer<S> {
    instances: JobInstanceStore<S>,
    executions: JobExecutionStore<S>,
    steps: StepExecutionStore<S>,
    contexts: ExecutionContextStore<S>,
}

impl<S> JobExplorer<S>
where
    S: DocumentStore + Clone,
{
    /// Explorer using the JSON context codec.
    pub fn new(store: S, config: &RepositoryConfig) -> RepositoryResult<Self> {
        Self::with_serializer(store, config, Arc::new(JsonExecutionContextSerializer))
    }

    pub fn with_serializer(
        store: S,
        config: &RepositoryConfig,
        serializer: Arc<dyn ExecutionContextSerializer>,
    ) -> RepositoryResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(store, config, serializer, Arc::new(DefaultJobKeyGenerator)))
    }

    pub(crate) fn from_parts(
        store: S,
        config: &RepositoryConfig,
        serializer: Arc<dyn ExecutionContextSerializer>,
        key_generator: Arc<dyn JobKeyGenerator>,
    ) -> Self {
        Self {
            instances: JobInstanceStore::read_only(store.clone(), config, key_generator),
            executions: JobExecutionStore::read_only(store.clone(), config),
            steps: StepExecutionStore::read_only(store.clone(), config),
            contexts: ExecutionContextStore::new(store, config, serializer),
        }
    }

    /// One execution with its context, its steps and their contexts.
    #[instrument(skip(self), err)]
    pub fn get_job_execution(&self, id: JobExecutionId) -> RepositoryResult<Option<ExecutionView>> {
        let Some(execution) = self.executions.get(id)? else {
            return Ok(None);
        };
        let instance = self.instances.get(execution.job_instance_id)?.ok_or_else(|| {
            RepositoryError::integrity(format!(
                "job execution {id} references missing job instance {}",
                execution.job_instance_id
            ))
        })?;
        let execution = self.hydrate(execution)?;
        Ok(Some(ExecutionView { instance, execution }))
    }

    /// One step with its context.
    pub fn get_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_id: StepExecutionId,
    ) -> RepositoryResult<Option<StepExecution>> {
        let Some(mut step) = self.steps.get(job_execution_id, step_id)? else {
            return Ok(None);
        };
        step.execution_context = self.contexts.get(ContextOwner::StepExecution(step_id))?;
        Ok(Some(step))
    }

    pub fn get_job_instance(&self, id: JobInstanceId) -> RepositoryResult<Option<JobInstance>> {
        self.instances.get(id)
    }

    /// A page of instances of `job_name`, newest first.
    pub fn get_job_instances(&self, job_name: &str, start: usize, count: usize) -> RepositoryResult<Vec<JobInstance>> {
        self.instances.list(job_name, start, count)
    }

    /// Every execution of an instance, newest first, fully hydrated.
    pub fn get_job_executions(&self, instance_id: JobInstanceId) -> RepositoryResult<Vec<JobExecution>> {
        self.executions
            .find_by_instance(instance_id)?
            .into_iter()
            .map(|execution| self.hydrate(execution))
            .collect()
    }

    /// Executions of `job_name` that have not ended, newest first.
    pub fn find_running_job_executions(&self, job_name: &str) -> RepositoryResult<Vec<JobExecution>> {
        self.executions
            .find_running(job_name)?
            .into_iter()
            .map(|execution| self.hydrate(execution))
            .collect()
    }

    pub fn get_job_names(&self) -> RepositoryResult<Vec<String>> {
        self.instances.list_names()
    }

    /// Number of instances of `job_name`; an unknown job is `NotFound`.
    pub fn get_job_instance_count(&self, job_name: &str) -> RepositoryResult<u64> {
        match self.instances.count(job_name)? {
            0 => Err(RepositoryError::NotFound(format!("no job named '{job_name}'"))),
            n => Ok(n),
        }
    }

    fn hydrate(&self, mut execution: JobExecution) -> RepositoryResult<JobExecution> {
        execution.execution_context = self.contexts.get(ContextOwner::of_job(&execution)?)?;
        self.steps.load_all(&mut execution)?;
        for step in &mut execution.step_executions {
            step.execution_context = self.contexts.get(ContextOwner::of_step(step)?)?;
        }
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use batchrepo_core::{BatchStatus, JobParameters};
    use batchrepo_store::InMemoryDocumentStore;
    use chrono::Utc;

    use super::*;
    use crate::repository::JobRepository;

    fn setup() -> (JobRepository<Arc<InMemoryDocumentStore>>, JobExplorer<Arc<InMemoryDocumentStore>>) {
        let backend = Arc::new(InMemoryDocumentStore::new());
        let repository = JobRepository::builder(backend.clone()).build().unwrap();
        let explorer = JobExplorer::new(backend, &RepositoryConfig::default()).unwrap();
        (repository, explorer)
    }

    #[test]
    fn execution_is_fully_hydrated() {
        let (repository, explorer) = setup();
        let params = JobParameters::new().with_long("day", 1, true);
        let mut execution = repository.create_job_execution("import", &params).unwrap();
        execution.execution_context.put("files", 3i64);
        repository.update_job_execution_context(&execution).unwrap();

        let mut step = execution.new_step_execution("load").unwrap();
        step.execution_context.put("line", 40i64);
        repository.add_step_execution(&mut step).unwrap();

        let view = explorer.get_job_execution(execution.id.unwrap()).unwrap().unwrap();
        assert_eq!(view.instance.job_name, "import");
        assert_eq!(view.execution.job_parameters, params);
        assert_eq!(view.execution.execution_context.get_long("files"), Some(3));
        assert_eq!(view.execution.step_executions.len(), 1);
        assert_eq!(
            view.execution.step_executions[0].execution_context.get_long("line"),
            Some(40)
        );

        let loaded = explorer
            .get_step_execution(execution.id.unwrap(), step.id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(loaded.execution_context.get_long("line"), Some(40));
        assert_eq!(explorer.get_job_execution(JobExecutionId::new(77)).unwrap(), None);
    }

    #[test]
    fn running_executions_exclude_finished_ones() {
        let (repository, explorer) = setup();
        let mut done = repository
            .create_job_execution("import", &JobParameters::new().with_long("day", 1, true))
            .unwrap();
        done.status = BatchStatus::Completed;
        done.start_time = Some(Utc::now());
        done.end_time = done.start_time;
        repository.update_job_execution(&mut done).unwrap();
        let running = repository
            .create_job_execution("import", &JobParameters::new().with_long("day", 2, true))
            .unwrap();
        repository
            .create_job_execution("export", &JobParameters::new())
            .unwrap();

        let found = explorer.find_running_job_executions("import").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, running.id);
        assert!(explorer.find_running_job_executions("missing").unwrap().is_empty());
    }

    #[test]
    fn instance_queries() {
        let (repository, explorer) = setup();
        for day in 1..=3 {
            repository
                .create_job_execution("import", &JobParameters::new().with_long("day", day, true))
                .unwrap();
        }

        assert_eq!(explorer.get_job_names().unwrap(), vec!["import".to_string()]);
        assert_eq!(explorer.get_job_instance_count("import").unwrap(), 3);
        assert!(matches!(
            explorer.get_job_instance_count("export"),
            Err(RepositoryError::NotFound(_))
        ));

        let newest = explorer.get_job_instances("import", 0, 1).unwrap();
        assert_eq!(newest[0].id, JobInstanceId::new(3));
        assert_eq!(explorer.get_job_instance(JobInstanceId::new(3)).unwrap(), Some(newest[0].clone()));
        assert_eq!(explorer.get_job_executions(JobInstanceId::new(3)).unwrap().len(), 1);
    }

    #[test]
    fn repository_hands_out_an_explorer() {
        let (repository, _) = setup();
        let execution = repository
            .create_job_execution("import", &JobParameters::new())
            .unwrap();
        let explorer = repository.explorer();
        assert!(explorer.get_job_execution(execution.id.unwrap()).unwrap().is_some());
    }
}
