//! `JobRepository`: the stores wired together behind the operations a batch
//! engine calls while launching and running jobs.

use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;

use batchrepo_core::{
    BatchStatus, DefaultJobKeyGenerator, JobExecution, JobInstance, JobInstanceId, JobKeyGenerator, JobParameters,
    StepExecution,
};
use batchrepo_store::{DocumentStore, IndexSpec, SortOrder};

use crate::config::RepositoryConfig;
use crate::error::{RepositoryError, RepositoryResult};
use crate::execution_context::{ContextOwner, ExecutionContextStore};
use crate::explorer::JobExplorer;
use crate::incrementer::{DocumentIdGeneratorFactory, IdGeneratorFactory};
use crate::job_execution::JobExecutionStore;
use crate::job_instance::JobInstanceStore;
use crate::schema::{
    EXECUTION_CONTEXT_COLLECTION, JOB_EXECUTION_COLLECTION, JOB_EXECUTION_ID, JOB_EXECUTION_SEQUENCE,
    JOB_INSTANCE_COLLECTION, JOB_INSTANCE_ID, JOB_INSTANCE_SEQUENCE, JOB_KEY, JOB_NAME, JOB_PARAMETER_COLLECTION,
    STEP_EXECUTION_COLLECTION, STEP_EXECUTION_ID, STEP_EXECUTION_SEQUENCE,
};
use crate::serializer::{ExecutionContextSerializer, JsonExecutionContextSerializer};
use crate::step_execution::StepExecutionStore;

pub struct JobRepository<S> {
    store: S,
    config: RepositoryConfig,
    serializer: Arc<dyn ExecutionContextSerializer>,
    key_generator: Arc<dyn JobKeyGenerator>,
    instances: JobInstanceStore<S>,
    executions: JobExecutionStore<S>,
    steps: StepExecutionStore<S>,
    contexts: ExecutionContextStore<S>,
}

/// Configures and builds a [`JobRepository`].
pub struct JobRepositoryBuilder<S> {
    store: S,
    config: RepositoryConfig,
    serializer: Option<Arc<dyn ExecutionContextSerializer>>,
    id_generators: Option<Arc<dyn IdGeneratorFactory>>,
    key_generator: Option<Arc<dyn JobKeyGenerator>>,
}

impl<S> JobRepositoryBuilder<S>
where
    S: DocumentStore + Clone + 'static,
{
    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn collection_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.collection_prefix = prefix.into();
        self
    }

    pub fn max_exit_message_length(mut self, length: usize) -> Self {
        self.config.max_exit_message_length = length;
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn ExecutionContextSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Replace the store-backed sequences, e.g. with a shared id service.
    pub fn id_generator_factory(mut self, factory: Arc<dyn IdGeneratorFactory>) -> Self {
        self.id_generators = Some(factory);
        self
    }

    pub fn key_generator(mut self, key_generator: Arc<dyn JobKeyGenerator>) -> Self {
        self.key_generator = Some(key_generator);
        self
    }

    /// Validate the configuration, create indexes and wire the stores.
    #[instrument(skip(self), fields(prefix = %self.config.collection_prefix), err)]
    pub fn build(self) -> RepositoryResult<JobRepository<S>> {
        let Self {
            store,
            config,
            serializer,
            id_generators,
            key_generator,
        } = self;
        config.validate()?;
        ensure_indexes(&store, &config)?;

        let serializer = serializer.unwrap_or_else(|| Arc::new(JsonExecutionContextSerializer));
        let key_generator = key_generator.unwrap_or_else(|| Arc::new(DefaultJobKeyGenerator));
        let id_generators =
            id_generators.unwrap_or_else(|| Arc::new(DocumentIdGeneratorFactory::new(store.clone(), &config)));

        let repository = JobRepository {
            instances: JobInstanceStore::new(
                store.clone(),
                &config,
                id_generators.generator(JOB_INSTANCE_SEQUENCE),
                key_generator.clone(),
            ),
            executions: JobExecutionStore::new(store.clone(), &config, id_generators.generator(JOB_EXECUTION_SEQUENCE)),
            steps: StepExecutionStore::new(store.clone(), &config, id_generators.generator(STEP_EXECUTION_SEQUENCE)),
            contexts: ExecutionContextStore::new(store.clone(), &config, serializer.clone()),
            store,
            config,
            serializer,
            key_generator,
        };
        tracing::info!("job repository ready");
        Ok(repository)
    }
}

fn ensure_indexes<S: DocumentStore>(store: &S, config: &RepositoryConfig) -> RepositoryResult<()> {
    let asc = SortOrder::Ascending;
    let indexes = [
        IndexSpec::new(config.collection(JOB_INSTANCE_COLLECTION)).on(JOB_INSTANCE_ID, asc),
        IndexSpec::new(config.collection(JOB_INSTANCE_COLLECTION))
            .on(JOB_NAME, asc)
            .on(JOB_KEY, asc),
        IndexSpec::new(config.collection(JOB_EXECUTION_COLLECTION))
            .on(JOB_EXECUTION_ID, asc)
            .on(JOB_INSTANCE_ID, asc),
        IndexSpec::new(config.collection(STEP_EXECUTION_COLLECTION))
            .on(STEP_EXECUTION_ID, asc)
            .on(JOB_EXECUTION_ID, asc),
        IndexSpec::new(config.collection(JOB_PARAMETER_COLLECTION)).on(JOB_EXECUTION_ID, asc),
        IndexSpec::new(config.collection(EXECUTION_CONTEXT_COLLECTION))
            .on(STEP_EXECUTION_ID, asc)
            .on(JOB_EXECUTION_ID, asc),
    ];
    for index in &indexes {
        store.ensure_index(index)?;
    }
    Ok(())
}

impl<S> JobRepository<S>
where
    S: DocumentStore + Clone + 'static,
{
    pub fn builder(store: S) -> JobRepositoryBuilder<S> {
        JobRepositoryBuilder {
            store,
            config: RepositoryConfig::default(),
            serializer: None,
            id_generators: None,
            key_generator: None,
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn job_instances(&self) -> &JobInstanceStore<S> {
        &self.instances
    }

    pub fn job_executions(&self) -> &JobExecutionStore<S> {
        &self.executions
    }

    pub fn step_executions(&self) -> &StepExecutionStore<S> {
        &self.steps
    }

    pub fn execution_contexts(&self) -> &ExecutionContextStore<S> {
        &self.contexts
    }

    /// A read-only view over the same collections.
    pub fn explorer(&self) -> JobExplorer<S> {
        JobExplorer::from_parts(
            self.store.clone(),
            &self.config,
            self.serializer.clone(),
            self.key_generator.clone(),
        )
    }

    pub fn is_job_instance_exists(&self, job_name: &str, parameters: &JobParameters) -> RepositoryResult<bool> {
        Ok(self.instances.get_by_parameters(job_name, parameters)?.is_some())
    }

    pub fn create_job_instance(&self, job_name: &str, parameters: &JobParameters) -> RepositoryResult<JobInstance> {
        self.instances.create(job_name, parameters)
    }

    /// Start a new execution of the instance identified by `job_name` and
    /// `parameters`, creating the instance on first launch.
    ///
    /// A relaunch of an existing instance is refused while any of its
    /// executions is running or in `UNKNOWN` state, and once one has completed
    /// (or was abandoned) if the instance has identifying parameters.
    /// Otherwise the new execution starts from the context of the latest one.
    #[instrument(skip(self, parameters), err)]
    pub fn create_job_execution(&self, job_name: &str, parameters: &JobParameters) -> RepositoryResult<JobExecution> {
        let (instance, context) = match self.instances.get_by_parameters(job_name, parameters)? {
            Some(instance) => {
                let executions = self.executions.find_by_instance(instance.id)?;
                if executions.is_empty() {
                    return Err(RepositoryError::integrity(format!(
                        "job instance {} of job '{job_name}' has no executions",
                        instance.id
                    )));
                }
                check_restartable(&instance, &executions)?;

                let context = match self.executions.get_last(instance.id)? {
                    Some(last) => self.contexts.get(ContextOwner::of_job(&last)?)?,
                    None => Default::default(),
                };
                (instance, context)
            }
            None => (self.instances.create(job_name, parameters)?, Default::default()),
        };

        let mut execution = JobExecution::new(instance.id, parameters.clone());
        execution.execution_context = context;
        execution.last_updated = Some(Utc::now());
        self.executions.save(&mut execution)?;
        self.contexts
            .save(ContextOwner::of_job(&execution)?, &execution.execution_context)?;

        tracing::info!(
            instance_id = %instance.id,
            execution_id = ?execution.id,
            "job execution created"
        );
        Ok(execution)
    }

    /// Stamp `last_updated` and write the execution under optimistic locking.
    ///
    /// A stale version is not reconciled here: the conflict is returned and
    /// the caller decides whether to [`synchronize_status`](Self::synchronize_status).
    pub fn update_job_execution(&self, execution: &mut JobExecution) -> RepositoryResult<()> {
        execution.last_updated = Some(Utc::now());
        self.executions.update(execution)
    }

    pub fn synchronize_status(&self, execution: &mut JobExecution) -> RepositoryResult<()> {
        self.executions.synchronize_status(execution)
    }

    /// Save a new step execution and its context.
    pub fn add_step_execution(&self, step: &mut StepExecution) -> RepositoryResult<()> {
        step.last_updated = Some(Utc::now());
        self.steps.save(step)?;
        self.contexts.save(ContextOwner::of_step(step)?, &step.execution_context)
    }

    pub fn add_step_executions(&self, steps: &mut [StepExecution]) -> RepositoryResult<()> {
        let now = Utc::now();
        for step in steps.iter_mut() {
            step.last_updated = Some(now);
        }
        self.steps.save_all(steps)?;
        self.contexts.save_all(steps)
    }

    pub fn update_step_execution(&self, step: &mut StepExecution) -> RepositoryResult<()> {
        step.last_updated = Some(Utc::now());
        self.steps.update(step)
    }

    pub fn update_job_execution_context(&self, execution: &JobExecution) -> RepositoryResult<()> {
        self.contexts
            .update(ContextOwner::of_job(execution)?, &execution.execution_context)
    }

    pub fn update_step_execution_context(&self, step: &StepExecution) -> RepositoryResult<()> {
        self.contexts
            .update(ContextOwner::of_step(step)?, &step.execution_context)
    }

    /// Latest execution of the matching instance, with its context.
    pub fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> RepositoryResult<Option<JobExecution>> {
        let Some(instance) = self.instances.get_by_parameters(job_name, parameters)? else {
            return Ok(None);
        };
        let Some(mut execution) = self.executions.get_last(instance.id)? else {
            return Ok(None);
        };
        execution.execution_context = self.contexts.get(ContextOwner::of_job(&execution)?)?;
        Ok(Some(execution))
    }

    /// Latest run of `step_name` in any execution of the instance, with its
    /// context.
    pub fn get_last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> RepositoryResult<Option<StepExecution>> {
        let Some(mut step) = self.steps.get_last(instance_id, step_name)? else {
            return Ok(None);
        };
        step.execution_context = self.contexts.get(ContextOwner::of_step(&step)?)?;
        Ok(Some(step))
    }

    pub fn get_step_execution_count(&self, instance_id: JobInstanceId, step_name: &str) -> RepositoryResult<u64> {
        self.steps.count(instance_id, step_name)
    }
}

fn check_restartable(instance: &JobInstance, executions: &[JobExecution]) -> RepositoryResult<()> {
    for execution in executions {
        if execution.is_running() {
            return Err(RepositoryError::JobExecutionAlreadyRunning {
                job_name: instance.job_name.clone(),
                instance_id: instance.id,
            });
        }
        match execution.status {
            BatchStatus::Unknown => {
                return Err(RepositoryError::JobRestart(format!(
                    "execution {:?} of job '{}' is in UNKNOWN state and cannot be restarted safely",
                    execution.id, instance.job_name
                )));
            }
            BatchStatus::Completed | BatchStatus::Abandoned if !execution.job_parameters.identifying().is_empty() => {
                return Err(RepositoryError::JobInstanceAlreadyComplete {
                    job_name: instance.job_name.clone(),
                    instance_id: instance.id,
                });
            }
            _ => {}
        }
    }
    Ok(())
}
