//! Job instance persistence.
//!
//! Instances are identified by `(jobName, jobKey)` where `jobKey` is the
//! fingerprint of the identifying parameters. Creation checks for an existing
//! instance and then inserts; the two steps are separate store calls, so two
//! launchers racing on the same key can both insert. The duplicate is logged
//! when noticed but not prevented.

use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use batchrepo_core::{JobExecutionId, JobInstance, JobInstanceId, JobKeyGenerator, JobParameters};
use batchrepo_store::{Document, DocumentExt, DocumentStore, Filter, FindQuery, SortOrder};

use crate::config::RepositoryConfig;
use crate::error::{RepositoryError, RepositoryResult};
use crate::incrementer::IdGenerator;
use crate::schema::{
    JOB_EXECUTION_COLLECTION, JOB_EXECUTION_ID, JOB_INSTANCE_COLLECTION, JOB_INSTANCE_ID, JOB_KEY, JOB_NAME, VERSION,
};

pub struct JobInstanceStore<S> {
    store: S,
    instances: String,
    executions: String,
    ids: Option<Arc<dyn IdGenerator>>,
    key_generator: Arc<dyn JobKeyGenerator>,
}

impl<S> JobInstanceStore<S>
where
    S: DocumentStore,
{
    pub fn new(
        store: S,
        config: &RepositoryConfig,
        ids: Arc<dyn IdGenerator>,
        key_generator: Arc<dyn JobKeyGenerator>,
    ) -> Self {
        let mut this = Self::read_only(store, config, key_generator);
        this.ids = Some(ids);
        this
    }

    /// A store that can only read; `create` fails.
    pub fn read_only(store: S, config: &RepositoryConfig, key_generator: Arc<dyn JobKeyGenerator>) -> Self {
        Self {
            store,
            instances: config.collection(JOB_INSTANCE_COLLECTION),
            executions: config.collection(JOB_EXECUTION_COLLECTION),
            ids: None,
            key_generator,
        }
    }

    pub fn key_for(&self, parameters: &JobParameters) -> String {
        self.key_generator.generate_key(parameters)
    }

    /// Create a new instance for `job_name` and the identifying subset of
    /// `parameters`.
    ///
    /// Fails with `DuplicateInstance` when an instance with the same name and
    /// key was already committed.
    #[instrument(skip(self, parameters), fields(job_name = %job_name), err)]
    pub fn create(&self, job_name: &str, parameters: &JobParameters) -> RepositoryResult<JobInstance> {
        if job_name.trim().is_empty() {
            return Err(RepositoryError::validation("job name cannot be empty"));
        }
        let ids = self
            .ids
            .as_ref()
            .ok_or_else(|| RepositoryError::validation("job instance store is read-only"))?;

        let job_key = self.key_for(parameters);
        let by_key = Filter::new().eq(JOB_NAME, job_name).eq(JOB_KEY, job_key.as_str());
        if self.store.find_one(&self.instances, &by_key)?.is_some() {
            return Err(RepositoryError::DuplicateInstance {
                job_name: job_name.to_string(),
                job_key,
            });
        }

        let instance = JobInstance::new(JobInstanceId::new(ids.next_id()?), job_name);
        self.store
            .insert(&self.instances, to_document(&instance, &job_key))?;

        let copies = self.store.count(&self.instances, &by_key)?;
        if copies > 1 {
            tracing::warn!(
                job_name,
                job_key = %job_key,
                copies,
                "duplicate job instances created by concurrent launches"
            );
        }

        tracing::info!(instance_id = %instance.id, "job instance created");
        Ok(instance)
    }

    #[instrument(skip(self), err)]
    pub fn get(&self, id: JobInstanceId) -> RepositoryResult<Option<JobInstance>> {
        let filter = Filter::new().eq(JOB_INSTANCE_ID, id.get());
        self.store
            .find_one(&self.instances, &filter)?
            .map(|doc| from_document(&doc))
            .transpose()
    }

    /// The instance for `job_name` whose key matches `parameters`, if any.
    #[instrument(skip(self, parameters), err)]
    pub fn get_by_parameters(&self, job_name: &str, parameters: &JobParameters) -> RepositoryResult<Option<JobInstance>> {
        let job_key = self.key_for(parameters);
        let filter = Filter::new().eq(JOB_NAME, job_name).eq(JOB_KEY, job_key);
        self.store
            .find_one(&self.instances, &filter)?
            .map(|doc| from_document(&doc))
            .transpose()
    }

    /// The instance a stored job execution belongs to.
    #[instrument(skip(self), err)]
    pub fn get_for_execution(&self, execution_id: JobExecutionId) -> RepositoryResult<Option<JobInstance>> {
        let filter = Filter::new().eq(JOB_EXECUTION_ID, execution_id.get());
        let Some(execution) = self.store.find_one(&self.executions, &filter)? else {
            return Ok(None);
        };
        let instance_id = JobInstanceId::new(execution.require_i64(JOB_INSTANCE_ID)?);
        self.get(instance_id)
    }

    /// Instances of `job_name`, newest (highest id) first.
    #[instrument(skip(self), err)]
    pub fn list(&self, job_name: &str, start: usize, count: usize) -> RepositoryResult<Vec<JobInstance>> {
        let query = FindQuery::new(Filter::new().eq(JOB_NAME, job_name))
            .sort_by(JOB_INSTANCE_ID, SortOrder::Descending)
            .skip(start)
            .limit(count);
        self.store
            .find(&self.instances, &query)?
            .iter()
            .map(from_document)
            .collect()
    }

    /// Every job name with at least one instance, ascending.
    #[instrument(skip(self), err)]
    pub fn list_names(&self) -> RepositoryResult<Vec<String>> {
        self.store
            .distinct(&self.instances, JOB_NAME, &Filter::new())?
            .into_iter()
            .map(|value| match value {
                Value::String(name) => Ok(name),
                other => Err(RepositoryError::integrity(format!("job name is not a string: {other}"))),
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    pub fn count(&self, job_name: &str) -> RepositoryResult<u64> {
        Ok(self
            .store
            .count(&self.instances, &Filter::new().eq(JOB_NAME, job_name))?)
    }
}

fn to_document(instance: &JobInstance, job_key: &str) -> Document {
    let mut doc = Document::new();
    doc.insert(JOB_INSTANCE_ID.into(), instance.id.get().into());
    doc.insert(JOB_NAME.into(), instance.job_name.clone().into());
    doc.insert(JOB_KEY.into(), job_key.into());
    doc.insert(VERSION.into(), instance.version().into());
    doc
}

fn from_document(doc: &Document) -> RepositoryResult<JobInstance> {
    Ok(JobInstance::new(
        JobInstanceId::new(doc.require_i64(JOB_INSTANCE_ID)?),
        doc.require_str(JOB_NAME)?,
    ))
}
