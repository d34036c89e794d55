//! Job execution persistence.
//!
//! Each execution is one document in `<prefix>JobExecution`; its launch
//! parameters are written separately, one document per parameter, to
//! `<prefix>JobParameter`. The two writes are independent: a crash in between
//! leaves an execution without recorded parameters.

use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use batchrepo_core::{
    BatchStatus, ExitStatus, JobExecution, JobExecutionId, JobInstanceId, JobParameter, JobParameters,
    ParameterType, ParameterValue, Versioned,
};
use batchrepo_store::{Document, DocumentExt, DocumentStore, Filter, FindQuery, SortOrder, datetime_value};

use crate::config::RepositoryConfig;
use crate::error::{RepositoryError, RepositoryResult};
use crate::incrementer::IdGenerator;
use crate::locking::{KeyedLocks, optimistic_update, stored_version};
use crate::schema::{
    CREATE_TIME, DATE_VAL, DOUBLE_VAL, END_TIME, EXIT_CODE, EXIT_MESSAGE, IDENTIFYING, IDENTIFYING_NO,
    IDENTIFYING_YES, JOB_EXECUTION_COLLECTION, JOB_EXECUTION_ID, JOB_INSTANCE_COLLECTION, JOB_INSTANCE_ID, JOB_NAME,
    JOB_PARAMETER_COLLECTION, KEY_NAME, LAST_UPDATED, LONG_VAL, START_TIME, STATUS, STRING_VAL, TYPE_CD, VERSION,
    opt_datetime_value,
};

pub struct JobExecutionStore<S> {
    store: S,
    executions: String,
    parameters: String,
    instances: String,
    ids: Option<Arc<dyn IdGenerator>>,
    locks: KeyedLocks,
    max_exit_message_length: usize,
}

impl<S> JobExecutionStore<S>
where
    S: DocumentStore,
{
    pub fn new(store: S, config: &RepositoryConfig, ids: Arc<dyn IdGenerator>) -> Self {
        let mut this = Self::read_only(store, config);
        this.ids = Some(ids);
        this
    }

    /// A store that can only read; writes fail with `Validation`.
    pub fn read_only(store: S, config: &RepositoryConfig) -> Self {
        Self {
            store,
            executions: config.collection(JOB_EXECUTION_COLLECTION),
            parameters: config.collection(JOB_PARAMETER_COLLECTION),
            instances: config.collection(JOB_INSTANCE_COLLECTION),
            ids: None,
            locks: KeyedLocks::new(),
            max_exit_message_length: config.max_exit_message_length,
        }
    }

    /// Persist a new execution and its parameters.
    ///
    /// Assigns the id and sets the version to 0.
    #[instrument(skip(self, execution), fields(instance_id = %execution.job_instance_id), err)]
    pub fn save(&self, execution: &mut JobExecution) -> RepositoryResult<()> {
        if execution.id.is_some() {
            return Err(RepositoryError::validation("JobExecution already has an id"));
        }
        execution.validate()?;
        let ids = self
            .ids
            .as_ref()
            .ok_or_else(|| RepositoryError::validation("job execution store is read-only"))?;

        let id = JobExecutionId::new(ids.next_id()?);
        self.insert_with_id(execution, id)?;
        tracing::debug!(execution_id = %id, "job execution saved");
        Ok(())
    }

    fn insert_with_id(&self, execution: &mut JobExecution, id: JobExecutionId) -> RepositoryResult<()> {
        execution.id = Some(id);
        execution.version = None;
        execution.increment_version();

        let version = execution.version.unwrap_or_default();
        self.store
            .insert(&self.executions, self.to_document(execution, version))?;
        for (key, parameter) in execution.job_parameters.iter() {
            self.store
                .insert(&self.parameters, parameter_document(id, key, parameter))?;
        }
        Ok(())
    }

    /// Write the current state of a saved execution.
    ///
    /// The caller must hold the version it last read; on success that version
    /// is advanced by one. A stale version fails with `OptimisticLock`
    /// carrying the stored version, an unknown id with `NotFound`.
    #[instrument(skip(self, execution), fields(execution_id = ?execution.id, version = ?execution.version), err)]
    pub fn update(&self, execution: &mut JobExecution) -> RepositoryResult<()> {
        execution.validate()?;
        optimistic_update(
            &self.store,
            &self.locks,
            &self.executions,
            JOB_EXECUTION_ID,
            execution,
            |e, version| self.to_document(e, version),
        )
    }

    /// Load one execution with its parameters.
    #[instrument(skip(self), err)]
    pub fn get(&self, id: JobExecutionId) -> RepositoryResult<Option<JobExecution>> {
        let filter = Filter::new().eq(JOB_EXECUTION_ID, id.get());
        self.store
            .find_one(&self.executions, &filter)?
            .map(|doc| self.load(&doc))
            .transpose()
    }

    /// Executions of an instance, newest (highest id) first.
    #[instrument(skip(self), err)]
    pub fn find_by_instance(&self, instance_id: JobInstanceId) -> RepositoryResult<Vec<JobExecution>> {
        let query = FindQuery::new(Filter::new().eq(JOB_INSTANCE_ID, instance_id.get()))
            .sort_by(JOB_EXECUTION_ID, SortOrder::Descending);
        self.store
            .find(&self.executions, &query)?
            .iter()
            .map(|doc| self.load(doc))
            .collect()
    }

    /// The most recently created execution of an instance.
    ///
    /// Two executions sharing the latest creation time cannot be ordered and
    /// are reported as an `Integrity` error.
    #[instrument(skip(self), err)]
    pub fn get_last(&self, instance_id: JobInstanceId) -> RepositoryResult<Option<JobExecution>> {
        let query = FindQuery::new(Filter::new().eq(JOB_INSTANCE_ID, instance_id.get()))
            .sort_by(CREATE_TIME, SortOrder::Descending)
            .limit(2);
        let docs = self.store.find(&self.executions, &query)?;

        match docs.as_slice() {
            [] => Ok(None),
            [latest] => self.load(latest).map(Some),
            [latest, runner_up, ..] => {
                if latest.get(CREATE_TIME) == runner_up.get(CREATE_TIME) {
                    return Err(RepositoryError::integrity(format!(
                        "job instance {instance_id} has more than one execution created at {}",
                        latest.get(CREATE_TIME).unwrap_or(&Value::Null)
                    )));
                }
                self.load(latest).map(Some)
            }
        }
    }

    /// Executions without an end time belonging to instances of `job_name`,
    /// newest first.
    #[instrument(skip(self), err)]
    pub fn find_running(&self, job_name: &str) -> RepositoryResult<Vec<JobExecution>> {
        let instance_ids = self.store.distinct(
            &self.instances,
            JOB_INSTANCE_ID,
            &Filter::new().eq(JOB_NAME, job_name),
        )?;
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = FindQuery::new(
            Filter::new()
                .is_in(JOB_INSTANCE_ID, instance_ids)
                .is_null(END_TIME),
        )
        .sort_by(JOB_EXECUTION_ID, SortOrder::Descending);
        self.store
            .find(&self.executions, &query)?
            .iter()
            .map(|doc| self.load(doc))
            .collect()
    }

    /// Reconcile a caller-held execution with the stored one.
    ///
    /// When the stored version differs, the caller adopts it along with the
    /// stored status (upgraded, never downgraded). A record missing from the
    /// store is treated as version 0; if the caller is ahead of that, the
    /// execution is written again under its existing id.
    #[instrument(skip(self, execution), fields(execution_id = ?execution.id), err)]
    pub fn synchronize_status(&self, execution: &mut JobExecution) -> RepositoryResult<()> {
        let id = execution
            .id
            .ok_or_else(|| RepositoryError::validation("JobExecution must be saved before it is synchronized"))?;

        self.locks.with_lock(id.get(), || {
            let filter = Filter::new().eq(JOB_EXECUTION_ID, id.get());
            let stored = self.store.find_one(&self.executions, &filter)?;
            let current = match &stored {
                Some(doc) => stored_version(doc)?,
                None => 0,
            };
            if execution.version == Some(current) {
                return Ok(());
            }

            let stored = match stored {
                Some(doc) => doc,
                None => {
                    tracing::warn!(execution_id = %id, "execution missing from store, saving it again");
                    self.insert_with_id(execution, id)?;
                    self.store
                        .find_one(&self.executions, &filter)?
                        .ok_or_else(|| RepositoryError::NotFound(format!("JobExecution {id} vanished after save")))?
                }
            };

            let status: BatchStatus = stored.require_str(STATUS)?.parse()?;
            execution.upgrade_status(status);
            execution.version = Some(current);
            Ok(())
        })
    }

    fn to_document(&self, execution: &JobExecution, version: u32) -> Document {
        let description = execution
            .exit_status
            .truncated_description(self.max_exit_message_length);
        if execution
            .exit_status
            .is_description_longer_than(self.max_exit_message_length)
        {
            tracing::debug!(
                execution_id = ?execution.id,
                max = self.max_exit_message_length,
                "truncating job execution exit description"
            );
        }

        let mut doc = Document::new();
        doc.insert(JOB_EXECUTION_ID.into(), execution.id.map(|id| id.get()).into());
        doc.insert(JOB_INSTANCE_ID.into(), execution.job_instance_id.get().into());
        doc.insert(VERSION.into(), version.into());
        doc.insert(START_TIME.into(), opt_datetime_value(execution.start_time));
        doc.insert(END_TIME.into(), opt_datetime_value(execution.end_time));
        doc.insert(STATUS.into(), execution.status.as_str().into());
        doc.insert(EXIT_CODE.into(), execution.exit_status.exit_code.clone().into());
        doc.insert(EXIT_MESSAGE.into(), description.into());
        doc.insert(CREATE_TIME.into(), datetime_value(&execution.create_time));
        doc.insert(LAST_UPDATED.into(), opt_datetime_value(execution.last_updated));
        doc
    }

    fn load(&self, doc: &Document) -> RepositoryResult<JobExecution> {
        let id = JobExecutionId::new(doc.require_i64(JOB_EXECUTION_ID)?);
        let mut execution = from_document(doc)?;
        execution.job_parameters = self.load_parameters(id)?;
        Ok(execution)
    }

    fn load_parameters(&self, id: JobExecutionId) -> RepositoryResult<JobParameters> {
        let query = FindQuery::new(Filter::new().eq(JOB_EXECUTION_ID, id.get()));
        let mut parameters = JobParameters::new();
        for doc in self.store.find(&self.parameters, &query)? {
            let (key, parameter) = parameter_from_document(&doc)?;
            parameters.insert(key, parameter);
        }
        Ok(parameters)
    }
}

fn from_document(doc: &Document) -> RepositoryResult<JobExecution> {
    let exit_status = ExitStatus::with_description(
        doc.opt_str(EXIT_CODE)?.unwrap_or(ExitStatus::UNKNOWN),
        doc.opt_str(EXIT_MESSAGE)?.unwrap_or_default(),
    );
    let mut execution = JobExecution::new(
        JobInstanceId::new(doc.require_i64(JOB_INSTANCE_ID)?),
        JobParameters::new(),
    );
    execution.id = Some(JobExecutionId::new(doc.require_i64(JOB_EXECUTION_ID)?));
    execution.version = Some(stored_version(doc)?);
    execution.status = doc.require_str(STATUS)?.parse()?;
    execution.exit_status = exit_status;
    execution.create_time = doc.require_datetime(CREATE_TIME)?;
    execution.start_time = doc.opt_datetime(START_TIME)?;
    execution.end_time = doc.opt_datetime(END_TIME)?;
    execution.last_updated = doc.opt_datetime(LAST_UPDATED)?;
    Ok(execution)
}

fn parameter_document(execution_id: JobExecutionId, key: &str, parameter: &JobParameter) -> Document {
    let mut doc = Document::new();
    doc.insert(JOB_EXECUTION_ID.into(), execution_id.get().into());
    doc.insert(KEY_NAME.into(), key.into());
    doc.insert(TYPE_CD.into(), parameter.parameter_type().as_str().into());
    let (field, value) = match &parameter.value {
        ParameterValue::String(s) => (STRING_VAL, Value::from(s.clone())),
        ParameterValue::Long(v) => (LONG_VAL, Value::from(*v)),
        ParameterValue::Double(v) => (DOUBLE_VAL, Value::from(*v)),
        ParameterValue::Date(d) => (DATE_VAL, datetime_value(d)),
    };
    doc.insert(field.into(), value);
    let flag = if parameter.identifying { IDENTIFYING_YES } else { IDENTIFYING_NO };
    doc.insert(IDENTIFYING.into(), flag.into());
    doc
}

fn parameter_from_document(doc: &Document) -> RepositoryResult<(String, JobParameter)> {
    let key = doc.require_str(KEY_NAME)?.to_string();
    let value = match doc.require_str(TYPE_CD)?.parse::<ParameterType>()? {
        ParameterType::String => ParameterValue::String(doc.opt_str(STRING_VAL)?.unwrap_or_default().to_string()),
        ParameterType::Long => ParameterValue::Long(doc.require_i64(LONG_VAL)?),
        ParameterType::Double => ParameterValue::Double(doc.require_f64(DOUBLE_VAL)?),
        ParameterType::Date => ParameterValue::Date(doc.require_datetime(DATE_VAL)?),
    };
    let identifying = match doc.opt_str(IDENTIFYING)? {
        Some(IDENTIFYING_NO) => false,
        Some(IDENTIFYING_YES) | None => true,
        Some(other) => {
            return Err(RepositoryError::integrity(format!(
                "parameter '{key}' has identifying flag '{other}'"
            )));
        }
    };
    Ok((key, JobParameter::new(value, identifying)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use batchrepo_store::InMemoryDocumentStore;
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::incrementer::{DocumentIdGeneratorFactory, IdGeneratorFactory};
    use crate::schema::JOB_EXECUTION_SEQUENCE;

    fn store_with(config: RepositoryConfig) -> (Arc<InMemoryDocumentStore>, JobExecutionStore<Arc<InMemoryDocumentStore>>) {
        let backend = Arc::new(InMemoryDocumentStore::new());
        let ids = DocumentIdGeneratorFactory::new(backend.clone(), &config).generator(JOB_EXECUTION_SEQUENCE);
        (backend.clone(), JobExecutionStore::new(backend, &config, ids))
    }

    fn store() -> JobExecutionStore<Arc<InMemoryDocumentStore>> {
        store_with(RepositoryConfig::default()).1
    }

    fn execution(instance: i64) -> JobExecution {
        let params = JobParameters::new()
            .with_string("file", "in.csv", true)
            .with_long("chunk", 100, false)
            .with_double("ratio", 0.5, false)
            .with_date("day", Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(), true);
        JobExecution::new(JobInstanceId::new(instance), params)
    }

    #[test]
    fn save_assigns_id_and_version_zero() {
        let store = store();
        let mut e = execution(1);
        store.save(&mut e).unwrap();
        assert_eq!(e.id, Some(JobExecutionId::new(1)));
        assert_eq!(e.version, Some(0));
        assert!(matches!(store.save(&mut e), Err(RepositoryError::Validation(_))));
    }

    #[test]
    fn round_trip_preserves_scalars_and_parameters() {
        let store = store();
        let mut e = execution(1);
        e.status = BatchStatus::Started;
        e.start_time = Some(Utc::now());
        e.last_updated = Some(Utc::now());
        e.exit_status = ExitStatus::with_description(ExitStatus::EXECUTING, "running");
        store.save(&mut e).unwrap();

        let loaded = store.get(e.id.unwrap()).unwrap().unwrap();
        assert_eq!(loaded, e);
    }

    #[test]
    fn update_advances_version_and_detects_stale_writes() {
        let store = store();
        let mut e = execution(1);
        store.save(&mut e).unwrap();
        let mut stale = e.clone();

        e.status = BatchStatus::Completed;
        store.update(&mut e).unwrap();
        assert_eq!(e.version, Some(1));

        stale.status = BatchStatus::Failed;
        let err = store.update(&mut stale).unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::OptimisticLock { attempted: 0, current: 1, .. }
        ));
        assert_eq!(stale.version, Some(0));
        assert_eq!(store.get(e.id.unwrap()).unwrap().unwrap().status, BatchStatus::Completed);
    }

    #[test]
    fn update_of_unsaved_execution_fails() {
        let store = store();
        let mut e = execution(1);
        assert!(matches!(store.update(&mut e), Err(RepositoryError::Validation(_))));

        e.id = Some(JobExecutionId::new(42));
        e.version = Some(0);
        assert!(matches!(store.update(&mut e), Err(RepositoryError::NotFound(_))));
    }

    #[test]
    fn long_exit_descriptions_are_truncated_in_store_only() {
        let config = RepositoryConfig {
            max_exit_message_length: 10,
            ..RepositoryConfig::default()
        };
        let (_, store) = store_with(config);
        let mut e = execution(1);
        e.exit_status = ExitStatus::with_description(ExitStatus::FAILED, "é".repeat(25));
        store.save(&mut e).unwrap();

        assert_eq!(e.exit_status.exit_description.chars().count(), 25);
        let loaded = store.get(e.id.unwrap()).unwrap().unwrap();
        assert_eq!(loaded.exit_status.exit_description, "é".repeat(10));
    }

    #[test]
    fn get_last_picks_latest_creation_time() {
        let store = store();
        let base = Utc::now();
        for offset in [0, 2, 1] {
            let mut e = execution(1);
            e.create_time = base + Duration::seconds(offset);
            store.save(&mut e).unwrap();
        }
        let last = store.get_last(JobInstanceId::new(1)).unwrap().unwrap();
        assert_eq!(last.id, Some(JobExecutionId::new(2)));
        assert_eq!(store.get_last(JobInstanceId::new(9)).unwrap(), None);
    }

    #[test]
    fn get_last_rejects_ties() {
        let store = store();
        let at = Utc::now();
        for _ in 0..2 {
            let mut e = execution(1);
            e.create_time = at;
            store.save(&mut e).unwrap();
        }
        assert!(matches!(
            store.get_last(JobInstanceId::new(1)),
            Err(RepositoryError::Integrity(_))
        ));
    }

    #[test]
    fn find_by_instance_is_newest_first() {
        let store = store();
        for instance in [1, 2, 1] {
            store.save(&mut execution(instance)).unwrap();
        }
        let ids: Vec<i64> = store
            .find_by_instance(JobInstanceId::new(1))
            .unwrap()
            .iter()
            .filter_map(|e| e.id.map(|id| id.get()))
            .collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[test]
    fn synchronize_adopts_newer_stored_state() {
        let store = store();
        let mut e = execution(1);
        store.save(&mut e).unwrap();
        let mut other = e.clone();

        e.status = BatchStatus::Stopping;
        store.update(&mut e).unwrap();

        other.status = BatchStatus::Started;
        store.synchronize_status(&mut other).unwrap();
        assert_eq!(other.version, Some(1));
        assert_eq!(other.status, BatchStatus::Stopping);

        // Already in sync: nothing changes.
        store.synchronize_status(&mut other).unwrap();
        assert_eq!(other.version, Some(1));
    }

    #[test]
    fn synchronize_never_downgrades() {
        let store = store();
        let mut e = execution(1);
        store.save(&mut e).unwrap();
        let mut local = e.clone();

        e.status = BatchStatus::Started;
        store.update(&mut e).unwrap();

        local.status = BatchStatus::Failed;
        store.synchronize_status(&mut local).unwrap();
        assert_eq!(local.status, BatchStatus::Failed);
        assert_eq!(local.version, Some(1));
    }

    #[test]
    fn synchronize_restores_missing_record() {
        let store = store();
        let mut e = execution(1);
        e.id = Some(JobExecutionId::new(5));
        e.version = Some(3);
        e.status = BatchStatus::Started;

        store.synchronize_status(&mut e).unwrap();
        assert_eq!(e.version, Some(0));
        let stored = store.get(JobExecutionId::new(5)).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Started);
        assert_eq!(stored.job_parameters, e.job_parameters);
    }

    #[test]
    fn parameters_are_stored_one_document_each() {
        let (backend, store) = store_with(RepositoryConfig::default());
        store.save(&mut execution(1)).unwrap();
        let docs = backend
            .find("BatchJobParameter", &FindQuery::default())
            .unwrap();
        assert_eq!(docs.len(), 4);
        let day = docs
            .iter()
            .find(|d| d.get(KEY_NAME) == Some(&Value::from("day")))
            .unwrap();
        assert_eq!(day[TYPE_CD], Value::from("DATE"));
        assert_eq!(day[IDENTIFYING], Value::from("Y"));
        assert_eq!(day[DATE_VAL], Value::from("2024-01-02T00:00:00.000000000Z"));
    }
}
