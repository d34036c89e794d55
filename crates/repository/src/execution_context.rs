//! Execution context persistence.
//!
//! Contexts are keyed by their owner, a job execution or a step execution,
//! and stored as base64 of the serializer's bytes. Writes upsert, so `save`
//! and `update` behave the same and there is no version check.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::instrument;

use batchrepo_core::{ExecutionContext, JobExecution, JobExecutionId, StepExecution, StepExecutionId};
use batchrepo_store::{Document, DocumentExt, DocumentStore, Filter};

use crate::config::RepositoryConfig;
use crate::error::{RepositoryError, RepositoryResult};
use crate::schema::{EXECUTION_CONTEXT_COLLECTION, JOB_EXECUTION_ID, SERIALIZED_CONTEXT, STEP_EXECUTION_ID};
use crate::serializer::ExecutionContextSerializer;

/// Which record a context belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContextOwner {
    JobExecution(JobExecutionId),
    StepExecution(StepExecutionId),
}

impl ContextOwner {
    fn key_field(self) -> &'static str {
        match self {
            ContextOwner::JobExecution(_) => JOB_EXECUTION_ID,
            ContextOwner::StepExecution(_) => STEP_EXECUTION_ID,
        }
    }

    fn raw_id(self) -> i64 {
        match self {
            ContextOwner::JobExecution(id) => id.get(),
            ContextOwner::StepExecution(id) => id.get(),
        }
    }

    fn filter(self) -> Filter {
        Filter::new().eq(self.key_field(), self.raw_id())
    }

    /// The owner of a saved job execution's context.
    pub fn of_job(execution: &JobExecution) -> RepositoryResult<Self> {
        execution
            .id
            .map(ContextOwner::JobExecution)
            .ok_or_else(|| RepositoryError::validation("JobExecution must be saved before its context"))
    }

    /// The owner of a saved step execution's context.
    pub fn of_step(step: &StepExecution) -> RepositoryResult<Self> {
        step.id
            .map(ContextOwner::StepExecution)
            .ok_or_else(|| RepositoryError::validation("StepExecution must be saved before its context"))
    }
}

pub struct ExecutionContextStore<S> {
    store: S,
    contexts: String,
    serializer: Arc<dyn ExecutionContextSerializer>,
}

impl<S> ExecutionContextStore<S>
where
    S: DocumentStore,
{
    pub fn new(store: S, config: &RepositoryConfig, serializer: Arc<dyn ExecutionContextSerializer>) -> Self {
        Self {
            store,
            contexts: config.collection(EXECUTION_CONTEXT_COLLECTION),
            serializer,
        }
    }

    /// The stored context, or an empty one if none was ever written.
    #[instrument(skip(self), err)]
    pub fn get(&self, owner: ContextOwner) -> RepositoryResult<ExecutionContext> {
        let Some(doc) = self.store.find_one(&self.contexts, &owner.filter())? else {
            return Ok(ExecutionContext::new());
        };
        let Some(encoded) = doc.opt_str(SERIALIZED_CONTEXT)? else {
            return Ok(ExecutionContext::new());
        };
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| RepositoryError::Serialization(format!("context for {owner:?} is not base64: {e}")))?;
        self.serializer.deserialize(&bytes)
    }

    #[instrument(skip(self, context), err)]
    pub fn save(&self, owner: ContextOwner, context: &ExecutionContext) -> RepositoryResult<()> {
        self.write(owner, context)
    }

    #[instrument(skip(self, context), err)]
    pub fn update(&self, owner: ContextOwner, context: &ExecutionContext) -> RepositoryResult<()> {
        self.write(owner, context)
    }

    /// Save the context of every step, in order.
    pub fn save_all(&self, steps: &[StepExecution]) -> RepositoryResult<()> {
        for step in steps {
            self.save(ContextOwner::of_step(step)?, &step.execution_context)?;
        }
        Ok(())
    }

    fn write(&self, owner: ContextOwner, context: &ExecutionContext) -> RepositoryResult<()> {
        context.validate()?;
        let bytes = self.serializer.serialize(context)?;
        let mut doc = Document::new();
        doc.insert(owner.key_field().into(), owner.raw_id().into());
        doc.insert(SERIALIZED_CONTEXT.into(), STANDARD.encode(&bytes).into());

        let outcome = self.store.replace_one(&self.contexts, &owner.filter(), doc, true)?;
        tracing::debug!(?owner, entries = context.len(), inserted = outcome.upserted, "execution context written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use batchrepo_store::{FindQuery, InMemoryDocumentStore};

    use super::*;
    use crate::serializer::JsonExecutionContextSerializer;

    fn store() -> (Arc<InMemoryDocumentStore>, ExecutionContextStore<Arc<InMemoryDocumentStore>>) {
        let backend = Arc::new(InMemoryDocumentStore::new());
        let contexts = ExecutionContextStore::new(
            backend.clone(),
            &RepositoryConfig::default(),
            Arc::new(JsonExecutionContextSerializer),
        );
        (backend, contexts)
    }

    #[test]
    fn missing_context_is_empty() {
        let (_, contexts) = store();
        let ctx = contexts.get(ContextOwner::JobExecution(JobExecutionId::new(1))).unwrap();
        assert!(ctx.is_empty());
    }

    #[test]
    fn non_finite_double_is_refused_and_nothing_is_written() {
        let (backend, contexts) = store();
        let owner = ContextOwner::JobExecution(JobExecutionId::new(1));

        let mut ctx = ExecutionContext::new();
        ctx.put("ratio", f64::NAN);
        assert!(matches!(contexts.save(owner, &ctx), Err(RepositoryError::Validation(_))));

        assert!(contexts.get(owner).unwrap().is_empty());
        let docs = backend.find("BatchExecutionContext", &FindQuery::default()).unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn save_then_update_overwrites_one_document() {
        let (backend, contexts) = store();
        let owner = ContextOwner::StepExecution(StepExecutionId::new(4));

        let mut ctx = ExecutionContext::new();
        ctx.put("offset", 10i64);
        contexts.save(owner, &ctx).unwrap();
        ctx.put("offset", 20i64);
        ctx.put("file", "b.csv");
        contexts.update(owner, &ctx).unwrap();

        assert_eq!(contexts.get(owner).unwrap(), ctx);
        let docs = backend.find("BatchExecutionContext", &FindQuery::default()).unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0][SERIALIZED_CONTEXT].is_string());
    }

    #[test]
    fn job_and_step_owners_do_not_collide() {
        let (_, contexts) = store();
        let mut job_ctx = ExecutionContext::new();
        job_ctx.put("scope", "job");
        let mut step_ctx = ExecutionContext::new();
        step_ctx.put("scope", "step");

        contexts.save(ContextOwner::JobExecution(JobExecutionId::new(1)), &job_ctx).unwrap();
        contexts.save(ContextOwner::StepExecution(StepExecutionId::new(1)), &step_ctx).unwrap();

        let job = contexts.get(ContextOwner::JobExecution(JobExecutionId::new(1))).unwrap();
        assert_eq!(job.get_string("scope"), Some("job"));
        let step = contexts.get(ContextOwner::StepExecution(StepExecutionId::new(1))).unwrap();
        assert_eq!(step.get_string("scope"), Some("step"));
    }

    #[test]
    fn corrupt_payload_is_a_serialization_error() {
        let (backend, contexts) = store();
        let mut doc = Document::new();
        doc.insert(JOB_EXECUTION_ID.into(), 9.into());
        doc.insert(SERIALIZED_CONTEXT.into(), "%%%".into());
        backend.insert("BatchExecutionContext", doc).unwrap();

        assert!(matches!(
            contexts.get(ContextOwner::JobExecution(JobExecutionId::new(9))),
            Err(RepositoryError::Serialization(_))
        ));
    }

    #[test]
    fn unsaved_owner_is_rejected() {
        let (_, contexts) = store();
        let step = StepExecution::new("load", JobExecutionId::new(1));
        assert!(matches!(contexts.save_all(&[step]), Err(RepositoryError::Validation(_))));
    }
}
