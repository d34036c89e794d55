//! Identifier issuance.
//!
//! Each entity kind draws ids from its own named sequence, stored as one
//! counter document per sequence. Increments are atomic in the store, so ids
//! are unique across threads and processes without any transaction. An id
//! drawn by an operation that later fails is never handed out again.

use std::sync::Arc;

use batchrepo_store::DocumentStore;

use crate::config::RepositoryConfig;
use crate::error::RepositoryResult;
use crate::schema::{SEQUENCE_COLLECTION, SEQUENCE_VALUE};

/// Source of identifiers for one sequence.
pub trait IdGenerator: Send + Sync {
    /// Next value of the sequence; the first call returns 1.
    fn next_id(&self) -> RepositoryResult<i64>;

    /// Next value as a string, left-padded with zeros to the configured width.
    fn next_string(&self) -> RepositoryResult<String>;
}

/// Produces one [`IdGenerator`] per sequence name.
pub trait IdGeneratorFactory: Send + Sync {
    fn generator(&self, sequence: &str) -> Arc<dyn IdGenerator>;
}

/// [`IdGenerator`] backed by [`DocumentStore::find_and_increment`].
#[derive(Debug, Clone)]
pub struct DocumentIdGenerator<S> {
    store: S,
    collection: String,
    sequence: String,
    padding: usize,
}

impl<S> DocumentIdGenerator<S> {
    pub fn new(store: S, collection: impl Into<String>, sequence: impl Into<String>, padding: usize) -> Self {
        Self {
            store,
            collection: collection.into(),
            sequence: sequence.into(),
            padding,
        }
    }
}

impl<S> IdGenerator for DocumentIdGenerator<S>
where
    S: DocumentStore,
{
    fn next_id(&self) -> RepositoryResult<i64> {
        let id = self
            .store
            .find_and_increment(&self.collection, &self.sequence, SEQUENCE_VALUE)?;
        tracing::trace!(sequence = %self.sequence, id, "issued id");
        Ok(id)
    }

    fn next_string(&self) -> RepositoryResult<String> {
        let id = self.next_id()?;
        Ok(format!("{id:0>width$}", width = self.padding))
    }
}

/// Default factory: sequences live in `<prefix>Sequence` of the same store.
#[derive(Debug, Clone)]
pub struct DocumentIdGeneratorFactory<S> {
    store: S,
    collection: String,
    padding: usize,
}

impl<S> DocumentIdGeneratorFactory<S> {
    pub fn new(store: S, config: &RepositoryConfig) -> Self {
        Self {
            store,
            collection: config.collection(SEQUENCE_COLLECTION),
            padding: config.id_padding,
        }
    }
}

impl<S> IdGeneratorFactory for DocumentIdGeneratorFactory<S>
where
    S: DocumentStore + Clone + 'static,
{
    fn generator(&self, sequence: &str) -> Arc<dyn IdGenerator> {
        Arc::new(DocumentIdGenerator::new(
            self.store.clone(),
            self.collection.clone(),
            sequence,
            self.padding,
        ))
    }
}
