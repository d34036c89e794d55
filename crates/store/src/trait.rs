use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::document::Document;
use crate::query::{Filter, FindQuery, IndexSpec, UpdateOutcome};

/// Document store operation error.
///
/// These are **infrastructure errors** (backend failures, malformed documents,
/// unsupported queries) as opposed to repository errors such as optimistic
/// lock conflicts, which the layer above derives from `UpdateOutcome`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("document codec error: {0}")]
    Codec(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Schemaless store of JSON documents grouped into named collections.
///
/// ## Atomicity
///
/// Every single call is atomic with respect to other calls on the same store:
///
/// - `replace_one` matches and replaces one document in one step, so a filter
///   on `(id, version)` acts as a compare-and-set
/// - `find_and_increment` never hands out the same value twice
///
/// Nothing spans more than one call; there are no multi-document transactions.
///
/// ## Ordering
///
/// Values compare numerically when both are numbers and lexicographically when
/// both are strings. Missing fields and `null` sort lowest. Documents with equal
/// sort keys keep insertion order.
pub trait DocumentStore: Send + Sync {
    fn insert(&self, collection: &str, document: Document) -> StoreResult<()>;

    /// Documents matching the query, sorted, skipped and limited.
    fn find(&self, collection: &str, query: &FindQuery) -> StoreResult<Vec<Document>>;

    /// First matching document in insertion order.
    fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Option<Document>> {
        let query = FindQuery::new(filter.clone()).limit(1);
        Ok(self.find(collection, &query)?.into_iter().next())
    }

    /// Replace the first document matching `filter` with `replacement`.
    ///
    /// With `upsert`, a missing match inserts `replacement` instead.
    fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        replacement: Document,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome>;

    fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64>;

    /// Distinct non-null values of `field` among matching documents, ascending.
    fn distinct(&self, collection: &str, field: &str, filter: &Filter) -> StoreResult<Vec<Value>>;

    /// Atomically increment the counter `field` of the document whose `_id` is
    /// `key`, creating it at 1 when absent. Returns the new value.
    fn find_and_increment(&self, collection: &str, key: &str, field: &str) -> StoreResult<i64>;

    /// Create the index if it does not exist yet.
    fn ensure_index(&self, index: &IndexSpec) -> StoreResult<()>;
}

impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    fn insert(&self, collection: &str, document: Document) -> StoreResult<()> {
        (**self).insert(collection, document)
    }

    fn find(&self, collection: &str, query: &FindQuery) -> StoreResult<Vec<Document>> {
        (**self).find(collection, query)
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Option<Document>> {
        (**self).find_one(collection, filter)
    }

    fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        replacement: Document,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome> {
        (**self).replace_one(collection, filter, replacement, upsert)
    }

    fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        (**self).count(collection, filter)
    }

    fn distinct(&self, collection: &str, field: &str, filter: &Filter) -> StoreResult<Vec<Value>> {
        (**self).distinct(collection, field, filter)
    }

    fn find_and_increment(&self, collection: &str, key: &str, field: &str) -> StoreResult<i64> {
        (**self).find_and_increment(collection, key, field)
    }

    fn ensure_index(&self, index: &IndexSpec) -> StoreResult<()> {
        (**self).ensure_index(index)
    }
}
