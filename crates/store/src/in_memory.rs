use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use crate::document::Document;
use crate::query::{Filter, FindQuery, IndexSpec, UpdateOutcome, compare_values};
use crate::r#trait::{DocumentStore, StoreError, StoreResult};

/// In-memory document store.
///
/// Intended for tests/dev. Not optimized for performance: every query scans
/// the collection. Each call holds the lock for its whole duration, which gives
/// the per-call atomicity the trait requires.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    indexes: RwLock<Vec<IndexSpec>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes requested so far, in creation order.
    pub fn indexes(&self) -> StoreResult<Vec<IndexSpec>> {
        let indexes = self.indexes.read().map_err(|_| StoreError::Poisoned)?;
        Ok(indexes.clone())
    }

    /// Names of the collections holding at least one document.
    pub fn collection_names(&self) -> StoreResult<Vec<String>> {
        let collections = self.collections.read().map_err(|_| StoreError::Poisoned)?;
        let mut names: Vec<String> = collections
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn insert(&self, collection: &str, document: Document) -> StoreResult<()> {
        let mut collections = self.collections.write().map_err(|_| StoreError::Poisoned)?;
        collections.entry(collection.to_string()).or_default().push(document);
        Ok(())
    }

    fn find(&self, collection: &str, query: &FindQuery) -> StoreResult<Vec<Document>> {
        let collections = self.collections.read().map_err(|_| StoreError::Poisoned)?;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<&Document> = docs.iter().filter(|d| query.filter.matches(d)).collect();
        // Stable, so equal keys keep insertion order.
        matched.sort_by(|a, b| query.compare(a, b));

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched
            .into_iter()
            .skip(query.skip)
            .take(limit)
            .cloned()
            .collect())
    }

    fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        replacement: Document,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome> {
        let mut collections = self.collections.write().map_err(|_| StoreError::Poisoned)?;
        let docs = collections.entry(collection.to_string()).or_default();

        if let Some(existing) = docs.iter_mut().find(|d| filter.matches(d)) {
            *existing = replacement;
            return Ok(UpdateOutcome {
                matched: 1,
                upserted: false,
            });
        }

        if upsert {
            docs.push(replacement);
            return Ok(UpdateOutcome {
                matched: 0,
                upserted: true,
            });
        }

        Ok(UpdateOutcome::default())
    }

    fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        let collections = self.collections.read().map_err(|_| StoreError::Poisoned)?;
        Ok(collections
            .get(collection)
            .map(|docs| docs.iter().filter(|d| filter.matches(d)).count() as u64)
            .unwrap_or(0))
    }

    fn distinct(&self, collection: &str, field: &str, filter: &Filter) -> StoreResult<Vec<Value>> {
        let collections = self.collections.read().map_err(|_| StoreError::Poisoned)?;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut values: Vec<Value> = Vec::new();
        for doc in docs.iter().filter(|d| filter.matches(d)) {
            let Some(value) = doc.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            if !values.iter().any(|v| v == value) {
                values.push(value.clone());
            }
        }
        values.sort_by(compare_values);
        Ok(values)
    }

    fn find_and_increment(&self, collection: &str, key: &str, field: &str) -> StoreResult<i64> {
        let mut collections = self.collections.write().map_err(|_| StoreError::Poisoned)?;
        let docs = collections.entry(collection.to_string()).or_default();

        let id = Value::String(key.to_string());
        if let Some(doc) = docs.iter_mut().find(|d| d.get("_id") == Some(&id)) {
            let current = match doc.get(field) {
                None | Some(Value::Null) => 0,
                Some(v) => v.as_i64().ok_or_else(|| {
                    StoreError::Codec(format!("counter '{key}.{field}' is not an integer: {v}"))
                })?,
            };
            let next = current
                .checked_add(1)
                .ok_or_else(|| StoreError::Backend(format!("counter '{key}' overflowed")))?;
            doc.insert(field.to_string(), Value::from(next));
            return Ok(next);
        }

        let mut doc = Document::new();
        doc.insert("_id".to_string(), id);
        doc.insert(field.to_string(), Value::from(1));
        docs.push(doc);
        Ok(1)
    }

    fn ensure_index(&self, index: &IndexSpec) -> StoreResult<()> {
        let mut indexes = self.indexes.write().map_err(|_| StoreError::Poisoned)?;
        if !indexes.iter().any(|i| i.name() == index.name()) {
            indexes.push(index.clone());
        }
        Ok(())
    }
}
