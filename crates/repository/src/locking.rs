//! Optimistic update protocol.
//!
//! An update is a conditional replace on `(id, version)` that writes
//! `version + 1`. A miss is resolved by re-reading the record by id alone:
//! absent means the record was never saved, present means someone else
//! updated it first. Within a process, updates to one id are also serialised
//! by a per-id mutex so two threads sharing a handle cannot interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use batchrepo_core::Versioned;
use batchrepo_store::{Document, DocumentExt, DocumentStore, Filter};

use crate::error::{RepositoryError, RepositoryResult};
use crate::schema::VERSION;

/// Registry of per-id mutexes.
///
/// Entries are dropped once no thread holds or waits for them.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the mutex for `id`.
    ///
    /// A panic inside `f` poisons nothing for later callers: the per-id
    /// mutex guards no data, so a poisoned one is taken over as is, and the
    /// entry is pruned on unwind like on a normal return.
    pub fn with_lock<T>(&self, id: i64, f: impl FnOnce() -> RepositoryResult<T>) -> RepositoryResult<T> {
        let release = Release {
            registry: self,
            id,
            entry: self.registry().entry(id).or_default().clone(),
        };
        let _guard = release.entry.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<i64, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of ids currently tracked.
    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drops the registry entry for `id` once nobody else holds or waits for it.
///
/// Declared before the mutex guard in `with_lock`, so it runs after the guard
/// is released, on return and on unwind alike.
struct Release<'a> {
    registry: &'a KeyedLocks,
    id: i64,
    entry: Arc<Mutex<()>>,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        let mut locks = self.registry.registry();
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.entry) == 2 {
            locks.remove(&self.id);
        }
    }
}

/// Read the `version` field of a stored record.
pub(crate) fn stored_version(doc: &Document) -> RepositoryResult<u32> {
    let raw = doc.require_i64(VERSION)?;
    u32::try_from(raw).map_err(|_| RepositoryError::integrity(format!("stored version {raw} is out of range")))
}

/// Apply the optimistic update protocol to `record`.
///
/// `to_document` renders the record as it should be stored at the given
/// (already incremented) version. On success the record's in-memory version
/// is advanced by one.
pub(crate) fn optimistic_update<S, T>(
    store: &S,
    locks: &KeyedLocks,
    collection: &str,
    id_field: &str,
    record: &mut T,
    to_document: impl Fn(&T, u32) -> Document,
) -> RepositoryResult<()>
where
    S: DocumentStore,
    T: Versioned,
{
    let id = record
        .raw_id()
        .ok_or_else(|| RepositoryError::validation(format!("{} must be saved before it is updated", T::ENTITY)))?;
    let attempted = record
        .version()
        .ok_or_else(|| RepositoryError::validation(format!("{} {id} has no version", T::ENTITY)))?;

    locks.with_lock(id, || {
        let target = attempted
            .checked_add(1)
            .ok_or_else(|| RepositoryError::integrity(format!("{} {id} version overflow", T::ENTITY)))?;
        let document = to_document(record, target);
        let filter = Filter::new()
            .eq(id_field, id)
            .eq(VERSION, Value::from(attempted));

        let outcome = store.replace_one(collection, &filter, document, false)?;
        if outcome.matched == 0 {
            let by_id = Filter::new().eq(id_field, id);
            return match store.find_one(collection, &by_id)? {
                None => Err(RepositoryError::NotFound(format!(
                    "{} {id} was never saved",
                    T::ENTITY
                ))),
                Some(stored) => {
                    let current = stored_version(&stored)?;
                    tracing::debug!(entity = T::ENTITY, id, attempted, current, "optimistic lock conflict");
                    Err(RepositoryError::OptimisticLock {
                        entity: T::ENTITY,
                        id,
                        attempted,
                        current,
                    })
                }
            };
        }

        record.set_version(target);
        Ok(())
    })
}
