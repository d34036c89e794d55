//! Optimistically locked records.

/// A record persisted under optimistic locking.
///
/// The store assigns `id` and sets `version` to 0 on first save; every
/// successful update moves the version forward by exactly one. An update must
/// present the version it last read.
pub trait Versioned {
    /// Entity name used in conflict reports.
    const ENTITY: &'static str;

    /// Raw store identifier, `None` until the record was saved.
    fn raw_id(&self) -> Option<i64>;

    /// Version last read from (or written to) the store.
    fn version(&self) -> Option<u32>;

    fn set_version(&mut self, version: u32);

    /// Advance the in-memory version after a successful write.
    ///
    /// An unsaved record moves to version 0.
    fn increment_version(&mut self) {
        let next = self.version().map_or(0, |v| v + 1);
        self.set_version(next);
    }
}
