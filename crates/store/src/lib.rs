//! `batchrepo-store`: document-store boundary.
//!
//! The job repository persists plain JSON documents grouped into named
//! collections. This crate defines the operations it needs from a backend
//! (`DocumentStore`) without making storage assumptions, plus two backends:
//!
//! - [`InMemoryDocumentStore`] for tests and local runs
//! - [`PostgresDocumentStore`] keeping every document in a single JSONB table

pub mod document;
pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use document::{Document, DocumentExt, datetime_value, parse_datetime};
pub use in_memory::InMemoryDocumentStore;
pub use postgres::{PostgresConfig, PostgresDocumentStore};
pub use query::{Condition, Filter, FindQuery, IndexSpec, SortOrder, UpdateOutcome, compare_values};
pub use r#trait::{DocumentStore, StoreError, StoreResult};
