//! Postgres-backed document store.
//!
//! Every collection lives in one table, `batch_documents(id, collection, doc)`,
//! with the document held as JSONB. Counters live in `batch_counters`, keyed by
//! `(collection, key)`, and are bumped with a single upsert so concurrent
//! callers never observe the same value.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database | `Backend` (with the Postgres error code) |
//! | PoolClosed | `Backend` |
//! | ColumnDecode / non-object `doc` | `Codec` |
//! | Other | `Backend` |
//!
//! ## Runtime
//!
//! `DocumentStore` is synchronous. The store owns a Tokio runtime and blocks on
//! it for every call, so it must not be used from inside another async runtime.

use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tokio::runtime::Runtime;
use tracing::instrument;

use crate::document::Document;
use crate::query::{Condition, Filter, FindQuery, IndexSpec, SortOrder, UpdateOutcome};
use crate::r#trait::{DocumentStore, StoreError, StoreResult};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const MAX_IDENTIFIER_LEN: usize = 63;
const INDEX_DIGEST_LEN: usize = 12;

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Read `DATABASE_URL` and `BATCHREPO_PG_MAX_CONNECTIONS` from the process
    /// environment. Returns `None` when no database URL is configured.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let max_connections = match std::env::var("BATCHREPO_PG_MAX_CONNECTIONS") {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "invalid BATCHREPO_PG_MAX_CONNECTIONS, using default");
                DEFAULT_MAX_CONNECTIONS
            }),
            Err(_) => DEFAULT_MAX_CONNECTIONS,
        };
        Some(Self { url, max_connections })
    }
}

/// Document store on top of a single Postgres JSONB table.
///
/// ## Thread Safety
///
/// Uses the SQLx connection pool (`Send + Sync`); clones share the pool and the
/// runtime.
///
/// ## Conditional replace
///
/// `replace_one` locks the first matching row with `FOR UPDATE` inside the
/// `UPDATE` statement. Under READ COMMITTED, a row changed concurrently is
/// re-checked against the filter after the lock is acquired, so a stale
/// version filter matches nothing.
#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

impl PostgresDocumentStore {
    /// Connect and create the schema if needed.
    pub fn connect(config: &PostgresConfig) -> StoreResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| StoreError::Backend(format!("failed to start runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect(&config.url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self {
            pool,
            runtime: Arc::new(runtime),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> StoreResult<()> {
        self.runtime.block_on(async {
            for statement in [
                r#"
                CREATE TABLE IF NOT EXISTS batch_documents (
                    id BIGSERIAL PRIMARY KEY,
                    collection TEXT NOT NULL,
                    doc JSONB NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS batch_documents_collection_idx ON batch_documents (collection)",
                r#"
                CREATE TABLE IF NOT EXISTS batch_counters (
                    collection TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value BIGINT NOT NULL,
                    PRIMARY KEY (collection, key)
                )
                "#,
            ] {
                sqlx::query(statement)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            }
            Ok::<(), StoreError>(())
        })
    }

    async fn fetch_documents(&self, collection: &str, query: &FindQuery) -> StoreResult<Vec<Document>> {
        let mut sql = SqlBuilder::new();
        let collection_param = sql.bind(Bind::Text(collection.to_string()));
        sql.push(&format!("SELECT doc FROM batch_documents WHERE collection = {collection_param}"));
        sql.push_filter(&query.filter);

        sql.push(" ORDER BY ");
        for (field, order) in &query.sort {
            let field_param = sql.bind(Bind::Text(field.clone()));
            let direction = match order {
                SortOrder::Ascending => "ASC NULLS FIRST",
                SortOrder::Descending => "DESC NULLS LAST",
            };
            sql.push(&format!("doc -> {field_param}::text {direction}, "));
        }
        // Insertion order breaks ties.
        sql.push("id ASC");

        if let Some(limit) = query.limit {
            let limit_param = sql.bind(Bind::Int(to_i64(limit)?));
            sql.push(&format!(" LIMIT {limit_param}"));
        }
        if query.skip > 0 {
            let skip_param = sql.bind(Bind::Int(to_i64(query.skip)?));
            sql.push(&format!(" OFFSET {skip_param}"));
        }

        let rows = sql
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find", e))?;

        rows.iter()
            .map(|row| {
                let doc: Value = row.try_get("doc").map_err(|e| map_sqlx_error("find", e))?;
                into_document(doc)
            })
            .collect()
    }

    async fn insert_document(&self, collection: &str, document: Document) -> StoreResult<()> {
        sqlx::query("INSERT INTO batch_documents (collection, doc) VALUES ($1, $2)")
            .bind(collection)
            .bind(Value::Object(document))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(())
    }

    async fn replace_document(
        &self,
        collection: &str,
        filter: &Filter,
        replacement: Document,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if upsert {
            // Serialise upserts per collection so two misses cannot both insert.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(collection)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("advisory_lock", e))?;
        }

        let mut sql = SqlBuilder::new();
        let doc_param = sql.bind(Bind::Json(Value::Object(replacement.clone())));
        let collection_param = sql.bind(Bind::Text(collection.to_string()));
        sql.push(&format!(
            "UPDATE batch_documents SET doc = {doc_param}::jsonb WHERE id = (\
             SELECT id FROM batch_documents WHERE collection = {collection_param}"
        ));
        sql.push_filter(filter);
        sql.push(" ORDER BY id ASC LIMIT 1 FOR UPDATE)");

        let matched = sql
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_one", e))?
            .rows_affected();

        let mut outcome = UpdateOutcome {
            matched,
            upserted: false,
        };

        if matched == 0 && upsert {
            sqlx::query("INSERT INTO batch_documents (collection, doc) VALUES ($1, $2)")
                .bind(collection)
                .bind(Value::Object(replacement))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("upsert", e))?;
            outcome.upserted = true;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }

    async fn count_documents(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        let mut sql = SqlBuilder::new();
        let collection_param = sql.bind(Bind::Text(collection.to_string()));
        sql.push(&format!(
            "SELECT COUNT(*) AS total FROM batch_documents WHERE collection = {collection_param}"
        ));
        sql.push_filter(filter);

        let row = sql
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("count", e))?;
        Ok(total.max(0) as u64)
    }

    async fn distinct_values(&self, collection: &str, field: &str, filter: &Filter) -> StoreResult<Vec<Value>> {
        let mut sql = SqlBuilder::new();
        let field_param = sql.bind(Bind::Text(field.to_string()));
        let collection_param = sql.bind(Bind::Text(collection.to_string()));
        sql.push(&format!(
            "SELECT DISTINCT doc -> {field_param}::text AS value FROM batch_documents \
             WHERE collection = {collection_param} \
             AND jsonb_typeof(doc -> {field_param}::text) <> 'null'"
        ));
        sql.push_filter(filter);
        sql.push(" ORDER BY value ASC");

        let rows = sql
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("distinct", e))?;

        rows.iter()
            .map(|row| row.try_get::<Value, _>("value").map_err(|e| map_sqlx_error("distinct", e)))
            .collect()
    }

    async fn increment_counter(&self, collection: &str, key: &str) -> StoreResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO batch_counters (collection, key, value)
            VALUES ($1, $2, 1)
            ON CONFLICT (collection, key) DO UPDATE SET value = batch_counters.value + 1
            RETURNING value
            "#,
        )
        .bind(collection)
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_and_increment", e))?;

        row.try_get("value").map_err(|e| map_sqlx_error("find_and_increment", e))
    }

    async fn create_index(&self, index: &IndexSpec) -> StoreResult<()> {
        validate_name(&index.collection)?;
        for (field, _) in &index.fields {
            validate_name(field)?;
        }
        let name = index_identifier(&index.name());
        validate_identifier(&name)?;
        if index.fields.is_empty() {
            return Err(StoreError::InvalidQuery(format!("index '{name}' has no fields")));
        }

        let mut columns = Vec::with_capacity(index.fields.len());
        for (field, order) in &index.fields {
            let direction = match order {
                SortOrder::Ascending => "ASC",
                SortOrder::Descending => "DESC",
            };
            columns.push(format!("(doc -> '{field}') {direction}"));
        }

        // Identifiers are validated above; DDL cannot take bind parameters.
        let statement = format!(
            "CREATE INDEX IF NOT EXISTS {name} ON batch_documents ({}) WHERE collection = '{}'",
            columns.join(", "),
            index.collection
        );
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_index", e))?;
        Ok(())
    }
}

impl DocumentStore for PostgresDocumentStore {
    #[instrument(skip(self, document), fields(collection = %collection), err)]
    fn insert(&self, collection: &str, document: Document) -> StoreResult<()> {
        self.runtime.block_on(self.insert_document(collection, document))
    }

    #[instrument(skip(self, query), fields(collection = %collection), err)]
    fn find(&self, collection: &str, query: &FindQuery) -> StoreResult<Vec<Document>> {
        self.runtime.block_on(self.fetch_documents(collection, query))
    }

    #[instrument(skip(self, filter, replacement), fields(collection = %collection), err)]
    fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        replacement: Document,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome> {
        self.runtime
            .block_on(self.replace_document(collection, filter, replacement, upsert))
    }

    #[instrument(skip(self, filter), fields(collection = %collection), err)]
    fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        self.runtime.block_on(self.count_documents(collection, filter))
    }

    #[instrument(skip(self, filter), fields(collection = %collection, field = %field), err)]
    fn distinct(&self, collection: &str, field: &str, filter: &Filter) -> StoreResult<Vec<Value>> {
        self.runtime.block_on(self.distinct_values(collection, field, filter))
    }

    /// The counter table has a single value column; `field` only names it in
    /// the document view of other backends.
    #[instrument(skip(self), err)]
    fn find_and_increment(&self, collection: &str, key: &str, _field: &str) -> StoreResult<i64> {
        self.runtime.block_on(self.increment_counter(collection, key))
    }

    #[instrument(skip(self), fields(index = %index.name()), err)]
    fn ensure_index(&self, index: &IndexSpec) -> StoreResult<()> {
        self.runtime.block_on(self.create_index(index))
    }
}

enum Bind {
    Text(String),
    Json(Value),
    Int(i64),
}

/// Accumulates SQL text and positional bind values.
struct SqlBuilder {
    sql: String,
    binds: Vec<Bind>,
}

impl SqlBuilder {
    fn new() -> Self {
        Self {
            sql: String::new(),
            binds: Vec::new(),
        }
    }

    fn push(&mut self, fragment: &str) {
        self.sql.push_str(fragment);
    }

    /// Register a bind value and return its placeholder.
    fn bind(&mut self, value: Bind) -> String {
        self.binds.push(value);
        format!("${}", self.binds.len())
    }

    fn push_filter(&mut self, filter: &Filter) {
        for (field, condition) in filter.conditions() {
            let field_param = self.bind(Bind::Text(field.clone()));
            let target = format!("doc -> {field_param}::text");
            let clause = match condition {
                Condition::Eq(value) => {
                    let p = self.bind(Bind::Json(value.clone()));
                    format!("{target} = {p}::jsonb")
                }
                Condition::In(values) => {
                    let p = self.bind(Bind::Json(Value::Array(values.clone())));
                    format!("({target} IS NOT NULL AND {p}::jsonb @> jsonb_build_array({target}))")
                }
                Condition::IsNull => format!("({target} IS NULL OR {target} = 'null'::jsonb)"),
                Condition::Gte(value) => {
                    let p = self.bind(Bind::Json(value.clone()));
                    format!("(jsonb_typeof({target}) = jsonb_typeof({p}::jsonb) AND {target} >= {p}::jsonb)")
                }
                Condition::Lte(value) => {
                    let p = self.bind(Bind::Json(value.clone()));
                    format!("(jsonb_typeof({target}) = jsonb_typeof({p}::jsonb) AND {target} <= {p}::jsonb)")
                }
            };
            self.sql.push_str(" AND ");
            self.sql.push_str(&clause);
        }
    }

    fn build(&self) -> Query<'_, Postgres, PgArguments> {
        let mut query = sqlx::query(&self.sql);
        for bind in &self.binds {
            query = match bind {
                Bind::Text(s) => query.bind(s.as_str()),
                Bind::Json(v) => query.bind(v),
                Bind::Int(i) => query.bind(*i),
            };
        }
        query
    }
}

fn to_i64(n: usize) -> StoreResult<i64> {
    i64::try_from(n).map_err(|_| StoreError::InvalidQuery(format!("value {n} out of range")))
}

fn into_document(value: Value) -> StoreResult<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Codec(format!("stored document is not an object: {other}"))),
    }
}

fn validate_identifier(name: &str) -> StoreResult<()> {
    if name.len() <= MAX_IDENTIFIER_LEN {
        validate_name(name)
    } else {
        Err(StoreError::InvalidQuery(format!("invalid identifier '{name}'")))
    }
}

/// Names spliced into SQL text: non-empty, ASCII alphanumerics and underscores.
fn validate_name(name: &str) -> StoreResult<()> {
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidQuery(format!("invalid identifier '{name}'")))
    }
}

/// Fit an index name into a Postgres identifier.
///
/// Long names keep a readable prefix and end in a digest of the full name,
/// so the result is stable across runs and distinct names stay distinct.
fn index_identifier(name: &str) -> String {
    if name.len() <= MAX_IDENTIFIER_LEN {
        return name.to_string();
    }
    let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
    let keep = MAX_IDENTIFIER_LEN - INDEX_DIGEST_LEN - 1;
    let prefix: String = name.chars().take(keep).collect();
    format!("{prefix}_{}", &digest[..INDEX_DIGEST_LEN])
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StoreError::Backend(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => StoreError::Backend(format!("connection pool closed in {operation}")),
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::Codec(format!("failed to decode column {index} in {operation}: {source}"))
        }
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}
