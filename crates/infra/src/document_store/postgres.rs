//! Postgres-backed document store.
//!
//! Each collection is a table with one row per job document. The atomic
//! primitive the lease protocol relies on is a single statement:
//!
//! ```sql
//! UPDATE <collection> SET ...
//! WHERE id = (
//!     SELECT id FROM <collection> WHERE <filter>
//!     ORDER BY sequence ASC LIMIT 1
//!     FOR UPDATE SKIP LOCKED
//! )
//! RETURNING ...
//! ```
//!
//! The row lock taken by the sub-select makes selection and mutation one step:
//! a concurrent claimer either skips the locked row or, once the first update
//! commits, re-evaluates the filter against the updated row. `NOW()` is the
//! server's transaction time, so lease arithmetic never uses a worker's clock.
//!
//! ## Error Mapping
//!
//! | SQLx error | SQLSTATE | StoreError |
//! |------------|----------|------------|
//! | Database | `40001`, `40P01` (serialization, deadlock) | `Unavailable` |
//! | Database | `08***`, `53***`, `57P0*` (connection, resources, shutdown) | `Unavailable` |
//! | Database | `57014` (statement timeout) | `Timeout` |
//! | Database | any other | `InvalidQuery` |
//! | PoolTimedOut | N/A | `Timeout` |
//! | PoolClosed, Io, Tls, Protocol | N/A | `Unavailable` |
//! | ColumnDecode, ColumnNotFound, Decode | N/A | `Decode` |
//! | any failure while committing | N/A | `WriteConcern` (outcome unknown) |
//!
//! ## Blocking Bridge
//!
//! [`DocumentStore`] is synchronous. This store owns a small tokio runtime and
//! drives sqlx on it with `block_on`, so the trait methods must not be called
//! from inside another async runtime; they return `StoreError::Unavailable`
//! instead of panicking if they are. Async callers use the inherent `async`
//! methods directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::{Query, QueryScalar};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::{debug, instrument};
use uuid::Uuid;

use docq_core::{JobDocument, JobId, NewJob, Payload};

use super::collection::{CollectionName, WriteConcern};
use super::query::{Filter, Reservation, SortOrder, TimeRef, Update};
use super::r#trait::{DocumentStore, StoreError};

/// Upper bound for intervals sent to Postgres (1,000 years). `NOW()` minus
/// this stays well inside the `timestamptz` range (4713 BC to 294276 AD),
/// so an oversized lease degrades to "never expires" instead of an
/// out-of-range error.
const MAX_INTERVAL_SECS: f64 = 31_536_000_000.0;

const DOCUMENT_COLUMNS: &str =
    "id, sequence, queue, payload, attempts, reserved_at, available_at, created_at";

/// Postgres-backed job document store.
///
/// Cheap to clone; clones share the pool and the runtime.
#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    runtime: Arc<Runtime>,
    write_concern: WriteConcern,
}

impl PostgresDocumentStore {
    /// Connect to `database_url` on a dedicated runtime.
    pub fn connect(database_url: &str, write_concern: WriteConcern) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("docq-postgres")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to start runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(8)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::with_pool(pool, Arc::new(runtime), write_concern))
    }

    /// Wrap an existing pool. `runtime` must be the runtime the pool was
    /// created on.
    pub fn with_pool(pool: PgPool, runtime: Arc<Runtime>, write_concern: WriteConcern) -> Self {
        Self {
            pool,
            runtime,
            write_concern,
        }
    }

    pub fn write_concern(&self) -> WriteConcern {
        self.write_concern
    }

    /// Create the collection's table and indexes if they do not exist.
    #[instrument(skip(self), fields(collection = %collection), err)]
    pub async fn create_collection(&self, collection: &CollectionName) -> Result<(), StoreError> {
        let table = collection.quoted();
        let sequence_idx = collection.quoted_with_suffix("_queue_sequence_idx");
        let reserved_idx = collection.quoted_with_suffix("_queue_reserved_idx");
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id UUID PRIMARY KEY,
                    sequence BIGSERIAL NOT NULL UNIQUE,
                    queue TEXT NOT NULL,
                    payload BYTEA NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
                    reserved_at TIMESTAMPTZ NULL,
                    available_at TIMESTAMPTZ NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#
            ),
            format!("CREATE INDEX IF NOT EXISTS {sequence_idx} ON {table} (queue, sequence)"),
            format!("CREATE INDEX IF NOT EXISTS {reserved_idx} ON {table} (queue, reserved_at)"),
        ];

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("create_collection", e))?;
        }
        Ok(())
    }

    /// Blocking variant of [`create_collection`](Self::create_collection).
    pub fn ensure_collection(&self, collection: &CollectionName) -> Result<(), StoreError> {
        self.block_on(self.create_collection(collection))
    }

    #[instrument(skip(self, job), fields(collection = %collection, queue = %job.queue), err)]
    pub async fn insert_job(
        &self,
        collection: &CollectionName,
        job: NewJob,
    ) -> Result<JobDocument, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {table} (id, queue, payload, attempts, available_at, created_at)
            VALUES ($1, $2, $3, 0, NOW() + make_interval(secs => $4), NOW())
            RETURNING {DOCUMENT_COLUMNS}
            "#,
            table = collection.quoted(),
        );

        let mut tx = self.begin_write().await?;
        let row = sqlx::query(&sql)
            .bind(*JobId::new().as_uuid())
            .bind(job.queue)
            .bind(job.payload.into_bytes())
            .bind(interval_secs(job.delay))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;
        commit(tx).await?;

        decode_document(&row)
    }

    #[instrument(skip(self, filter, update), fields(collection = %collection, sort = ?sort), err)]
    pub async fn find_one_and_update(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        update: &Update,
        sort: SortOrder,
    ) -> Result<Option<JobDocument>, StoreError> {
        let statement = find_and_update_statement(collection, filter, update, sort);

        let mut tx = self.begin_write().await?;
        let row = bind_all(sqlx::query(&statement.sql), statement.values)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("find_and_update", e))?;
        commit(tx).await?;

        let doc = row.as_ref().map(decode_document).transpose()?;
        debug!(matched = doc.is_some(), "find_and_update");
        Ok(doc)
    }

    #[instrument(skip(self, filter), fields(collection = %collection), err)]
    pub async fn find_documents(
        &self,
        collection: &CollectionName,
        filter: &Filter,
    ) -> Result<Vec<JobDocument>, StoreError> {
        let mut statement = SqlStatement::default();
        let predicate = statement.filter(filter);
        statement.sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM {table} WHERE {predicate} ORDER BY sequence ASC",
            table = collection.quoted(),
        );

        let rows = bind_all(sqlx::query(&statement.sql), statement.values)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_many", e))?;

        rows.iter().map(decode_document).collect()
    }

    #[instrument(skip(self, filter), fields(collection = %collection), err)]
    pub async fn count_documents(
        &self,
        collection: &CollectionName,
        filter: &Filter,
    ) -> Result<usize, StoreError> {
        let statement = count_statement(collection, filter);

        let count: i64 = bind_scalar(sqlx::query_scalar(&statement.sql), statement.values)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;

        usize::try_from(count).map_err(|_| StoreError::Decode(format!("invalid count {count}")))
    }

    #[instrument(skip(self), fields(collection = %collection, job_id = %id), err)]
    pub async fn delete_document(
        &self,
        collection: &CollectionName,
        id: JobId,
    ) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {table} WHERE id = $1", table = collection.quoted());

        let mut tx = self.begin_write().await?;
        let result = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_by_id", e))?;
        commit(tx).await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        sqlx::query_scalar::<_, DateTime<Utc>>("SELECT NOW()")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("server_time", e))
    }

    /// Open a transaction whose commit waits for the configured durability.
    async fn begin_write(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let set = format!(
            "SET LOCAL synchronous_commit TO '{}'",
            self.write_concern.synchronous_commit()
        );
        sqlx::query(&set)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_write_concern", e))?;

        Ok(tx)
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(StoreError::Unavailable(
                "PostgresDocumentStore's blocking API was called from an async runtime; use the async methods instead".to_string(),
            ));
        }
        self.runtime.block_on(fut)
    }
}

impl DocumentStore for PostgresDocumentStore {
    fn insert(&self, collection: &CollectionName, job: NewJob) -> Result<JobDocument, StoreError> {
        self.block_on(self.insert_job(collection, job))
    }

    fn find_and_update(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        update: &Update,
        sort: SortOrder,
    ) -> Result<Option<JobDocument>, StoreError> {
        self.block_on(self.find_one_and_update(collection, filter, update, sort))
    }

    fn find_many(
        &self,
        collection: &CollectionName,
        filter: &Filter,
    ) -> Result<Vec<JobDocument>, StoreError> {
        self.block_on(self.find_documents(collection, filter))
    }

    fn count(&self, collection: &CollectionName, filter: &Filter) -> Result<usize, StoreError> {
        self.block_on(self.count_documents(collection, filter))
    }

    fn delete_by_id(&self, collection: &CollectionName, id: JobId) -> Result<bool, StoreError> {
        self.block_on(self.delete_document(collection, id))
    }

    fn server_time(&self) -> Result<DateTime<Utc>, StoreError> {
        self.block_on(self.now())
    }

    fn durability(&self) -> Option<WriteConcern> {
        Some(self.write_concern)
    }
}

async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), StoreError> {
    tx.commit().await.map_err(|e| match map_sqlx_error("commit", e) {
        StoreError::Unavailable(msg) | StoreError::Timeout(msg) => StoreError::WriteConcern(msg),
        other => other,
    })
}

// SQL compilation

#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Seconds(f64),
    Int(i32),
}

#[derive(Debug, Default)]
struct SqlStatement {
    sql: String,
    values: Vec<SqlValue>,
}

impl SqlStatement {
    fn push(&mut self, value: SqlValue) -> String {
        self.values.push(value);
        format!("${}", self.values.len())
    }

    fn time(&mut self, t: &TimeRef) -> String {
        match *t {
            TimeRef::Now => "NOW()".to_string(),
            TimeRef::NowMinus(d) => {
                let p = self.push(SqlValue::Seconds(interval_secs(d)));
                format!("(NOW() - make_interval(secs => {p}))")
            }
            TimeRef::NowPlus(d) => {
                let p = self.push(SqlValue::Seconds(interval_secs(d)));
                format!("(NOW() + make_interval(secs => {p}))")
            }
            TimeRef::At(at) => self.push(SqlValue::Timestamp(at)),
        }
    }

    fn filter(&mut self, filter: &Filter) -> String {
        match filter {
            Filter::Queue(name) => format!("queue = {}", self.push(SqlValue::Text(name.clone()))),
            Filter::Id(id) => format!("id = {}", self.push(SqlValue::Uuid(*id.as_uuid()))),
            Filter::Unreserved => "reserved_at IS NULL".to_string(),
            Filter::ReservedAt(at) => {
                format!("reserved_at = {}", self.push(SqlValue::Timestamp(*at)))
            }
            Filter::ReservedAtOrBefore(t) => format!("reserved_at <= {}", self.time(t)),
            Filter::AvailableAtOrBefore(t) => format!("available_at <= {}", self.time(t)),
            Filter::And(children) => self.join(children, " AND ", "TRUE"),
            Filter::Or(children) => self.join(children, " OR ", "FALSE"),
        }
    }

    fn join(&mut self, children: &[Filter], op: &str, empty: &str) -> String {
        if children.is_empty() {
            return empty.to_string();
        }
        let parts: Vec<String> = children.iter().map(|c| self.filter(c)).collect();
        format!("({})", parts.join(op))
    }

    fn assignments(&mut self, update: &Update) -> String {
        let mut set = Vec::new();
        match &update.reserved_at {
            Some(Reservation::Set(t)) => set.push(format!("reserved_at = {}", self.time(t))),
            Some(Reservation::Clear) => set.push("reserved_at = NULL".to_string()),
            None => {}
        }
        if let Some(t) = &update.available_at {
            set.push(format!("available_at = {}", self.time(t)));
        }
        if update.inc_attempts > 0 {
            let by = i32::try_from(update.inc_attempts).unwrap_or(i32::MAX);
            set.push(format!("attempts = attempts + {}", self.push(SqlValue::Int(by))));
        }
        if set.is_empty() {
            // Postgres needs at least one assignment; this one changes nothing.
            set.push("attempts = attempts".to_string());
        }
        set.join(", ")
    }
}

fn find_and_update_statement(
    collection: &CollectionName,
    filter: &Filter,
    update: &Update,
    sort: SortOrder,
) -> SqlStatement {
    let mut statement = SqlStatement::default();
    let assignments = statement.assignments(update);
    let predicate = statement.filter(filter);
    let direction = sort.sql_direction();
    statement.sql = format!(
        r#"
        UPDATE {table}
        SET {assignments}
        WHERE id = (
            SELECT id FROM {table}
            WHERE {predicate}
            ORDER BY sequence {direction}
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {DOCUMENT_COLUMNS}
        "#,
        table = collection.quoted(),
    );
    statement
}

fn count_statement(collection: &CollectionName, filter: &Filter) -> SqlStatement {
    let mut statement = SqlStatement::default();
    let predicate = statement.filter(filter);
    statement.sql = format!(
        "SELECT COUNT(*) FROM {table} WHERE {predicate}",
        table = collection.quoted(),
    );
    statement
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    values: Vec<SqlValue>,
) -> Query<'q, Postgres, PgArguments> {
    for value in values {
        query = match value {
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Uuid(v) => query.bind(v),
            SqlValue::Timestamp(v) => query.bind(v),
            SqlValue::Seconds(v) => query.bind(v),
            SqlValue::Int(v) => query.bind(v),
        };
    }
    query
}

fn bind_scalar<'q>(
    mut query: QueryScalar<'q, Postgres, i64, PgArguments>,
    values: Vec<SqlValue>,
) -> QueryScalar<'q, Postgres, i64, PgArguments> {
    for value in values {
        query = match value {
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Uuid(v) => query.bind(v),
            SqlValue::Timestamp(v) => query.bind(v),
            SqlValue::Seconds(v) => query.bind(v),
            SqlValue::Int(v) => query.bind(v),
        };
    }
    query
}

fn interval_secs(d: Duration) -> f64 {
    d.as_secs_f64().min(MAX_INTERVAL_SECS)
}

fn decode_document(row: &PgRow) -> Result<JobDocument, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Decode(format!("failed to read job row: {e}"));

    let id: Uuid = row.try_get("id").map_err(decode)?;
    let sequence: i64 = row.try_get("sequence").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    let payload: Vec<u8> = row.try_get("payload").map_err(decode)?;

    Ok(JobDocument {
        id: JobId::from_uuid(id),
        sequence: u64::try_from(sequence)
            .map_err(|_| StoreError::Decode(format!("negative sequence {sequence}")))?,
        queue: row.try_get("queue").map_err(decode)?,
        payload: Payload::new(payload),
        attempts: u32::try_from(attempts)
            .map_err(|_| StoreError::Decode(format!("negative attempts {attempts}")))?,
        reserved_at: row.try_get("reserved_at").map_err(decode)?,
        available_at: row.try_get("available_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") => StoreError::Unavailable(msg),
                Some("57014") => StoreError::Timeout(msg),
                Some(code)
                    if code.starts_with("08") || code.starts_with("53") || code.starts_with("57P0") =>
                {
                    StoreError::Unavailable(msg)
                }
                _ => StoreError::InvalidQuery(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Timeout(format!("timed out acquiring a connection in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::Protocol(e) => {
            StoreError::Unavailable(format!("protocol error in {operation}: {e}"))
        }
        e @ (sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_)) => StoreError::Decode(format!("{operation}: {e}")),
        _ => StoreError::InvalidQuery(format!("sqlx error in {}: {}", operation, err)),
    }
}
