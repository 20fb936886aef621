//! Table store abstraction + Postgres and in-memory backends for the TDP loader.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder};
use tdp_core::{Batch, ColumnType, DatasetRef, Record, ScalarValue, TableRef, TableSchema};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "tdp-storage";

/// Postgres accepts at most this many bind parameters per statement.
const PG_MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreOperation {
    DatasetExists,
    CreateDataset,
    TableExists,
    CreateTable,
    LoadRows,
    ExecuteMerge,
    DeleteTable,
    RowCount,
}

impl StoreOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DatasetExists => "dataset_exists",
            Self::CreateDataset => "create_dataset",
            Self::TableExists => "table_exists",
            Self::CreateTable => "create_table",
            Self::LoadRows => "load_rows",
            Self::ExecuteMerge => "execute_merge",
            Self::DeleteTable => "delete_table",
            Self::RowCount => "row_count",
        }
    }
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {path} not found")]
    NotFound { kind: &'static str, path: String },
    #[error("{kind} {path} already exists")]
    AlreadyExists { kind: &'static str, path: String },
    #[error("{operation} exceeded its deadline")]
    DeadlineExceeded { operation: StoreOperation },
    #[error("container {expected} does not match connected database {actual}")]
    ContainerMismatch { expected: String, actual: String },
    #[error("injected failure during {operation} on {target}")]
    Injected {
        operation: StoreOperation,
        target: String,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// How a load treats rows already in the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    /// Replace the table contents with the batch.
    Truncate,
    /// Add the batch to whatever is there.
    Append,
}

/// Point in time after which store calls give up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn unbounded() -> Self {
        Self { at: None }
    }

    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Some(Instant::now() + timeout),
        }
    }

    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Runs `fut`, abandoning it once the deadline passes.
    pub async fn run<T, F>(&self, operation: StoreOperation, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match self.at {
            None => fut.await,
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| StoreError::DeadlineExceeded { operation })?,
        }
    }
}

/// Store-agnostic description of one upsert statement.
///
/// Matched rows are updated only when some compared column differs, using
/// null-safe comparison. Unmatched source rows are inserted. Destination rows
/// without a source match are left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub destination: TableRef,
    pub source: TableRef,
    pub key_column: String,
    pub compare_columns: Vec<String>,
    pub insert_columns: Vec<String>,
}

impl MergePlan {
    pub fn for_schema(destination: TableRef, source: TableRef, schema: &TableSchema) -> Self {
        Self {
            destination,
            source,
            key_column: schema.key_column().name.clone(),
            compare_columns: schema.non_key_columns().map(|c| c.name.clone()).collect(),
            insert_columns: schema.columns().iter().map(|c| c.name.clone()).collect(),
        }
    }

    /// Compiles to a single Postgres 15+ `MERGE` statement.
    pub fn to_postgres_sql(&self) -> String {
        let key = quote_ident(&self.key_column);
        let mut sql = format!(
            "MERGE INTO {} AS target\nUSING {} AS source\nON target.{key} = source.{key}\n",
            qualified_name(&self.destination),
            qualified_name(&self.source),
        );

        if !self.compare_columns.is_empty() {
            let changed = self
                .compare_columns
                .iter()
                .map(|c| {
                    let qc = quote_ident(c);
                    format!("target.{qc} IS DISTINCT FROM source.{qc}")
                })
                .collect::<Vec<_>>()
                .join("\n    OR ");
            let assignments = self
                .compare_columns
                .iter()
                .map(|c| {
                    let qc = quote_ident(c);
                    format!("{qc} = source.{qc}")
                })
                .collect::<Vec<_>>()
                .join(",\n    ");
            sql.push_str(&format!(
                "WHEN MATCHED AND (\n    {changed}\n) THEN\n  UPDATE SET\n    {assignments}\n"
            ));
        }

        let columns = self
            .insert_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>();
        let values = columns
            .iter()
            .map(|qc| format!("source.{qc}"))
            .collect::<Vec<_>>();
        sql.push_str(&format!(
            "WHEN NOT MATCHED THEN\n  INSERT ({})\n  VALUES ({})",
            columns.join(", "),
            values.join(", ")
        ));
        sql
    }
}

/// The remote operations the loader issues. Every call blocks until the store
/// confirms completion.
#[async_trait]
pub trait TableStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn dataset_exists(&self, dataset: &DatasetRef) -> Result<bool, StoreError>;

    async fn create_dataset(&self, dataset: &DatasetRef, location: &str) -> Result<(), StoreError>;

    async fn table_exists(&self, table: &TableRef) -> Result<bool, StoreError>;

    async fn create_table(&self, table: &TableRef, schema: &TableSchema) -> Result<(), StoreError>;

    /// Returns the number of rows written.
    async fn load_rows(
        &self,
        table: &TableRef,
        batch: &Batch,
        disposition: WriteDisposition,
    ) -> Result<u64, StoreError>;

    async fn execute_merge(&self, plan: &MergePlan) -> Result<(), StoreError>;

    /// Idempotent delete; returns whether a table was actually removed.
    async fn delete_table_if_exists(&self, table: &TableRef) -> Result<bool, StoreError>;

    async fn row_count(&self, table: &TableRef) -> Result<u64, StoreError>;
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Postgres cannot address another database, so the container is checked
/// separately and only `schema.table` appears in statements.
pub fn qualified_name(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.dataset), quote_ident(&table.table))
}

pub fn postgres_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::String | ColumnType::Json => "TEXT",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Integer => "BIGINT",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Timestamp => "TIMESTAMPTZ",
        ColumnType::Date => "DATE",
    }
}

pub fn create_table_sql(table: &TableRef, schema: &TableSchema) -> String {
    let columns = schema
        .columns()
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("{} {}{}", quote_ident(&c.name), postgres_type(c.column_type), null)
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({})", qualified_name(table), columns)
}

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub insert_chunk_rows: usize,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
            insert_chunk_rows: 500,
        }
    }
}

/// Postgres backend: container = database, dataset = schema.
///
/// Truncating loads run in one transaction. Appending loads commit chunk by
/// chunk, so a failed append can leave earlier chunks in place.
#[derive(Debug, Clone)]
pub struct PgTableStore {
    pool: PgPool,
    insert_chunk_rows: usize,
}

impl PgTableStore {
    pub async fn connect(database_url: &str, config: PgStoreConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::from_pool(pool).with_insert_chunk_rows(config.insert_chunk_rows))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            insert_chunk_rows: PgStoreConfig::default().insert_chunk_rows,
        }
    }

    pub fn with_insert_chunk_rows(mut self, rows: usize) -> Self {
        self.insert_chunk_rows = rows.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn chunk_rows(&self, schema: &TableSchema) -> usize {
        chunk_rows_for(self.insert_chunk_rows, schema.len())
    }

    async fn check_container(&self, container: &str) -> Result<(), StoreError> {
        let actual: String = sqlx::query_scalar("SELECT current_database()")
            .fetch_one(&self.pool)
            .await?;
        if actual != container {
            return Err(StoreError::ContainerMismatch {
                expected: container.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

fn chunk_rows_for(configured: usize, column_count: usize) -> usize {
    configured
        .min(PG_MAX_BIND_PARAMS / column_count.max(1))
        .max(1)
}

fn classify_pg_error(err: sqlx::Error, kind: &'static str, path: String) -> StoreError {
    let code = match &err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    };
    match code.as_deref() {
        // duplicate_table, duplicate_schema
        Some("42P07") | Some("42P06") => StoreError::AlreadyExists { kind, path },
        // undefined_table, invalid_schema_name
        Some("42P01") | Some("3F000") => StoreError::NotFound { kind, path },
        _ => StoreError::Database(err),
    }
}

fn bind_value(row: &mut Separated<'_, '_, Postgres, &'static str>, column_type: ColumnType, value: &ScalarValue) {
    match value {
        ScalarValue::String(s) | ScalarValue::Json(s) => row.push_bind(s.clone()),
        ScalarValue::Float(f) => row.push_bind(*f),
        ScalarValue::Integer(i) => row.push_bind(*i),
        ScalarValue::Boolean(b) => row.push_bind(*b),
        ScalarValue::Timestamp(ts) => row.push_bind(*ts),
        ScalarValue::Date(d) => row.push_bind(*d),
        // NULLs are bound with the column's type so Postgres does not infer TEXT.
        ScalarValue::Null => match column_type {
            ColumnType::String | ColumnType::Json => row.push_bind(None::<String>),
            ColumnType::Float => row.push_bind(None::<f64>),
            ColumnType::Integer => row.push_bind(None::<i64>),
            ColumnType::Boolean => row.push_bind(None::<bool>),
            ColumnType::Timestamp => row.push_bind(None::<DateTime<Utc>>),
            ColumnType::Date => row.push_bind(None::<NaiveDate>),
        },
    };
}

fn insert_builder<'a>(table: &TableRef, schema: &TableSchema, records: &'a [Record]) -> QueryBuilder<'a, Postgres> {
    let columns = schema
        .columns()
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let mut builder =
        QueryBuilder::<Postgres>::new(format!("INSERT INTO {} ({}) ", qualified_name(table), columns));
    builder.push_values(records, |mut row, record| {
        for column in schema.columns() {
            bind_value(&mut row, column.column_type, record.get(&column.name));
        }
    });
    builder
}

#[async_trait]
impl TableStore for PgTableStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn dataset_exists(&self, dataset: &DatasetRef) -> Result<bool, StoreError> {
        self.check_container(&dataset.container).await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
        )
        .bind(&dataset.dataset)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_dataset(&self, dataset: &DatasetRef, location: &str) -> Result<(), StoreError> {
        self.check_container(&dataset.container).await?;
        let schema = quote_ident(&dataset.dataset);
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&self.pool)
            .await
            .map_err(|err| classify_pg_error(err, "dataset", dataset.to_string()))?;
        // Postgres has no regions; keep the configured location visible on the schema.
        sqlx::query(&format!(
            "COMMENT ON SCHEMA {schema} IS {}",
            quote_literal(&format!("location={location}"))
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)",
        )
        .bind(&table.dataset)
        .bind(&table.table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_table(&self, table: &TableRef, schema: &TableSchema) -> Result<(), StoreError> {
        sqlx::query(&create_table_sql(table, schema))
            .execute(&self.pool)
            .await
            .map_err(|err| classify_pg_error(err, "table", table.to_string()))?;
        Ok(())
    }

    async fn load_rows(
        &self,
        table: &TableRef,
        batch: &Batch,
        disposition: WriteDisposition,
    ) -> Result<u64, StoreError> {
        let span = info_span!("pg_load", %table, rows = batch.len(), ?disposition);
        async move {
            let chunk_rows = self.chunk_rows(batch.schema());
            let mut written = 0u64;
            match disposition {
                WriteDisposition::Truncate => {
                    let mut tx = self.pool.begin().await?;
                    sqlx::query(&format!("TRUNCATE TABLE {}", qualified_name(table)))
                        .execute(&mut *tx)
                        .await
                        .map_err(|err| classify_pg_error(err, "table", table.to_string()))?;
                    for chunk in batch.records().chunks(chunk_rows) {
                        let mut builder = insert_builder(table, batch.schema(), chunk);
                        written += builder.build().execute(&mut *tx).await?.rows_affected();
                    }
                    tx.commit().await?;
                }
                WriteDisposition::Append => {
                    for chunk in batch.records().chunks(chunk_rows) {
                        let mut builder = insert_builder(table, batch.schema(), chunk);
                        written += builder
                            .build()
                            .execute(&self.pool)
                            .await
                            .map_err(|err| classify_pg_error(err, "table", table.to_string()))?
                            .rows_affected();
                        debug!(written, "appended chunk");
                    }
                }
            }
            Ok::<u64, StoreError>(written)
        }
        .instrument(span)
        .await
    }

    async fn execute_merge(&self, plan: &MergePlan) -> Result<(), StoreError> {
        let sql = plan.to_postgres_sql();
        debug!(destination = %plan.destination, %sql, "executing merge");
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|err| classify_pg_error(err, "table", plan.source.to_string()))?;
        Ok(())
    }

    async fn delete_table_if_exists(&self, table: &TableRef) -> Result<bool, StoreError> {
        let existed = self.table_exists(table).await?;
        if existed {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", qualified_name(table)))
                .execute(&self.pool)
                .await?;
        }
        Ok(existed)
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", qualified_name(table)))
            .fetch_one(&self.pool)
            .await
            .map_err(|err| classify_pg_error(err, "table", table.to_string()))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// One call observed by [`MemoryTableStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub operation: StoreOperation,
    pub target: String,
}

#[derive(Debug, Clone)]
enum FaultKind {
    Fail,
    Delay(Duration),
    /// The operation takes effect but the caller gets an error, like a
    /// statement that committed after its client gave up.
    LoseResponse,
}

#[derive(Debug, Clone)]
struct Fault {
    operation: StoreOperation,
    target: Option<String>,
    kind: FaultKind,
    /// Matching calls still let through before the fault applies.
    skip: usize,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    rows: Vec<Record>,
}

#[derive(Debug, Default)]
struct MemoryState {
    datasets: BTreeMap<DatasetRef, String>,
    tables: BTreeMap<TableRef, MemoryTable>,
    faults: Vec<Fault>,
    calls: Vec<StoreCall>,
}

/// In-process store that interprets merge plans directly. Records every call
/// and supports injected failures and latency.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    state: Mutex<MemoryState>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call to `operation` fails from now on.
    pub async fn inject_failure(&self, operation: StoreOperation) {
        self.push_fault(operation, None, FaultKind::Fail).await;
    }

    /// Calls to `operation` against `target` fail from now on.
    pub async fn inject_failure_for(&self, operation: StoreOperation, target: &TableRef) {
        self.push_fault(operation, Some(target.to_string()), FaultKind::Fail)
            .await;
    }

    /// The first `calls` matching calls succeed, every later one fails.
    pub async fn inject_failure_after(&self, operation: StoreOperation, calls: usize) {
        self.state.lock().await.faults.push(Fault {
            operation,
            target: None,
            kind: FaultKind::Fail,
            skip: calls,
        });
    }

    /// Calls to `operation` apply their change and then fail.
    pub async fn inject_lost_response(&self, operation: StoreOperation) {
        self.push_fault(operation, None, FaultKind::LoseResponse)
            .await;
    }

    pub async fn inject_delay(&self, operation: StoreOperation, delay: Duration) {
        self.push_fault(operation, None, FaultKind::Delay(delay)).await;
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    pub async fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn count_calls(&self, operation: StoreOperation) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub async fn has_table(&self, table: &TableRef) -> bool {
        self.state.lock().await.tables.contains_key(table)
    }

    pub async fn tables(&self) -> Vec<TableRef> {
        self.state.lock().await.tables.keys().cloned().collect()
    }

    pub async fn dataset_location(&self, dataset: &DatasetRef) -> Option<String> {
        self.state.lock().await.datasets.get(dataset).cloned()
    }

    pub async fn rows(&self, table: &TableRef) -> Option<Vec<Record>> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.clone())
    }

    /// Creates or replaces a table outside the call log, e.g. to simulate
    /// leftovers from a crashed run.
    pub async fn seed_table(&self, table: &TableRef, schema: TableSchema, rows: Vec<Record>) {
        let mut state = self.state.lock().await;
        state
            .datasets
            .entry(table.dataset_ref())
            .or_insert_with(String::new);
        state
            .tables
            .insert(table.clone(), MemoryTable { schema, rows });
    }

    async fn push_fault(&self, operation: StoreOperation, target: Option<String>, kind: FaultKind) {
        self.state.lock().await.faults.push(Fault {
            operation,
            target,
            kind,
            skip: 0,
        });
    }

    /// Logs the call and applies matching faults before the operation runs.
    async fn enter(&self, operation: StoreOperation, target: String) -> Result<(), StoreError> {
        let mut delay = Duration::ZERO;
        {
            let mut state = self.state.lock().await;
            state.calls.push(StoreCall {
                operation,
                target: target.clone(),
            });
            let mut matching = Vec::new();
            for fault in state.faults.iter_mut().filter(|f| {
                f.operation == operation
                    && !matches!(f.kind, FaultKind::LoseResponse)
                    && f.target.as_ref().map_or(true, |t| *t == target)
            }) {
                if fault.skip > 0 {
                    fault.skip -= 1;
                } else {
                    matching.push(fault.kind.clone());
                }
            }
            for kind in matching {
                match kind {
                    FaultKind::Fail => {
                        return Err(StoreError::Injected { operation, target });
                    }
                    FaultKind::Delay(d) => delay += d,
                    FaultKind::LoseResponse => {}
                }
            }
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Applies lost-response faults once a mutating operation has taken effect.
    async fn leave(&self, operation: StoreOperation, target: String) -> Result<(), StoreError> {
        let state = self.state.lock().await;
        let lost = state.faults.iter().any(|f| {
            f.operation == operation
                && matches!(f.kind, FaultKind::LoseResponse)
                && f.target.as_ref().map_or(true, |t| *t == target)
        });
        if lost {
            return Err(StoreError::Injected { operation, target });
        }
        Ok(())
    }
}

fn table_not_found(table: &TableRef) -> StoreError {
    StoreError::NotFound {
        kind: "table",
        path: table.to_string(),
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn dataset_exists(&self, dataset: &DatasetRef) -> Result<bool, StoreError> {
        self.enter(StoreOperation::DatasetExists, dataset.to_string())
            .await?;
        Ok(self.state.lock().await.datasets.contains_key(dataset))
    }

    async fn create_dataset(&self, dataset: &DatasetRef, location: &str) -> Result<(), StoreError> {
        self.enter(StoreOperation::CreateDataset, dataset.to_string())
            .await?;
        let mut state = self.state.lock().await;
        if state.datasets.contains_key(dataset) {
            return Err(StoreError::AlreadyExists {
                kind: "dataset",
                path: dataset.to_string(),
            });
        }
        state.datasets.insert(dataset.clone(), location.to_string());
        drop(state);
        self.leave(StoreOperation::CreateDataset, dataset.to_string())
            .await
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool, StoreError> {
        self.enter(StoreOperation::TableExists, table.to_string())
            .await?;
        Ok(self.state.lock().await.tables.contains_key(table))
    }

    async fn create_table(&self, table: &TableRef, schema: &TableSchema) -> Result<(), StoreError> {
        self.enter(StoreOperation::CreateTable, table.to_string())
            .await?;
        let mut state = self.state.lock().await;
        if !state.datasets.contains_key(&table.dataset_ref()) {
            return Err(StoreError::NotFound {
                kind: "dataset",
                path: table.dataset_ref().to_string(),
            });
        }
        if state.tables.contains_key(table) {
            return Err(StoreError::AlreadyExists {
                kind: "table",
                path: table.to_string(),
            });
        }
        state.tables.insert(
            table.clone(),
            MemoryTable {
                schema: schema.clone(),
                rows: Vec::new(),
            },
        );
        drop(state);
        self.leave(StoreOperation::CreateTable, table.to_string())
            .await
    }

    async fn load_rows(
        &self,
        table: &TableRef,
        batch: &Batch,
        disposition: WriteDisposition,
    ) -> Result<u64, StoreError> {
        self.enter(StoreOperation::LoadRows, table.to_string())
            .await?;
        {
            let mut state = self.state.lock().await;
            let target = state.tables.get_mut(table).ok_or_else(|| table_not_found(table))?;
            let rows = batch.records().to_vec();
            match disposition {
                WriteDisposition::Truncate => target.rows = rows,
                WriteDisposition::Append => target.rows.extend(rows),
            }
        }
        self.leave(StoreOperation::LoadRows, table.to_string())
            .await?;
        Ok(batch.len() as u64)
    }

    async fn execute_merge(&self, plan: &MergePlan) -> Result<(), StoreError> {
        self.enter(StoreOperation::ExecuteMerge, plan.destination.to_string())
            .await?;
        {
            let mut state = self.state.lock().await;
            let source_rows = state
                .tables
                .get(&plan.source)
                .ok_or_else(|| table_not_found(&plan.source))?
                .rows
                .clone();
            let destination = state
                .tables
                .get_mut(&plan.destination)
                .ok_or_else(|| table_not_found(&plan.destination))?;

            // Matching runs against the pre-merge destination, like a single
            // statement, and every destination row sharing the key is updated.
            let pre_merge_len = destination.rows.len();
            let mut inserts = Vec::new();
            for source in source_rows {
                let key = source.get(&plan.key_column);
                let mut matched = false;
                for row in destination.rows[..pre_merge_len]
                    .iter_mut()
                    .filter(|row| !row.get(&plan.key_column).is_distinct_from(key))
                {
                    matched = true;
                    let changed = plan
                        .compare_columns
                        .iter()
                        .any(|c| row.get(c).is_distinct_from(source.get(c)));
                    if changed {
                        for column in &plan.compare_columns {
                            row.set(column.clone(), source.get(column).clone());
                        }
                    }
                }
                if !matched {
                    let mut inserted = Record::new();
                    for column in &plan.insert_columns {
                        inserted.set(column.clone(), source.get(column).clone());
                    }
                    inserts.push(inserted);
                }
            }
            destination.rows.extend(inserts);
            debug!(
                destination = %plan.destination,
                schema_columns = destination.schema.len(),
                "memory merge applied"
            );
        }
        self.leave(StoreOperation::ExecuteMerge, plan.destination.to_string())
            .await
    }

    async fn delete_table_if_exists(&self, table: &TableRef) -> Result<bool, StoreError> {
        self.enter(StoreOperation::DeleteTable, table.to_string())
            .await?;
        let removed = self.state.lock().await.tables.remove(table).is_some();
        self.leave(StoreOperation::DeleteTable, table.to_string())
            .await?;
        Ok(removed)
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64, StoreError> {
        self.enter(StoreOperation::RowCount, table.to_string())
            .await?;
        let state = self.state.lock().await;
        let target = state.tables.get(table).ok_or_else(|| table_not_found(table))?;
        Ok(target.rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tdp_core::{ColumnDef, SchemaFamily};

    fn city_schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnDef::key("name", ColumnType::String),
            ColumnDef::nullable("population", ColumnType::Integer),
        ])
        .expect("schema")
    }

    fn table(name: &str) -> TableRef {
        TableRef::new("tdp", "staging", name).expect("table ref")
    }

    fn batch(rows: &[(&str, Option<i64>)]) -> Batch {
        let records = rows
            .iter()
            .map(|(name, pop)| Record::new().with("name", *name).with("population", *pop))
            .collect::<Vec<_>>();
        Batch::new(Arc::new(city_schema()), records).expect("batch")
    }

    #[test]
    fn merge_sql_is_null_safe_and_keyed() {
        let plan = MergePlan::for_schema(table("cities"), table("cities_temp"), &city_schema());
        let sql = plan.to_postgres_sql();
        assert!(sql.starts_with("MERGE INTO \"staging\".\"cities\" AS target"));
        assert!(sql.contains("USING \"staging\".\"cities_temp\" AS source"));
        assert!(sql.contains("ON target.\"name\" = source.\"name\""));
        assert!(sql.contains("target.\"population\" IS DISTINCT FROM source.\"population\""));
        assert!(sql.contains("UPDATE SET\n    \"population\" = source.\"population\""));
        assert!(sql.contains("INSERT (\"name\", \"population\")"));
        assert!(sql.contains("VALUES (source.\"name\", source.\"population\")"));
    }

    #[test]
    fn merge_sql_or_combines_every_non_key_column() {
        let schema = SchemaFamily::DestinationDetails.schema();
        let plan = MergePlan::for_schema(table("destinations"), table("destinations_temp"), &schema);
        let sql = plan.to_postgres_sql();
        assert_eq!(sql.matches("IS DISTINCT FROM").count(), 16);
        assert_eq!(sql.matches("\n    OR ").count(), 15);
        assert!(!sql.contains("target.\"destination_name\" IS DISTINCT FROM"));
    }

    #[test]
    fn key_only_schema_skips_matched_branch() {
        let schema = TableSchema::new(vec![ColumnDef::key("id", ColumnType::Integer)]).unwrap();
        let sql = MergePlan::for_schema(table("ids"), table("ids_temp"), &schema).to_postgres_sql();
        assert!(!sql.contains("WHEN MATCHED"));
        assert!(sql.contains("WHEN NOT MATCHED THEN"));
    }

    #[test]
    fn create_table_sql_maps_types_and_nullability() {
        let sql = create_table_sql(&table("cities"), &city_schema());
        assert_eq!(
            sql,
            "CREATE TABLE \"staging\".\"cities\" (\"name\" TEXT NOT NULL, \"population\" BIGINT)"
        );
    }

    #[test]
    fn identifiers_and_literals_are_escaped() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn insert_chunks_respect_bind_limit() {
        assert_eq!(chunk_rows_for(500, 17), 500);
        assert_eq!(chunk_rows_for(10_000, 17), 3855);
        assert_eq!(chunk_rows_for(0, 3), 1);
    }

    #[tokio::test]
    async fn memory_merge_updates_changed_and_inserts_new() {
        let store = MemoryTableStore::new();
        let dest = table("cities");
        let temp = table("cities_temp");
        store
            .seed_table(&dest, city_schema(), batch(&[("Paris", Some(1)), ("Rome", Some(2))]).records().to_vec())
            .await;
        store
            .seed_table(&temp, city_schema(), batch(&[("Paris", Some(10)), ("Oslo", None)]).records().to_vec())
            .await;

        let plan = MergePlan::for_schema(dest.clone(), temp.clone(), &city_schema());
        store.execute_merge(&plan).await.expect("merge");

        let rows = store.rows(&dest).await.expect("rows");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("population"), &ScalarValue::Integer(10));
        assert_eq!(rows[1].get("population"), &ScalarValue::Integer(2));
        assert_eq!(rows[2].get("name"), &ScalarValue::from("Oslo"));
        assert!(rows[2].get("population").is_null());
    }

    #[tokio::test]
    async fn memory_merge_updates_every_row_sharing_a_key() {
        let store = MemoryTableStore::new();
        let dest = table("cities");
        let temp = table("cities_temp");
        // Appends may have left the key twice in the destination.
        store
            .seed_table(&dest, city_schema(), batch(&[("Paris", Some(1)), ("Paris", Some(2))]).records().to_vec())
            .await;
        store
            .seed_table(&temp, city_schema(), batch(&[("Paris", Some(3))]).records().to_vec())
            .await;

        let plan = MergePlan::for_schema(dest.clone(), temp, &city_schema());
        store.execute_merge(&plan).await.expect("merge");

        let rows = store.rows(&dest).await.expect("rows");
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .all(|r| r.get("population") == &ScalarValue::Integer(3)));
    }

    #[tokio::test]
    async fn memory_merge_compares_floats_like_postgres() {
        let schema = TableSchema::new(vec![
            ColumnDef::key("name", ColumnType::String),
            ColumnDef::nullable("area_km2", ColumnType::Float),
        ])
        .unwrap();
        let rows = |values: &[(&str, f64)]| {
            values
                .iter()
                .map(|(name, area)| Record::new().with("name", *name).with("area_km2", *area))
                .collect::<Vec<_>>()
        };
        let store = MemoryTableStore::new();
        let dest = table("cities");
        let temp = table("cities_temp");
        store
            .seed_table(&dest, schema.clone(), rows(&[("Paris", 0.0), ("Rome", f64::NAN)]))
            .await;
        store
            .seed_table(&temp, schema.clone(), rows(&[("Paris", -0.0), ("Rome", f64::NAN)]))
            .await;

        store
            .execute_merge(&MergePlan::for_schema(dest.clone(), temp, &schema))
            .await
            .expect("merge");

        let merged = store.rows(&dest).await.expect("rows");
        assert_eq!(merged.len(), 2);
        // -0.0 is not distinct from 0.0, so the row keeps its positive zero.
        match merged[0].get("area_km2") {
            ScalarValue::Float(area) => assert!(area.is_sign_positive()),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[tokio::test]
    async fn lost_responses_apply_the_change() {
        let store = MemoryTableStore::new();
        let dest = table("cities");
        store.seed_table(&table("seed"), city_schema(), Vec::new()).await;
        store.inject_lost_response(StoreOperation::CreateTable).await;

        assert!(matches!(
            store.create_table(&dest, &city_schema()).await,
            Err(StoreError::Injected { operation: StoreOperation::CreateTable, .. })
        ));
        assert!(store.has_table(&dest).await);
    }

    #[tokio::test]
    async fn memory_load_truncates_or_appends() {
        let store = MemoryTableStore::new();
        let dest = table("cities");
        store.seed_table(&dest, city_schema(), Vec::new()).await;

        store
            .load_rows(&dest, &batch(&[("Paris", None)]), WriteDisposition::Append)
            .await
            .unwrap();
        store
            .load_rows(&dest, &batch(&[("Paris", None)]), WriteDisposition::Append)
            .await
            .unwrap();
        assert_eq!(store.row_count(&dest).await.unwrap(), 2);

        store
            .load_rows(&dest, &batch(&[("Rome", None)]), WriteDisposition::Truncate)
            .await
            .unwrap();
        assert_eq!(store.row_count(&dest).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_if_exists_is_idempotent() {
        let store = MemoryTableStore::new();
        let temp = table("cities_temp");
        store.seed_table(&temp, city_schema(), Vec::new()).await;
        assert!(store.delete_table_if_exists(&temp).await.unwrap());
        assert!(!store.delete_table_if_exists(&temp).await.unwrap());
    }

    #[tokio::test]
    async fn injected_failures_are_scoped_to_target() {
        let store = MemoryTableStore::new();
        let a = table("a");
        let b = table("b");
        store.seed_table(&a, city_schema(), Vec::new()).await;
        store.seed_table(&b, city_schema(), Vec::new()).await;
        store.inject_failure_for(StoreOperation::RowCount, &a).await;

        assert!(matches!(
            store.row_count(&a).await,
            Err(StoreError::Injected { operation: StoreOperation::RowCount, .. })
        ));
        assert_eq!(store.row_count(&b).await.unwrap(), 0);

        store.clear_faults().await;
        assert_eq!(store.row_count(&a).await.unwrap(), 0);
        assert_eq!(store.count_calls(StoreOperation::RowCount).await, 3);
    }

    #[tokio::test]
    async fn delayed_failures_let_early_calls_through() {
        let store = MemoryTableStore::new();
        let dest = table("cities");
        store.seed_table(&dest, city_schema(), Vec::new()).await;
        store.inject_failure_after(StoreOperation::RowCount, 2).await;

        assert!(store.row_count(&dest).await.is_ok());
        assert!(store.row_count(&dest).await.is_ok());
        assert!(store.row_count(&dest).await.is_err());
        assert!(store.row_count(&dest).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_abandons_slow_calls() {
        let store = MemoryTableStore::new();
        let dest = table("cities");
        store.seed_table(&dest, city_schema(), Vec::new()).await;
        store
            .inject_delay(StoreOperation::RowCount, Duration::from_secs(60))
            .await;

        let deadline = Deadline::after(Duration::from_secs(5));
        let result = deadline
            .run(StoreOperation::RowCount, store.row_count(&dest))
            .await;
        assert!(matches!(
            result,
            Err(StoreError::DeadlineExceeded { operation: StoreOperation::RowCount })
        ));
        assert!(deadline.is_expired());
        assert!(!Deadline::unbounded().is_expired());
    }
}
