use super::checkpoint::OffsetCheckpoint;
use super::traits::{OffsetStore, StoreError, TargetStore};
use crate::ddl::TargetDdl;
use crate::event::{Row, TableId, Value};
use crate::schema::{TableSchema, TargetType, DELETED_COLUMN, VERSION_COLUMN};
use crate::sequencer::VersionStamp;
use crate::transform::TargetRowOperation;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use duckdb::types::{TimeUnit, Value as DuckValue};
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Rows per INSERT statement inside one bulk write.
const ROWS_PER_STATEMENT: usize = 500;

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        std::process::Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Extract the holder PID from a DuckDB lock error: "... (PID 12345) ..."
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn remove_stale_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let path = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::info!(path = %path.display(), "Removed stale DuckDB file");
        }
    }
    Ok(())
}

impl From<duckdb::Error> for StoreError {
    fn from(e: duckdb::Error) -> Self {
        classify_duckdb_error(&e.to_string())
    }
}

/// Sort a DuckDB failure into retryable and fatal classes by its message.
fn classify_duckdb_error(message: &str) -> StoreError {
    let lower = message.to_ascii_lowercase();
    let message = message.to_string();

    if lower.contains("could not set lock")
        || lower.contains("io error")
        || lower.contains("connection")
        || lower.contains("database has been invalidated")
    {
        StoreError::Connection(message)
    } else if lower.contains("interrupted") || lower.contains("timeout") {
        StoreError::Timeout(message)
    } else if lower.contains("conflict") || lower.contains("transactioncontext") {
        StoreError::Transient(message)
    } else if lower.contains("catalog error") || lower.contains("binder error") {
        StoreError::Schema(message)
    } else {
        StoreError::Database(message)
    }
}

fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::Database(format!("Task join error: {}", e))
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Database("connection mutex poisoned".to_string()))
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn qualified_name(table: &TableId) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name))
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => format!("{:?}", f),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Bytes(_) => "''".to_string(),
    }
}

fn column_sql(name: &str, target_type: &TargetType, nullable: bool) -> String {
    let mut sql = format!("{} {}", quote_ident(name), target_type.sql());
    if !nullable {
        sql.push_str(" NOT NULL");
    }
    sql
}

/// Target SQL for one schema change. Some changes need more than one statement.
pub fn render_ddl(statement: &TargetDdl) -> Vec<String> {
    match statement {
        TargetDdl::CreateSchema(name) => {
            vec![format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(name))]
        }
        TargetDdl::CreateTable(schema) => {
            let mut columns: Vec<String> = schema
                .columns
                .iter()
                .map(|c| column_sql(&c.name, &c.target_type, c.nullable))
                .collect();
            columns.push(format!("{} UBIGINT NOT NULL", quote_ident(VERSION_COLUMN)));
            columns.push(format!(
                "{} BOOLEAN NOT NULL DEFAULT false",
                quote_ident(DELETED_COLUMN)
            ));
            vec![format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                qualified_name(&schema.table),
                columns.join(", ")
            )]
        }
        TargetDdl::AddColumn { table, column } => {
            let target = qualified_name(table);
            let name = quote_ident(&column.name);
            if column.nullable {
                vec![format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    target,
                    name,
                    column.target_type.sql()
                )]
            } else {
                // Existing rows need a value before the constraint can hold.
                vec![
                    format!(
                        "ALTER TABLE {} ADD COLUMN {} {} DEFAULT CAST({} AS {})",
                        target,
                        name,
                        column.target_type.sql(),
                        sql_literal(&column.target_type.default_value()),
                        column.target_type.sql()
                    ),
                    format!("ALTER TABLE {} ALTER COLUMN {} SET NOT NULL", target, name),
                ]
            }
        }
        TargetDdl::DropColumn { table, column } => vec![format!(
            "ALTER TABLE {} DROP COLUMN {}",
            qualified_name(table),
            quote_ident(column)
        )],
        TargetDdl::RenameColumn { table, from, to } => vec![format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            qualified_name(table),
            quote_ident(from),
            quote_ident(to)
        )],
        TargetDdl::AlterColumnType {
            table,
            column,
            target_type,
        } => vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
            qualified_name(table),
            quote_ident(column),
            target_type.sql()
        )],
        TargetDdl::SetNotNull { table, column } => vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
            qualified_name(table),
            quote_ident(column)
        )],
        TargetDdl::DropNotNull { table, column } => vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL",
            qualified_name(table),
            quote_ident(column)
        )],
        TargetDdl::RenameTable { from, to } => vec![format!(
            "ALTER TABLE {} RENAME TO {}",
            qualified_name(from),
            quote_ident(&to.name)
        )],
        TargetDdl::DropTable(table) => {
            vec![format!("DROP TABLE IF EXISTS {}", qualified_name(table))]
        }
        TargetDdl::Truncate(table) => vec![format!("DELETE FROM {}", qualified_name(table))],
    }
}

fn to_duck(value: &Value) -> DuckValue {
    match value {
        Value::Null => DuckValue::Null,
        Value::Bool(b) => DuckValue::Boolean(*b),
        Value::Int(i) => DuckValue::BigInt(*i),
        Value::UInt(u) => DuckValue::UBigInt(*u),
        Value::Float(f) => DuckValue::Double(*f),
        Value::String(s) => DuckValue::Text(s.clone()),
        Value::Bytes(b) => DuckValue::Blob(b.clone()),
    }
}

fn micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

fn from_duck(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::Int(i.into()),
        DuckValue::SmallInt(i) => Value::Int(i.into()),
        DuckValue::Int(i) => Value::Int(i.into()),
        DuckValue::BigInt(i) => Value::Int(i),
        DuckValue::HugeInt(i) => match i64::try_from(i) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::String(i.to_string()),
        },
        DuckValue::UTinyInt(u) => Value::UInt(u.into()),
        DuckValue::USmallInt(u) => Value::UInt(u.into()),
        DuckValue::UInt(u) => Value::UInt(u.into()),
        DuckValue::UBigInt(u) => Value::UInt(u),
        DuckValue::Float(f) => Value::Float(f.into()),
        DuckValue::Double(f) => Value::Float(f),
        DuckValue::Decimal(d) => Value::String(d.to_string()),
        DuckValue::Text(s) => Value::String(s),
        DuckValue::Blob(b) => Value::Bytes(b),
        DuckValue::Date32(days) => NaiveDate::from_num_days_from_ce_opt(719_163 + days)
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Int(days.into())),
        DuckValue::Timestamp(unit, value) => DateTime::from_timestamp_micros(micros(unit, value))
            .map(|ts| Value::String(ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Int(value)),
        DuckValue::Time64(unit, value) => {
            let us = micros(unit, value);
            let secs = us / 1_000_000;
            Value::String(format!(
                "{:02}:{:02}:{:02}.{:06}",
                secs / 3600,
                (secs / 60) % 60,
                secs % 60,
                us % 1_000_000
            ))
        }
        other => Value::String(format!("{:?}", other)),
    }
}

/// Build the chunked INSERT statements for one flush.
fn bulk_insert_statements(
    schema: &TableSchema,
    operations: &[TargetRowOperation],
) -> Vec<(String, Vec<DuckValue>)> {
    let mut columns: Vec<String> = schema.columns.iter().map(|c| quote_ident(&c.name)).collect();
    columns.push(quote_ident(VERSION_COLUMN));
    columns.push(quote_ident(DELETED_COLUMN));

    let mut placeholders: Vec<String> = schema
        .columns
        .iter()
        .map(|c| format!("CAST(? AS {})", c.target_type.sql()))
        .collect();
    placeholders.push("CAST(? AS UBIGINT)".to_string());
    placeholders.push("?".to_string());
    let tuple = format!("({})", placeholders.join(", "));

    let prefix = format!(
        "INSERT INTO {} ({}) VALUES ",
        qualified_name(&schema.table),
        columns.join(", ")
    );

    operations
        .chunks(ROWS_PER_STATEMENT)
        .map(|chunk| {
            let mut sql = prefix.clone();
            let mut params = Vec::with_capacity(chunk.len() * (schema.columns.len() + 2));
            for (i, op) in chunk.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(&tuple);
                for column in &schema.columns {
                    params.push(op.values.get(&column.name).map_or(DuckValue::Null, to_duck));
                }
                params.push(DuckValue::UBigInt(op.version.get()));
                params.push(DuckValue::Boolean(op.deleted));
            }
            (sql, params)
        })
        .collect()
}

fn partition_clause(schema: &TableSchema) -> String {
    schema
        .key_columns()
        .into_iter()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

/// DuckDB-backed target with merge-on-read version columns.
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStore {
    /// Open (or create) a target database file
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();

        match Connection::open(path) {
            Ok(conn) => Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            }),
            Err(e) => {
                let error_msg = e.to_string();
                if !error_msg.contains("Could not set lock") {
                    return Err(e.into());
                }

                tracing::warn!(error = %error_msg, "Target database is locked");
                let Some(pid) = extract_pid_from_lock_error(&error_msg) else {
                    return Err(e.into());
                };
                if is_process_running(pid) {
                    tracing::error!(pid, "Lock holder is still running");
                    return Err(e.into());
                }

                tracing::warn!(pid, "Lock holder is gone, removing stale lock files");
                if let Err(io_err) = remove_stale_lock_files(path) {
                    tracing::error!(error = %io_err, "Failed to remove lock files");
                    return Err(e.into());
                }
                let conn = Connection::open(path)?;
                Ok(Self {
                    conn: Arc::new(Mutex::new(conn)),
                })
            }
        }
    }

    /// Create an in-memory target (for tests and dry runs)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create the bookkeeping schema for offsets and the schema catalog.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute_batch(
                "CREATE SCHEMA IF NOT EXISTS _cdc;
                 CREATE TABLE IF NOT EXISTS _cdc.schemas (
                    schema_name VARCHAR NOT NULL,
                    table_name VARCHAR NOT NULL,
                    definition VARCHAR NOT NULL,
                    fingerprint VARCHAR NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (schema_name, table_name)
                 );
                 CREATE TABLE IF NOT EXISTS _cdc.offsets (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    checkpoint_data VARCHAR NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                 );",
            )?;
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(join_error)?
    }

    /// Latest live version of every key.
    pub async fn read_merged(&self, schema: &TableSchema) -> Result<Vec<Row>, StoreError> {
        let conn = self.conn.clone();
        let names: Vec<String> = schema.columns.iter().map(|c| c.name.clone()).collect();
        let select = names.iter().map(|n| quote_ident(n)).collect::<Vec<_>>().join(", ");
        let partition = partition_clause(schema);
        let sql = format!(
            "SELECT {select} FROM (
                SELECT *, row_number() OVER (PARTITION BY {partition} ORDER BY {version} DESC) AS _rank
                FROM {table}
             ) WHERE _rank = 1 AND NOT {deleted}
             ORDER BY {partition}",
            table = qualified_name(&schema.table),
            version = quote_ident(VERSION_COLUMN),
            deleted = quote_ident(DELETED_COLUMN),
        );

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut merged = Vec::new();
            while let Some(row) = rows.next()? {
                let mut out = Row::with_capacity(names.len());
                for (i, name) in names.iter().enumerate() {
                    let value: DuckValue = row.get(i)?;
                    out.insert(name.clone(), from_duck(value));
                }
                merged.push(out);
            }
            Ok(merged)
        })
        .await
        .map_err(join_error)?
    }

    /// Physically remove superseded versions and winning tombstones.
    pub async fn compact(&self, schema: &TableSchema) -> Result<usize, StoreError> {
        let conn = self.conn.clone();
        let table = qualified_name(&schema.table);
        let sql = format!(
            "DELETE FROM {table} WHERE rowid IN (
                SELECT rowid FROM (
                    SELECT rowid, {deleted} AS _gone,
                           row_number() OVER (PARTITION BY {partition} ORDER BY {version} DESC) AS _rank
                    FROM {table}
                ) WHERE _rank > 1 OR _gone
             )",
            partition = partition_clause(schema),
            version = quote_ident(VERSION_COLUMN),
            deleted = quote_ident(DELETED_COLUMN),
        );

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let removed = conn.execute(&sql, [])?;
            Ok(removed)
        })
        .await
        .map_err(join_error)?
    }

    /// Stored row versions, superseded ones included.
    pub async fn count_versions(&self, table: &TableId) -> Result<u64, StoreError> {
        let conn = self.conn.clone();
        let sql = format!("SELECT count(*) FROM {}", qualified_name(table));
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
        .map_err(join_error)?
    }
}

#[async_trait]
impl TargetStore for DuckDbStore {
    async fn execute_bulk_write(
        &self,
        schema: &TableSchema,
        operations: &[TargetRowOperation],
    ) -> Result<usize, StoreError> {
        if operations.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.clone();
        let statements = bulk_insert_statements(schema, operations);
        let rows = operations.len();

        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction()?;
            for (sql, params) in &statements {
                tx.execute(sql, duckdb::params_from_iter(params.iter()))?;
            }
            tx.commit()?;
            Ok(rows)
        })
        .await
        .map_err(join_error)?
    }

    async fn execute_ddl(&self, statement: &TargetDdl) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let sql = render_ddl(statement);

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            for stmt in &sql {
                tracing::debug!(sql = %stmt, "Executing target DDL");
                conn.execute(stmt, [])?;
            }
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn query_max_version(&self, table: &TableId) -> Result<VersionStamp, StoreError> {
        let conn = self.conn.clone();
        let sql = format!(
            "SELECT CAST(COALESCE(MAX({}), 0) AS UBIGINT) FROM {}",
            quote_ident(VERSION_COLUMN),
            qualified_name(table)
        );

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let max: u64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(VersionStamp(max))
        })
        .await
        .map_err(join_error)?
    }

    async fn load_schemas(&self) -> Result<Vec<TableSchema>, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT definition FROM _cdc.schemas ORDER BY schema_name, table_name",
            )?;
            let definitions = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut schemas = Vec::new();
            for definition in definitions {
                schemas.push(serde_json::from_str(&definition?)?);
            }
            Ok(schemas)
        })
        .await
        .map_err(join_error)?
    }

    async fn save_schema(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let definition = serde_json::to_string(schema)?;
        let fingerprint = schema.fingerprint();
        let table = schema.table.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO _cdc.schemas
                    (schema_name, table_name, definition, fingerprint, updated_at)
                 VALUES (?, ?, ?, ?, to_timestamp(? / 1000000.0))",
                duckdb::params![
                    table.schema,
                    table.name,
                    definition,
                    fingerprint,
                    Utc::now().timestamp_micros()
                ],
            )?;
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn forget_schema(&self, table: &TableId) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let table = table.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "DELETE FROM _cdc.schemas WHERE schema_name = ? AND table_name = ?",
                duckdb::params![table.schema, table.name],
            )?;
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(join_error)?
    }
}

#[async_trait]
impl OffsetStore for DuckDbStore {
    async fn load_checkpoint(&self) -> Result<Option<OffsetCheckpoint>, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare("SELECT checkpoint_data FROM _cdc.offsets WHERE id = 1")?;
            let mut rows = stmt.query([])?;

            if let Some(row) = rows.next()? {
                let data: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&data)?))
            } else {
                Ok(None)
            }
        })
        .await
        .map_err(join_error)?
    }

    async fn acknowledge(&self, checkpoint: &OffsetCheckpoint) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let data = serde_json::to_string(checkpoint)?;

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO _cdc.offsets (id, checkpoint_data, updated_at)
                 VALUES (1, ?, to_timestamp(? / 1000000.0))",
                duckdb::params![data, Utc::now().timestamp_micros()],
            )?;
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;
    use crate::transform::RowKind;

    async fn setup_store() -> DuckDbStore {
        let store = DuckDbStore::in_memory().unwrap();
        store.init_schema().await.unwrap();
        store
    }

    fn items() -> TableSchema {
        TableSchema {
            table: TableId::new("shop", "items"),
            columns: vec![
                ColumnSchema::new("id", TargetType::Integer, false),
                ColumnSchema::new("qty", TargetType::Integer, true),
            ],
            primary_key: vec!["id".to_string()],
        }
    }

    async fn create(store: &DuckDbStore, schema: &TableSchema) {
        store
            .execute_ddl(&TargetDdl::CreateSchema(schema.table.schema.clone()))
            .await
            .unwrap();
        store
            .execute_ddl(&TargetDdl::CreateTable(schema.clone()))
            .await
            .unwrap();
    }

    fn op(id: i64, qty: i64, version: u64, deleted: bool) -> TargetRowOperation {
        TargetRowOperation {
            table: TableId::new("shop", "items"),
            kind: if deleted { RowKind::Delete } else { RowKind::Upsert },
            values: vec![("id", Value::Int(id)), ("qty", Value::Int(qty))]
                .into_iter()
                .collect(),
            version: VersionStamp(version),
            deleted,
            ticket: version,
        }
    }

    #[tokio::test]
    async fn test_merged_read_keeps_highest_version() {
        let store = setup_store().await;
        let schema = items();
        create(&store, &schema).await;

        let ops = vec![op(1, 10, 1, false), op(1, 11, 2, false), op(2, 20, 3, false)];
        assert_eq!(store.execute_bulk_write(&schema, &ops).await.unwrap(), 3);

        let merged = store.read_merged(&schema).await.unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].get("qty"), Some(&Value::Int(11)));
        assert_eq!(store.query_max_version(&schema.table).await.unwrap(), VersionStamp(3));
    }

    #[tokio::test]
    async fn test_tombstone_hides_key_until_newer_write() {
        let store = setup_store().await;
        let schema = items();
        create(&store, &schema).await;

        store
            .execute_bulk_write(&schema, &[op(1, 10, 1, false), op(1, 10, 2, true)])
            .await
            .unwrap();
        assert!(store.read_merged(&schema).await.unwrap().is_empty());

        store
            .execute_bulk_write(&schema, &[op(1, 12, 3, false)])
            .await
            .unwrap();
        let merged = store.read_merged(&schema).await.unwrap();
        assert_eq!(merged[0].get("qty"), Some(&Value::Int(12)));
    }

    #[tokio::test]
    async fn test_compaction_removes_superseded_versions() {
        let store = setup_store().await;
        let schema = items();
        create(&store, &schema).await;

        let ops: Vec<_> = (1..=50).map(|v| op(1, v as i64, v, false)).collect();
        store.execute_bulk_write(&schema, &ops).await.unwrap();

        assert_eq!(store.compact(&schema).await.unwrap(), 49);
        assert_eq!(store.count_versions(&schema.table).await.unwrap(), 1);
        let merged = store.read_merged(&schema).await.unwrap();
        assert_eq!(merged[0].get("qty"), Some(&Value::Int(50)));
    }

    #[tokio::test]
    async fn test_schema_catalog_round_trip() {
        let store = setup_store().await;
        let schema = items();

        store.save_schema(&schema).await.unwrap();
        assert_eq!(store.load_schemas().await.unwrap(), vec![schema.clone()]);

        store.forget_schema(&schema.table).await.unwrap();
        assert!(store.load_schemas().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alter_statements_apply() {
        let store = setup_store().await;
        let schema = items();
        create(&store, &schema).await;
        store
            .execute_bulk_write(&schema, &[op(1, 1, 1, false)])
            .await
            .unwrap();

        let table = schema.table.clone();
        let statements = vec![
            TargetDdl::AddColumn {
                table: table.clone(),
                column: ColumnSchema::new("note", TargetType::Varchar, false),
            },
            TargetDdl::AlterColumnType {
                table: table.clone(),
                column: "qty".to_string(),
                target_type: TargetType::BigInt,
            },
            TargetDdl::RenameColumn {
                table: table.clone(),
                from: "qty".to_string(),
                to: "quantity".to_string(),
            },
        ];
        for statement in &statements {
            store.execute_ddl(statement).await.unwrap();
        }

        let mut altered = schema.clone();
        altered.columns = vec![
            ColumnSchema::new("id", TargetType::Integer, false),
            ColumnSchema::new("quantity", TargetType::BigInt, true),
            ColumnSchema::new("note", TargetType::Varchar, false),
        ];
        let merged = store.read_merged(&altered).await.unwrap();
        assert_eq!(merged[0].get("quantity"), Some(&Value::Int(1)));
        assert_eq!(merged[0].get("note"), Some(&Value::String(String::new())));
    }

    #[test]
    fn test_error_classification() {
        assert!(classify_duckdb_error("IO Error: could not open file").is_connectivity());
        assert!(classify_duckdb_error("TransactionContext Error: Conflict on update").is_transient());
        assert!(matches!(
            classify_duckdb_error("Catalog Error: Table with name x does not exist!"),
            StoreError::Schema(_)
        ));
        assert!(!classify_duckdb_error("Conversion Error: Could not convert").is_transient());
    }

    #[test]
    fn test_extract_pid_from_lock_error() {
        let msg = "IO Error: Could not set lock on file \"x.db\": Conflicting lock is held in /usr/bin/cdcsink (PID 12345) by user";
        assert_eq!(extract_pid_from_lock_error(msg), Some(12345));
        assert_eq!(extract_pid_from_lock_error("no pid here"), None);
    }
}
