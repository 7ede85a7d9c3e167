use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use log::{debug, error, info, warn};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Connection, Executor, MySql, Pool, Row, Statement, TypeInfo, ValueRef};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::{DriverError, ExecutionErrorKind};
use crate::executor::{Database, RowSet, ScalarValue};
use crate::schema::{ColumnDescriptor, ColumnType, TableDescriptor};

const MAX_RETRIES: u32 = 5;
const RETRY_DELAY_MS: u64 = 1000;

pub async fn connect_with_retry(
    options: MySqlConnectOptions,
    max_connections: u32,
) -> Result<Pool<MySql>, sqlx::Error> {
    let mut retry_count = 0;

    loop {
        match MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options.clone())
            .await
        {
            Ok(pool) => {
                info!("Successfully connected to MySQL database");
                return Ok(pool);
            }
            Err(e) => {
                retry_count += 1;
                if retry_count >= MAX_RETRIES {
                    error!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                    return Err(e);
                }
                warn!("Database connection failed (attempt {retry_count}/{MAX_RETRIES}): {e}");
                info!("Retrying in {RETRY_DELAY_MS}ms...");
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            }
        }
    }
}

const TABLES_QUERY: &str = "SELECT CAST(TABLE_NAME AS CHAR) AS table_name, \
            CAST(IFNULL(TABLE_ROWS, 0) AS UNSIGNED) AS table_rows \
     FROM information_schema.TABLES \
     WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE' \
     ORDER BY TABLE_NAME";

const COLUMNS_QUERY: &str = "SELECT CAST(TABLE_NAME AS CHAR) AS table_name, \
            CAST(COLUMN_NAME AS CHAR) AS column_name, \
            CAST(COLUMN_TYPE AS CHAR) AS column_type, \
            CAST(IS_NULLABLE AS CHAR) AS is_nullable, \
            CAST(COLUMN_KEY AS CHAR) AS column_key \
     FROM information_schema.COLUMNS \
     WHERE TABLE_SCHEMA = ? \
     ORDER BY TABLE_NAME, ORDINAL_POSITION";

/// One row of the column catalog.
#[derive(Debug, Clone)]
struct CatalogColumn {
    table: String,
    name: String,
    column_type: String,
    nullable: bool,
    key: String,
}

/// Bounds every read-only SELECT on the session; the server aborts it with
/// error 3024 once the limit passes. Zero would mean no limit.
fn execution_limit_statement(timeout: Duration) -> String {
    let ms = timeout.as_millis().clamp(1, u128::from(u32::MAX));
    format!("SET SESSION max_execution_time = {ms}")
}

fn kill_query_statement(connection_id: u64) -> String {
    format!("KILL QUERY {connection_id}")
}

/// A pooled connection running one statement. Dropped before `release`
/// (timeout, deadline or cancellation), it kills the statement on the
/// server and closes the connection instead of returning it to the pool.
struct StatementSession {
    conn: Option<PoolConnection<MySql>>,
    pool: Pool<MySql>,
    connection_id: u64,
}

impl StatementSession {
    async fn open(pool: &Pool<MySql>, timeout: Duration) -> Result<Self, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        (&mut *conn).execute(execution_limit_statement(timeout).as_str()).await?;
        let connection_id: u64 = sqlx::query_scalar("SELECT CONNECTION_ID()")
            .fetch_one(&mut *conn)
            .await?;
        Ok(Self {
            conn: Some(conn),
            pool: pool.clone(),
            connection_id,
        })
    }

    fn connection(&mut self) -> Result<&mut MySqlConnection, sqlx::Error> {
        self.conn.as_deref_mut().ok_or(sqlx::Error::PoolClosed)
    }

    /// The statement finished; hand the connection back to the pool.
    fn release(mut self) {
        self.conn.take();
    }
}

impl Drop for StatementSession {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        let Ok(handle) = tokio::runtime::Handle::try_current() else { return };

        let id = self.connection_id;
        let pool = self.pool.clone();
        let conn = conn.detach();
        warn!("Statement on connection {id} abandoned; killing it on the server");
        handle.spawn(async move {
            if let Err(e) = (&pool).execute(kill_query_statement(id).as_str()).await {
                warn!("Failed to kill statement on connection {id}: {e}");
            }
            if let Err(e) = conn.close().await {
                debug!("Closing abandoned connection {id} failed: {e}");
            }
        });
    }
}

async fn fetch_rows(conn: &mut MySqlConnection, sql: &str) -> Result<RowSet, sqlx::Error> {
    let rows = sqlx::query(sql).fetch_all(&mut *conn).await?;

    let columns: Vec<String> = match rows.first() {
        Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
        None => {
            // Still report the shape of an empty result.
            let statement = (&mut *conn).prepare(sql).await?;
            statement.columns().iter().map(|c| c.name().to_string()).collect()
        }
    };
    let rows = rows.iter().map(convert_row).collect();

    Ok(RowSet { columns, rows })
}

/// Pooled MySQL connection. Each call holds one connection for the duration
/// of its statement.
pub struct MySqlDatabase {
    pool: Pool<MySql>,
}

impl MySqlDatabase {
    pub fn new(pool: Pool<MySql>) -> Self {
        Self { pool }
    }

    async fn current_database(&self) -> Result<String, DriverError> {
        let current: Option<String> = sqlx::query_scalar("SELECT DATABASE()").fetch_one(&self.pool).await?;
        current.ok_or_else(|| {
            DriverError::new(
                ExecutionErrorKind::DatabaseError,
                "No database selected. Please specify a database to use.",
            )
        })
    }
}

#[async_trait]
impl Database for MySqlDatabase {
    async fn query(&self, sql: &str, timeout: Duration) -> Result<RowSet, DriverError> {
        debug!("Executing query: {sql}");
        let mut session = StatementSession::open(&self.pool, timeout).await?;
        let outcome = fetch_rows(session.connection()?, sql).await;
        session.release();
        outcome.map_err(DriverError::from)
    }

    async fn execute(&self, sql: &str, timeout: Duration) -> Result<u64, DriverError> {
        debug!("Executing statement: {sql}");
        let mut session = StatementSession::open(&self.pool, timeout).await?;
        let outcome = sqlx::query(sql).execute(session.connection()?).await;
        session.release();
        Ok(outcome.map_err(DriverError::from)?.rows_affected())
    }

    async fn catalog(&self) -> Result<Vec<TableDescriptor>, DriverError> {
        let schema = self.current_database().await?;
        debug!("Reading catalog for database '{schema}'");

        let tables = sqlx::query(TABLES_QUERY)
            .bind(&schema)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| Ok((row.try_get::<String, _>("table_name")?, row.try_get::<u64, _>("table_rows")?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let columns = sqlx::query(COLUMNS_QUERY)
            .bind(&schema)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| {
                Ok(CatalogColumn {
                    table: row.try_get("table_name")?,
                    name: row.try_get("column_name")?,
                    column_type: row.try_get("column_type")?,
                    nullable: row.try_get::<String, _>("is_nullable")? == "YES",
                    key: row.try_get("column_key")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(assemble_catalog(tables, columns))
    }
}

/// Group column records under their tables, keeping catalog order.
fn assemble_catalog(tables: Vec<(String, u64)>, columns: Vec<CatalogColumn>) -> Vec<TableDescriptor> {
    let mut by_table: BTreeMap<String, Vec<CatalogColumn>> = BTreeMap::new();
    for column in columns {
        by_table.entry(column.table.clone()).or_default().push(column);
    }

    tables
        .into_iter()
        .map(|(name, row_estimate)| {
            let records = by_table.remove(&name).unwrap_or_default();
            let primary_key: BTreeSet<String> = records
                .iter()
                .filter(|c| c.key == "PRI")
                .map(|c| c.name.clone())
                .collect();
            let columns = records
                .into_iter()
                .map(|c| ColumnDescriptor {
                    column_type: ColumnType::from_declared(&c.column_type),
                    is_key: !c.key.is_empty(),
                    name: c.name,
                    declared_type: c.column_type,
                    nullable: c.nullable,
                })
                .collect();
            TableDescriptor {
                name,
                columns,
                primary_key,
                row_estimate,
            }
        })
        .collect()
}

fn convert_row(row: &MySqlRow) -> Vec<ScalarValue> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let type_name = column.type_info().name();
            decode_cell(row, i, type_name).unwrap_or_else(|e| {
                debug!("Falling back to raw bytes for {type_name} column '{}': {e}", column.name());
                match row.try_get_unchecked::<Vec<u8>, _>(i) {
                    Ok(bytes) => bytes_value(bytes),
                    Err(_) => ScalarValue::Null,
                }
            })
        })
        .collect()
}

fn decode_cell(row: &MySqlRow, i: usize, type_name: &str) -> Result<ScalarValue, sqlx::Error> {
    if row.try_get_raw(i)?.is_null() {
        return Ok(ScalarValue::Null);
    }

    let value = match type_name {
        "BOOLEAN" => ScalarValue::Boolean(row.try_get(i)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => ScalarValue::Integer(row.try_get(i)?),
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED" | "BIGINT UNSIGNED" => {
            unsigned_value(row.try_get(i)?)
        }
        "FLOAT" => ScalarValue::Float(f64::from(row.try_get::<f32, _>(i)?)),
        "DOUBLE" => ScalarValue::Float(row.try_get(i)?),
        // Decimal keeps its exact text form.
        "DECIMAL" => ScalarValue::Text(row.try_get::<BigDecimal, _>(i)?.to_string()),
        "DATE" => ScalarValue::DateTime(row.try_get::<NaiveDate, _>(i)?.format("%Y-%m-%d").to_string()),
        "DATETIME" => ScalarValue::DateTime(format_datetime(row.try_get::<NaiveDateTime, _>(i)?)),
        "TIMESTAMP" => ScalarValue::DateTime(row.try_get::<chrono::DateTime<Utc>, _>(i)?.to_rfc3339()),
        "TIME" => ScalarValue::DateTime(row.try_get::<NaiveTime, _>(i)?.format("%H:%M:%S%.f").to_string()),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" | "GEOMETRY" => {
            ScalarValue::binary(&row.try_get::<Vec<u8>, _>(i)?)
        }
        _ => ScalarValue::Text(row.try_get(i)?),
    };
    Ok(value)
}

fn unsigned_value(v: u64) -> ScalarValue {
    i64::try_from(v).map_or_else(|_| ScalarValue::Text(v.to_string()), ScalarValue::Integer)
}

fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

/// Undecodable value: text when the bytes are UTF-8, a binary preview
/// otherwise.
fn bytes_value(bytes: Vec<u8>) -> ScalarValue {
    match String::from_utf8(bytes) {
        Ok(text) => ScalarValue::Text(text),
        Err(e) => ScalarValue::binary(e.as_bytes()),
    }
}
