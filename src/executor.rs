//! Query execution against the database boundary.

use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{DriverError, ExecutionError};
use crate::guard::ApprovedStatement;
use crate::schema::TableDescriptor;

const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Preview of a binary value: total length plus a bounded hex prefix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinaryValue {
    pub length: usize,
    pub hex: String,
    pub truncated: bool,
}

/// Serialization-safe cell value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    /// ISO-8601 formatted.
    DateTime(String),
    Binary(BinaryValue),
}

impl ScalarValue {
    pub fn binary(bytes: &[u8]) -> Self {
        ScalarValue::Binary(BinaryValue {
            length: bytes.len(),
            hex: hex(bytes),
            truncated: false,
        })
    }

    /// Cap text and binary payloads at roughly `max_bytes`, marking the cut.
    pub fn bounded(self, max_bytes: usize) -> Self {
        match self {
            ScalarValue::Text(s) if s.len() > max_bytes => {
                let mut cut = max_bytes;
                while !s.is_char_boundary(cut) {
                    cut -= 1;
                }
                ScalarValue::Text(format!("{}…[truncated, {} bytes total]", &s[..cut], s.len()))
            }
            ScalarValue::Binary(b) if b.hex.len() > max_bytes => {
                let keep = (max_bytes / 2) * 2;
                ScalarValue::Binary(BinaryValue {
                    length: b.length,
                    hex: b.hex[..keep].to_string(),
                    truncated: true,
                })
            }
            other => other,
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Raw rows as produced by a driver, before value bounding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ScalarValue>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    /// Each row is aligned with `columns`.
    pub rows: Vec<Vec<ScalarValue>>,
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub elapsed_ms: u64,
}

/// Statement execution and catalog access supplied by a database driver.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run a statement that returns rows. The driver bounds the statement
    /// on the server by `timeout` and stops it there if the call is dropped.
    async fn query(&self, sql: &str, timeout: Duration) -> Result<RowSet, DriverError>;

    /// Run a statement for its side effects; returns affected row count.
    /// Same cancellation contract as `query`.
    async fn execute(&self, sql: &str, timeout: Duration) -> Result<u64, DriverError>;

    /// Tables, columns and keys of the current database.
    async fn catalog(&self) -> Result<Vec<TableDescriptor>, DriverError>;
}

enum Outcome {
    Rows(RowSet),
    Affected(u64),
}

pub struct QueryExecutor {
    db: Arc<dyn Database>,
    default_timeout: Duration,
    max_value_bytes: usize,
    retry_backoff: Duration,
}

impl QueryExecutor {
    pub fn new(db: Arc<dyn Database>, default_timeout: Duration, max_value_bytes: usize) -> Self {
        Self {
            db,
            default_timeout,
            max_value_bytes,
            retry_backoff: RETRY_BACKOFF,
        }
    }

    /// Run an approved statement under `timeout` (or the default). Read-only
    /// statements get one retry after a connectivity failure; writes never
    /// retry.
    pub async fn execute(
        &self,
        statement: &ApprovedStatement,
        timeout: Option<Duration>,
    ) -> Result<QueryResult, ExecutionError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();

        let outcome = match self.attempt(statement, timeout).await {
            Err(e) if e.kind.is_transient() && statement.kind().is_read_only() => {
                warn!("Transient failure ({e}); retrying once in {}ms", self.retry_backoff.as_millis());
                tokio::time::sleep(self.retry_backoff).await;
                self.attempt(statement, timeout).await
            }
            other => other,
        }?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Outcome::Rows(set) => {
                let max = self.max_value_bytes;
                let rows: Vec<Vec<ScalarValue>> = set
                    .rows
                    .into_iter()
                    .map(|row| row.into_iter().map(|v| v.bounded(max)).collect())
                    .collect();
                QueryResult {
                    columns: set.columns,
                    row_count: rows.len(),
                    rows,
                    rows_affected: None,
                    elapsed_ms,
                }
            }
            Outcome::Affected(count) => QueryResult {
                columns: Vec::new(),
                rows: Vec::new(),
                row_count: 0,
                rows_affected: Some(count),
                elapsed_ms,
            },
        };
        debug!("Statement finished in {elapsed_ms}ms ({} rows)", result.row_count);
        Ok(result)
    }

    /// One bounded attempt. On timeout the in-flight driver future is
    /// dropped, which cancels the statement on the server.
    async fn attempt(&self, statement: &ApprovedStatement, timeout: Duration) -> Result<Outcome, ExecutionError> {
        let sql = statement.sql();
        let work = async {
            if statement.kind().is_read_only() {
                self.db.query(sql, timeout).await.map(Outcome::Rows)
            } else {
                self.db.execute(sql, timeout).await.map(Outcome::Affected)
            }
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.into_execution(sql)),
            Err(_) => Err(ExecutionError::timeout(sql, timeout)),
        }
    }

    #[cfg(test)]
    fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionErrorKind;
    use crate::guard::{GuardPolicy, SafetyGuard, SqlCandidate};
    use crate::testing::{sample_tables, FakeDatabase};

    fn approve(sql: &str, writes: bool) -> ApprovedStatement {
        let policy = if writes {
            GuardPolicy::with_writes(1000)
        } else {
            GuardPolicy::read_only(1000)
        };
        SafetyGuard::new(policy)
            .validate(&SqlCandidate::user_supplied(sql), None)
            .into_result()
            .unwrap()
            .0
    }

    fn executor(db: Arc<FakeDatabase>) -> QueryExecutor {
        QueryExecutor::new(db, Duration::from_millis(200), 16).with_retry_backoff(Duration::from_millis(1))
    }

    #[test]
    fn test_text_truncation_respects_char_boundaries() {
        let value = ScalarValue::Text("ééééé".into()).bounded(3);
        assert_eq!(value, ScalarValue::Text("é…[truncated, 10 bytes total]".into()));
        assert_eq!(ScalarValue::Text("short".into()).bounded(16), ScalarValue::Text("short".into()));
    }

    #[test]
    fn test_binary_is_previewed_and_bounded() {
        let value = ScalarValue::binary(&[0xde, 0xad, 0xbe, 0xef, 0x00]).bounded(5);
        assert_eq!(
            value,
            ScalarValue::Binary(BinaryValue {
                length: 5,
                hex: "dead".into(),
                truncated: true,
            })
        );
    }

    #[test]
    fn test_values_serialize_to_plain_json() {
        let row = vec![
            ScalarValue::Null,
            ScalarValue::Integer(7),
            ScalarValue::Boolean(true),
            ScalarValue::DateTime("2024-01-02T03:04:05".into()),
        ];
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"[null,7,true,"2024-01-02T03:04:05"]"#
        );
    }

    #[tokio::test]
    async fn test_rows_are_bounded() {
        let db = Arc::new(FakeDatabase::new(sample_tables()));
        db.push_query(Ok(RowSet {
            columns: vec!["bio".into()],
            rows: vec![vec![ScalarValue::Text("x".repeat(100))]],
        }));
        let result = executor(db).execute(&approve("SELECT bio FROM users LIMIT 1", false), None).await.unwrap();
        assert_eq!(result.row_count, 1);
        match &result.rows[0][0] {
            ScalarValue::Text(s) => assert!(s.ends_with("[truncated, 100 bytes total]")),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_returns_execution_timeout() {
        let db = Arc::new(FakeDatabase::new(sample_tables()).with_delay(Duration::from_millis(500)));
        let err = executor(db)
            .execute(&approve("SELECT * FROM users", false), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::ExecutionTimeout);
        assert_eq!(err.statement, "SELECT * FROM users LIMIT 1000");
    }

    #[tokio::test]
    async fn test_timeout_is_handed_to_the_driver() {
        let db = Arc::new(FakeDatabase::new(sample_tables()));
        let executor = executor(db.clone());
        executor.execute(&approve("SELECT 1", false), None).await.unwrap();
        executor
            .execute(&approve("DELETE FROM users WHERE id = 1", true), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(db.timeouts(), vec![Duration::from_millis(200), Duration::from_secs(5)]);
    }

    #[tokio::test]
    async fn test_timeout_drops_the_running_statement() {
        let db = Arc::new(FakeDatabase::new(sample_tables()).with_delay(Duration::from_millis(500)));
        executor(db.clone())
            .execute(&approve("SELECT * FROM users", false), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(db.abandoned(), vec!["SELECT * FROM users LIMIT 1000".to_string()]);
    }

    #[tokio::test]
    async fn test_read_retried_once_after_connection_loss() {
        let db = Arc::new(FakeDatabase::new(sample_tables()));
        db.push_query(Err(DriverError::new(ExecutionErrorKind::ConnectionLost, "gone away")));
        let result = executor(db.clone()).execute(&approve("SELECT 1", false), None).await.unwrap();
        assert_eq!(result.row_count, 3);
        assert_eq!(db.query_calls(), 2);
    }

    #[tokio::test]
    async fn test_read_not_retried_twice() {
        let db = Arc::new(FakeDatabase::new(sample_tables()));
        db.push_query(Err(DriverError::new(ExecutionErrorKind::ConnectionLost, "gone away")));
        db.push_query(Err(DriverError::new(ExecutionErrorKind::ConnectionLost, "still gone")));
        let err = executor(db.clone()).execute(&approve("SELECT 1", false), None).await.unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::ConnectionLost);
        assert_eq!(err.message, "still gone");
        assert_eq!(db.query_calls(), 2);
    }

    #[tokio::test]
    async fn test_syntax_errors_are_not_retried() {
        let db = Arc::new(FakeDatabase::new(sample_tables()));
        db.push_query(Err(DriverError::new(ExecutionErrorKind::SyntaxError, "You have an error")));
        let err = executor(db.clone()).execute(&approve("SELECT nope FROM users", false), None).await.unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::SyntaxError);
        assert_eq!(db.query_calls(), 1);
    }

    #[tokio::test]
    async fn test_write_never_retried() {
        let db = Arc::new(FakeDatabase::new(sample_tables()));
        db.push_execute(Err(DriverError::new(ExecutionErrorKind::ConnectionLost, "gone away")));
        let err = executor(db.clone())
            .execute(&approve("DELETE FROM users WHERE id = 1", true), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::ConnectionLost);
        assert_eq!(db.execute_calls(), 1);
        assert_eq!(db.query_calls(), 0);
    }

    #[tokio::test]
    async fn test_write_reports_rows_affected() {
        let db = Arc::new(FakeDatabase::new(sample_tables()));
        db.push_execute(Ok(4));
        let result = executor(db)
            .execute(&approve("UPDATE users SET name = 'x'", true), None)
            .await
            .unwrap();
        assert_eq!(result.rows_affected, Some(4));
        assert!(result.rows.is_empty());
    }
}
