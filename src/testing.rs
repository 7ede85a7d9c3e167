//! In-memory stand-ins for the database and language-model boundaries.

use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::DriverError;
use crate::executor::{Database, RowSet, ScalarValue};
use crate::llm::{LanguageModel, ModelError};
use crate::schema::{ColumnDescriptor, ColumnType, SchemaSnapshot, TableDescriptor};

fn column(name: &str, declared: &str, nullable: bool, key: bool) -> ColumnDescriptor {
    ColumnDescriptor {
        name: name.into(),
        declared_type: declared.into(),
        column_type: ColumnType::from_declared(declared),
        nullable,
        is_key: key,
    }
}

pub fn users_table() -> TableDescriptor {
    TableDescriptor {
        name: "users".into(),
        columns: vec![
            column("id", "int(11)", false, true),
            column("name", "varchar(100)", false, false),
            column("email", "varchar(255)", true, false),
        ],
        primary_key: BTreeSet::from(["id".to_string()]),
        row_estimate: 3,
    }
}

pub fn orders_table() -> TableDescriptor {
    TableDescriptor {
        name: "orders".into(),
        columns: vec![
            column("id", "bigint(20)", false, true),
            column("user_id", "int(11)", false, true),
            column("total", "decimal(10,2)", false, false),
            column("placed_at", "datetime", false, false),
        ],
        primary_key: BTreeSet::from(["id".to_string()]),
        row_estimate: 12,
    }
}

/// Catalog order: sorted by table name, as the MySQL catalog query returns.
pub fn sample_tables() -> Vec<TableDescriptor> {
    vec![orders_table(), users_table()]
}

pub fn sample_snapshot() -> SchemaSnapshot {
    SchemaSnapshot::new(sample_tables())
}

pub fn users_rows() -> RowSet {
    let row = |id: i64, name: &str, email: &str| {
        vec![
            ScalarValue::Integer(id),
            ScalarValue::Text(name.into()),
            ScalarValue::Text(email.into()),
        ]
    };
    RowSet {
        columns: vec!["id".into(), "name".into(), "email".into()],
        rows: vec![
            row(1, "Ada", "ada@example.com"),
            row(2, "Grace", "grace@example.com"),
            row(3, "Linus", "linus@example.com"),
        ],
    }
}

/// Scripted database. Queued results are consumed first; once the queue is
/// empty, `query` answers with [`users_rows`] and `execute` with 1.
pub struct FakeDatabase {
    tables: Vec<TableDescriptor>,
    catalog_error: Mutex<Option<DriverError>>,
    queries: Mutex<VecDeque<Result<RowSet, DriverError>>>,
    executes: Mutex<VecDeque<Result<u64, DriverError>>>,
    statements: Mutex<Vec<String>>,
    timeouts: Mutex<Vec<Duration>>,
    abandoned: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
    catalog_calls: AtomicUsize,
    query_calls: AtomicUsize,
    execute_calls: AtomicUsize,
}

impl FakeDatabase {
    pub fn new(tables: Vec<TableDescriptor>) -> Self {
        Self {
            tables,
            catalog_error: Mutex::new(None),
            queries: Mutex::new(VecDeque::new()),
            executes: Mutex::new(VecDeque::new()),
            statements: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
            abandoned: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            catalog_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            execute_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_catalog(&self, error: DriverError) {
        *self.catalog_error.lock().unwrap() = Some(error);
    }

    pub fn restore_catalog(&self) {
        *self.catalog_error.lock().unwrap() = None;
    }

    pub fn push_query(&self, result: Result<RowSet, DriverError>) {
        self.queries.lock().unwrap().push_back(result);
    }

    pub fn push_execute(&self, result: Result<u64, DriverError>) {
        self.executes.lock().unwrap().push_back(result);
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    /// Timeouts passed with each query or execute call.
    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().unwrap().clone()
    }

    /// Statements whose call was dropped before it finished.
    pub fn abandoned(&self) -> Vec<String> {
        self.abandoned.lock().unwrap().clone()
    }

    pub fn catalog_calls(&self) -> usize {
        self.catalog_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    fn record(&self, sql: &str, timeout: Duration) {
        self.statements.lock().unwrap().push(sql.to_string());
        self.timeouts.lock().unwrap().push(timeout);
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Database for FakeDatabase {
    async fn query(&self, sql: &str, timeout: Duration) -> Result<RowSet, DriverError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.record(sql, timeout);
        let running = Running::new(&self.abandoned, sql);
        self.pause().await;
        running.finish();
        let scripted = self.queries.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(users_rows()))
    }

    async fn execute(&self, sql: &str, timeout: Duration) -> Result<u64, DriverError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        self.record(sql, timeout);
        let running = Running::new(&self.abandoned, sql);
        self.pause().await;
        running.finish();
        let scripted = self.executes.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(1))
    }

    async fn catalog(&self) -> Result<Vec<TableDescriptor>, DriverError> {
        self.catalog_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let failure = self.catalog_error.lock().unwrap().clone();
        match failure {
            Some(error) => Err(error),
            None => Ok(self.tables.clone()),
        }
    }
}

/// Records the statement as abandoned when dropped before `finish`.
struct Running {
    abandoned: Arc<Mutex<Vec<String>>>,
    sql: Option<String>,
}

impl Running {
    fn new(abandoned: &Arc<Mutex<Vec<String>>>, sql: &str) -> Self {
        Self {
            abandoned: abandoned.clone(),
            sql: Some(sql.to_string()),
        }
    }

    fn finish(mut self) {
        self.sql.take();
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(sql) = self.sql.take() {
            self.abandoned.lock().unwrap().push(sql);
        }
    }
}

/// Model that always answers with the same reply and records prompts.
pub struct FakeModel {
    reply: Result<String, String>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl FakeModel {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LanguageModel for FakeModel {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.reply.clone().map_err(ModelError::new)
    }

    fn model(&self) -> &str {
        "fake"
    }
}
