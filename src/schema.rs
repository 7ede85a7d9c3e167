//! Schema snapshot model and the introspector that builds and caches it.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::executor::{Database, QueryExecutor, QueryResult};
use crate::guard::{SafetyGuard, SqlCandidate, Warning};

/// Declared column types collapsed into the handful of shapes callers and
/// the prompt care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Boolean,
    DateTime,
    Binary,
    Other,
}

impl ColumnType {
    /// Normalize a MySQL `COLUMN_TYPE` such as `int(11) unsigned` or
    /// `tinyint(1)`.
    pub fn from_declared(declared: &str) -> Self {
        let lower = declared.trim().to_ascii_lowercase();
        if lower.starts_with("tinyint(1)") || lower.starts_with("bit(1)") {
            return ColumnType::Boolean;
        }
        let base = lower
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        match base {
            "bool" | "boolean" => ColumnType::Boolean,
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" => ColumnType::Integer,
            "float" | "double" | "real" | "decimal" | "numeric" | "dec" | "fixed" => ColumnType::Float,
            "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" | "enum" | "set" | "json" => {
                ColumnType::Text
            }
            "date" | "time" | "datetime" | "timestamp" => ColumnType::DateTime,
            "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" | "bit" => ColumnType::Binary,
            _ => ColumnType::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Type as declared in the catalog, e.g. `varchar(255)`.
    pub declared_type: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub nullable: bool,
    pub is_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: BTreeSet<String>,
    pub row_estimate: u64,
}

impl TableDescriptor {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Point-in-time structural view of the database. Never mutated after
/// construction; a refresh builds a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableDescriptor>,
}

impl SchemaSnapshot {
    pub fn new(tables: Vec<TableDescriptor>) -> Self {
        Self { tables }
    }

    /// Exact match first, then a unique case-insensitive match.
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        if let Some(table) = self.tables.iter().find(|t| t.name == name) {
            return Some(table);
        }
        let mut matches = self.tables.iter().filter(|t| t.name.eq_ignore_ascii_case(name));
        match (matches.next(), matches.next()) {
            (Some(table), None) => Some(table),
            _ => None,
        }
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

struct CachedSnapshot {
    snapshot: Arc<SchemaSnapshot>,
    built_at: Instant,
}

/// Builds schema snapshots from the database catalog and caches them for a
/// TTL. Readers clone an `Arc` out of the slot; a rebuild constructs a fresh
/// snapshot and swaps the pointer, so no reader sees a partial table list.
pub struct SchemaIntrospector {
    db: Arc<dyn Database>,
    ttl: Duration,
    current: RwLock<Option<CachedSnapshot>>,
    rebuild: tokio::sync::Mutex<()>,
}

impl SchemaIntrospector {
    pub fn new(db: Arc<dyn Database>, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            current: RwLock::new(None),
            rebuild: tokio::sync::Mutex::new(()),
        }
    }

    fn fresh(&self) -> Option<Arc<SchemaSnapshot>> {
        let slot = self.current.read().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .filter(|cached| cached.built_at.elapsed() < self.ttl)
            .map(|cached| Arc::clone(&cached.snapshot))
    }

    /// Current snapshot, rebuilt from the catalog when the cached one is
    /// older than the TTL. Fails with `SchemaUnavailable` rather than
    /// falling back to a stale or empty snapshot.
    pub async fn snapshot(&self) -> Result<Arc<SchemaSnapshot>, PipelineError> {
        if let Some(snapshot) = self.fresh() {
            return Ok(snapshot);
        }

        // One rebuild at a time; late arrivals reuse the winner's result.
        let _rebuilding = self.rebuild.lock().await;
        if let Some(snapshot) = self.fresh() {
            return Ok(snapshot);
        }

        debug!("Rebuilding schema snapshot from catalog");
        let tables = self.db.catalog().await.map_err(|e| {
            warn!("Schema introspection failed: {e}");
            PipelineError::SchemaUnavailable(e.to_string())
        })?;
        let snapshot = Arc::new(SchemaSnapshot::new(tables));
        info!("Schema snapshot built with {} tables", snapshot.tables.len());

        let mut slot = self.current.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(CachedSnapshot {
            snapshot: Arc::clone(&snapshot),
            built_at: Instant::now(),
        });
        Ok(snapshot)
    }

    pub async fn describe_table(&self, name: &str) -> Result<TableDescriptor, PipelineError> {
        let snapshot = self.snapshot().await?;
        lookup(&snapshot, name).cloned()
    }

    /// Up to `limit` rows of `name`. The table must exist in the current
    /// snapshot; the generated statement still goes through the guard.
    pub async fn sample_rows(
        &self,
        name: &str,
        limit: u64,
        guard: &SafetyGuard,
        executor: &QueryExecutor,
    ) -> Result<(QueryResult, Vec<Warning>), PipelineError> {
        let snapshot = self.snapshot().await?;
        let table = lookup(&snapshot, name)?;

        let sql = format!("SELECT * FROM {} LIMIT {limit}", quote_identifier(&table.name));
        let candidate = SqlCandidate::internal(sql);
        let (statement, warnings) = guard.validate(&candidate, Some(&snapshot)).into_result()?;
        let result = executor.execute(&statement, None).await?;
        Ok((result, warnings))
    }
}

fn lookup<'a>(snapshot: &'a SchemaSnapshot, name: &str) -> Result<&'a TableDescriptor, PipelineError> {
    snapshot.table(name).ok_or_else(|| PipelineError::TableNotFound {
        name: name.to_string(),
        available: snapshot.table_names(),
    })
}

/// Backtick-quote a MySQL identifier.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}
