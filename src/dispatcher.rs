//! Request dispatcher: the single entry point that routes a typed request
//! through introspection, translation, validation and execution, and wraps
//! the outcome in the caller-facing envelope.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::executor::{Database, QueryExecutor, QueryResult};
use crate::guard::{GuardPolicy, Provenance, SafetyGuard, SafetyVerdict, SqlCandidate, Warning};
use crate::llm::LanguageModel;
use crate::prompt::{PromptCompiler, TranslationRequest};
use crate::schema::{SchemaIntrospector, SchemaSnapshot, TableDescriptor};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    RawQuery {
        sql: String,
    },
    NaturalLanguageQuery {
        text: String,
        #[serde(default)]
        table_hint: Option<String>,
    },
    ListTables,
    DescribeTable {
        name: String,
    },
    SampleData {
        name: String,
        #[serde(default)]
        limit: Option<u64>,
    },
    GetSchema,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::RawQuery { .. } => "raw_query",
            Request::NaturalLanguageQuery { .. } => "natural_language_query",
            Request::ListTables => "list_tables",
            Request::DescribeTable { .. } => "describe_table",
            Request::SampleData { .. } => "sample_data",
            Request::GetSchema => "get_schema",
        }
    }
}

/// Result of a query request: the statement that actually ran (after any
/// rewriting) and its rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPayload {
    pub statement: String,
    pub provenance: Provenance,
    pub result: QueryResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub row_estimate: u64,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableList {
    pub tables: Vec<TableSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseData {
    Query(QueryPayload),
    Rows(QueryResult),
    Tables(TableList),
    Table(TableDescriptor),
    Schema(SchemaSnapshot),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
}

/// Uniform response envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(data: ResponseData, warnings: &[Warning]) -> Self {
        Self {
            ok: true,
            data: Some(data),
            warnings: warnings.iter().map(ToString::to_string).collect(),
            error: None,
        }
    }

    pub fn failure(err: &PipelineError) -> Self {
        Self {
            ok: false,
            data: None,
            warnings: Vec::new(),
            error: Some(ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
                reason: err.reason().map(|r| r.code().to_string()),
                statement: err.statement().map(str::to_string),
            }),
        }
    }
}

/// Tunables for one dispatcher instance.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub policy: GuardPolicy,
    pub schema_ttl: Duration,
    /// Maximum schema text, in characters, embedded in a prompt.
    pub schema_budget: usize,
    pub query_timeout: Duration,
    /// Deadline for a whole request, translation included.
    pub request_timeout: Duration,
    pub max_value_bytes: usize,
    pub sample_limit: u64,
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    requests: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    translations: AtomicU64,
}

impl DispatchStats {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    pub fn translations(&self) -> u64 {
        self.translations.load(Ordering::Relaxed)
    }
}

impl fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} failures={} rejections={} translations={}",
            self.requests(),
            self.failures(),
            self.rejections(),
            self.translations()
        )
    }
}

type Outcome = Result<(ResponseData, Vec<Warning>), PipelineError>;

pub struct Dispatcher {
    introspector: SchemaIntrospector,
    compiler: PromptCompiler,
    guard: SafetyGuard,
    executor: QueryExecutor,
    settings: PipelineSettings,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(db: Arc<dyn Database>, model: Arc<dyn LanguageModel>, settings: PipelineSettings) -> Self {
        Self {
            introspector: SchemaIntrospector::new(Arc::clone(&db), settings.schema_ttl),
            compiler: PromptCompiler::new(model, settings.schema_budget),
            guard: SafetyGuard::new(settings.policy.clone()),
            executor: QueryExecutor::new(db, settings.query_timeout, settings.max_value_bytes),
            settings,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn allows_writes(&self) -> bool {
        self.guard.policy().allows_writes()
    }

    /// Handle one request under the per-request deadline. Never fails: every
    /// error is folded into the envelope.
    pub async fn handle(&self, request: Request) -> Response {
        let kind = request.kind();
        let started = Instant::now();
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        debug!("Dispatching {kind} request");

        let deadline = self.settings.request_timeout;
        let outcome = match tokio::time::timeout(deadline, self.route(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PipelineError::DeadlineExceeded(deadline)),
        };

        let elapsed = started.elapsed().as_millis();
        match outcome {
            Ok((data, warnings)) => {
                info!("{kind} succeeded in {elapsed}ms with {} warning(s)", warnings.len());
                Response::success(data, &warnings)
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                if e.reason().is_some() {
                    self.stats.rejections.fetch_add(1, Ordering::Relaxed);
                }
                warn!("{kind} failed in {elapsed}ms with {}: {e}", e.kind());
                Response::failure(&e)
            }
        }
    }

    async fn route(&self, request: Request) -> Outcome {
        match request {
            Request::RawQuery { sql } => self.raw_query(sql).await,
            Request::NaturalLanguageQuery { text, table_hint } => {
                self.natural_language_query(TranslationRequest { text, table_hint }).await
            }
            Request::ListTables => {
                let snapshot = self.introspector.snapshot().await?;
                let tables = snapshot
                    .tables
                    .iter()
                    .map(|t| TableSummary {
                        name: t.name.clone(),
                        row_estimate: t.row_estimate,
                        columns: t.column_names().into_iter().map(String::from).collect(),
                    })
                    .collect();
                Ok((ResponseData::Tables(TableList { tables }), Vec::new()))
            }
            Request::DescribeTable { name } => {
                let table = self.introspector.describe_table(&name).await?;
                Ok((ResponseData::Table(table), Vec::new()))
            }
            Request::SampleData { name, limit } => {
                let limit = match limit.unwrap_or(self.settings.sample_limit) {
                    0 => return Err(PipelineError::InvalidRequest("limit must be at least 1".into())),
                    n => n.min(self.settings.policy.row_limit),
                };
                let (result, warnings) = self
                    .introspector
                    .sample_rows(&name, limit, &self.guard, &self.executor)
                    .await?;
                Ok((ResponseData::Rows(result), warnings))
            }
            Request::GetSchema => {
                let snapshot = self.introspector.snapshot().await?;
                Ok((ResponseData::Schema(SchemaSnapshot::clone(&snapshot)), Vec::new()))
            }
        }
    }

    /// Raw SQL does not depend on the schema: without a snapshot the guard
    /// runs minus its table-existence check and the caller is told so.
    async fn raw_query(&self, sql: String) -> Outcome {
        if sql.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("query is empty".into()));
        }
        let mut warnings = Vec::new();
        let snapshot = match self.introspector.snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warnings.push(Warning::SchemaUnavailable(e.to_string()));
                None
            }
        };
        self.run_statement(SqlCandidate::user_supplied(sql), snapshot.as_deref(), warnings)
            .await
    }

    async fn natural_language_query(&self, request: TranslationRequest) -> Outcome {
        if request.text.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("natural language query is empty".into()));
        }
        let snapshot = self.introspector.snapshot().await?;
        let translation = self.compiler.compile(&request, &snapshot).await?;
        self.stats.translations.fetch_add(1, Ordering::Relaxed);
        debug!("Translated request into: {}", translation.candidate.sql);

        let mut warnings = Vec::new();
        if translation.schema.is_partial() {
            warnings.push(Warning::SchemaPartial {
                included: translation.schema.included.len(),
                omitted: translation.schema.omitted.len(),
            });
        }
        self.run_statement(translation.candidate, Some(&*snapshot), warnings).await
    }

    async fn run_statement(
        &self,
        candidate: SqlCandidate,
        schema: Option<&SchemaSnapshot>,
        mut warnings: Vec<Warning>,
    ) -> Outcome {
        let verdict = self.guard.validate(&candidate, schema);
        if let (SafetyVerdict::Rejected { .. }, Some(raw)) = (&verdict, &candidate.raw_output) {
            debug!("Rejected statement was extracted from model output: {raw}");
        }
        let (statement, guard_warnings) = verdict.into_result()?;
        warnings.extend(guard_warnings);

        if !statement.kind().is_read_only() {
            warn!(
                target: "audit",
                "Executing {} statement ({}): {}",
                statement.kind(),
                statement.provenance(),
                statement.sql()
            );
        }

        let result = self.executor.execute(&statement, None).await?;
        let payload = QueryPayload {
            statement: statement.sql().to_string(),
            provenance: statement.provenance(),
            result,
        };
        Ok((ResponseData::Query(payload), warnings))
    }
}
