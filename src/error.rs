use std::fmt;
use std::time::Duration;

/// Stable policy rejection codes surfaced by the safety guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    ForbiddenStatementKind,
    MultipleStatementsDetected,
    ForbiddenConstruct,
    /// Warning-level only; never terminates a request.
    UnknownTable,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::ForbiddenStatementKind => "ForbiddenStatementKind",
            RejectReason::MultipleStatementsDetected => "MultipleStatementsDetected",
            RejectReason::ForbiddenConstruct => "ForbiddenConstruct",
            RejectReason::UnknownTable => "UnknownTable",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Classification of a failed statement execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    ConnectionLost,
    SyntaxError,
    ConstraintViolation,
    ExecutionTimeout,
    DatabaseError,
}

impl ExecutionErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionErrorKind::ConnectionLost => "ConnectionLost",
            ExecutionErrorKind::SyntaxError => "SyntaxError",
            ExecutionErrorKind::ConstraintViolation => "ConstraintViolation",
            ExecutionErrorKind::ExecutionTimeout => "ExecutionTimeout",
            ExecutionErrorKind::DatabaseError => "DatabaseError",
        }
    }

    /// Only connectivity failures may be retried, and only for reads.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionErrorKind::ConnectionLost)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
    pub statement: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            statement: statement.into(),
        }
    }

    pub fn timeout(statement: &str, after: Duration) -> Self {
        Self::new(
            ExecutionErrorKind::ExecutionTimeout,
            format!("statement exceeded its deadline of {}ms", after.as_millis()),
            statement,
        )
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for ExecutionError {}

/// Failure reported by a database driver before the executor classifies it
/// against a concrete statement.
#[derive(Debug, Clone)]
pub struct DriverError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn into_execution(self, statement: &str) -> ExecutionError {
        ExecutionError::new(self.kind, self.message, statement)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for DriverError {}

impl From<sqlx::Error> for DriverError {
    fn from(e: sqlx::Error) -> Self {
        let kind = match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_) => ExecutionErrorKind::ConnectionLost,
            sqlx::Error::Database(db) => classify_database_error(db.as_ref()),
            _ => ExecutionErrorKind::DatabaseError,
        };
        DriverError::new(kind, e.to_string())
    }
}

/// Map a MySQL server error onto the statement-level taxonomy.
///
/// Syntax class: 1064 (parse), 1054 (unknown column), 1146 (unknown table),
/// 1149, 1052 (ambiguous column). Constraint class: 1062 (duplicate key),
/// 1048 (null into NOT NULL), 1451/1452 (foreign keys), 3819 (CHECK).
/// Connection class: 2006/2013 (server gone / lost during query).
fn classify_database_error(db: &(dyn sqlx::error::DatabaseError + 'static)) -> ExecutionErrorKind {
    use sqlx::error::ErrorKind;

    match db.kind() {
        ErrorKind::UniqueViolation
        | ErrorKind::ForeignKeyViolation
        | ErrorKind::NotNullViolation
        | ErrorKind::CheckViolation => return ExecutionErrorKind::ConstraintViolation,
        _ => {}
    }

    let number = db
        .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
        .map(|e| e.number());
    match number {
        Some(1064 | 1054 | 1146 | 1149 | 1052 | 1109 | 1305) => ExecutionErrorKind::SyntaxError,
        Some(1062 | 1048 | 1451 | 1452 | 3819 | 1364 | 1216 | 1217) => {
            ExecutionErrorKind::ConstraintViolation
        }
        Some(2006 | 2013 | 1053 | 1927) => ExecutionErrorKind::ConnectionLost,
        Some(3024) => ExecutionErrorKind::ExecutionTimeout,
        _ => ExecutionErrorKind::DatabaseError,
    }
}

/// Every failure the pipeline can surface to a caller.
#[derive(Debug, Clone)]
pub enum PipelineError {
    SchemaUnavailable(String),
    TranslationUnparseable(String),
    ModelUnavailable(String),
    RejectedByPolicy { reason: RejectReason, detail: String },
    Execution(ExecutionError),
    TableNotFound { name: String, available: Vec<String> },
    InvalidRequest(String),
    DeadlineExceeded(Duration),
}

impl PipelineError {
    pub fn rejected(reason: RejectReason, detail: impl Into<String>) -> Self {
        PipelineError::RejectedByPolicy {
            reason,
            detail: detail.into(),
        }
    }

    /// Stable, enumerable kind string used in the response envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SchemaUnavailable(_) => "SchemaUnavailable",
            PipelineError::TranslationUnparseable(_) => "TranslationUnparseable",
            PipelineError::ModelUnavailable(_) => "ModelUnavailable",
            PipelineError::RejectedByPolicy { .. } => "RejectedByPolicy",
            PipelineError::Execution(e) => e.kind.code(),
            PipelineError::TableNotFound { .. } => "TableNotFound",
            PipelineError::InvalidRequest(_) => "InvalidRequest",
            PipelineError::DeadlineExceeded(_) => "DeadlineExceeded",
        }
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            PipelineError::RejectedByPolicy { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn statement(&self) -> Option<&str> {
        match self {
            PipelineError::Execution(e) => Some(&e.statement),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::SchemaUnavailable(msg) => write!(f, "Schema unavailable: {msg}"),
            PipelineError::TranslationUnparseable(msg) => write!(
                f,
                "Could not extract a single SQL statement from the model reply ({msg}). Please rephrase the request."
            ),
            PipelineError::ModelUnavailable(msg) => write!(f, "Language model unavailable: {msg}"),
            PipelineError::RejectedByPolicy { reason, detail } => {
                write!(f, "Rejected by policy ({reason}): {detail}")
            }
            PipelineError::Execution(e) => f.write_str(&e.message),
            PipelineError::TableNotFound { name, available } => write!(
                f,
                "Table '{name}' not found. Available tables: {}",
                available.join(", ")
            ),
            PipelineError::InvalidRequest(msg) => write!(f, "Invalid request: {msg}"),
            PipelineError::DeadlineExceeded(after) => {
                write!(f, "Request exceeded its deadline of {}ms", after.as_millis())
            }
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ExecutionError> for PipelineError {
    fn from(e: ExecutionError) -> Self {
        PipelineError::Execution(e)
    }
}
