//! SQL safety guard.
//!
//! Every statement, whether typed by a caller, produced by the language
//! model, or built internally, passes through [`SafetyGuard::validate`]
//! before it can reach the executor. Only an [`ApprovedStatement`] can be
//! executed and only this module can construct one.
//!
//! Checks run in order and stop at the first failure:
//! 1. lexing (unterminated text, executable comments) and separator detection
//! 2. statement-kind whitelist
//! 3. forbidden constructs (system schemas, procedures, file I/O, sleeps)
//! 4. row-limit injection for unbounded SELECTs
//! 5. table existence against the current schema snapshot (warnings only)

use log::debug;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use crate::error::{PipelineError, RejectReason};
use crate::lexer::{tokenize, Token, TokenKind};
use crate::schema::SchemaSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Show,
    Describe,
    Explain,
    Insert,
    Update,
    Delete,
    Other(String),
}

impl StatementKind {
    /// Parse a configured whitelist entry.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "select" => Some(StatementKind::Select),
            "show" => Some(StatementKind::Show),
            "describe" | "desc" => Some(StatementKind::Describe),
            "explain" => Some(StatementKind::Explain),
            "insert" | "replace" => Some(StatementKind::Insert),
            "update" => Some(StatementKind::Update),
            "delete" => Some(StatementKind::Delete),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Show => "SHOW",
            StatementKind::Describe => "DESCRIBE",
            StatementKind::Explain => "EXPLAIN",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Other(keyword) => keyword,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            StatementKind::Select | StatementKind::Show | StatementKind::Describe | StatementKind::Explain
        )
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    UserSupplied,
    ModelGenerated,
    /// Built by the server itself, e.g. table sampling.
    Internal,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Provenance::UserSupplied => "user_supplied",
            Provenance::ModelGenerated => "model_generated",
            Provenance::Internal => "internal",
        })
    }
}

/// An unvalidated statement. Untrusted regardless of where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlCandidate {
    pub sql: String,
    pub provenance: Provenance,
    /// Raw model reply the statement was extracted from.
    pub raw_output: Option<String>,
}

impl SqlCandidate {
    pub fn user_supplied(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            provenance: Provenance::UserSupplied,
            raw_output: None,
        }
    }

    pub fn model_generated(sql: impl Into<String>, raw_output: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            provenance: Provenance::ModelGenerated,
            raw_output: Some(raw_output.into()),
        }
    }

    pub fn internal(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            provenance: Provenance::Internal,
            raw_output: None,
        }
    }
}

/// Non-fatal conditions surfaced alongside a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    RowLimitInjected(u64),
    UnknownTable(String),
    SchemaPartial { included: usize, omitted: usize },
    SchemaUnavailable(String),
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::RowLimitInjected(limit) => {
                write!(f, "No LIMIT clause given; results capped at {limit} rows")
            }
            Warning::UnknownTable(name) => write!(
                f,
                "{}: table '{name}' is not in the current schema snapshot",
                RejectReason::UnknownTable
            ),
            Warning::SchemaPartial { included, omitted } => write!(
                f,
                "Schema grounding was partial: {included} table(s) described, {omitted} omitted to fit the prompt budget"
            ),
            Warning::SchemaUnavailable(msg) => {
                write!(f, "Table existence was not checked ({msg})")
            }
        }
    }
}

/// A statement that passed every policy check. Fields are private so the
/// executor can only ever receive guard output.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovedStatement {
    sql: String,
    kind: StatementKind,
    provenance: Provenance,
}

impl ApprovedStatement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn kind(&self) -> &StatementKind {
        &self.kind
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyVerdict {
    Approved {
        statement: ApprovedStatement,
        warnings: Vec<Warning>,
    },
    Rejected {
        reason: RejectReason,
        detail: String,
    },
}

impl SafetyVerdict {
    fn reject(reason: RejectReason, detail: impl Into<String>) -> Self {
        SafetyVerdict::Rejected {
            reason,
            detail: detail.into(),
        }
    }

    pub fn into_result(self) -> Result<(ApprovedStatement, Vec<Warning>), PipelineError> {
        match self {
            SafetyVerdict::Approved { statement, warnings } => Ok((statement, warnings)),
            SafetyVerdict::Rejected { reason, detail } => Err(PipelineError::rejected(reason, detail)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardPolicy {
    pub allowed: HashSet<StatementKind>,
    pub row_limit: u64,
}

impl GuardPolicy {
    pub fn read_only(row_limit: u64) -> Self {
        Self {
            allowed: [
                StatementKind::Select,
                StatementKind::Show,
                StatementKind::Describe,
                StatementKind::Explain,
            ]
            .into_iter()
            .collect(),
            row_limit,
        }
    }

    pub fn with_writes(row_limit: u64) -> Self {
        let mut policy = Self::read_only(row_limit);
        policy
            .allowed
            .extend([StatementKind::Insert, StatementKind::Update, StatementKind::Delete]);
        policy
    }

    pub fn allows_writes(&self) -> bool {
        self.allowed.iter().any(|kind| !kind.is_read_only())
    }
}

/// Functions that read files, stall the server or take global locks.
const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "LOAD_FILE",
    "SLEEP",
    "BENCHMARK",
    "GET_LOCK",
    "RELEASE_LOCK",
    "RELEASE_ALL_LOCKS",
    "MASTER_POS_WAIT",
    "SOURCE_POS_WAIT",
    "SYS_EXEC",
    "SYS_EVAL",
];

/// Procedure invocation and dynamic SQL. Only checked where a statement
/// can begin, so columns with these names still work.
const FORBIDDEN_KEYWORDS: &[&str] = &["CALL", "PREPARE", "EXECUTE", "DEALLOCATE", "HANDLER"];

const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

/// Words that end a table reference list, so they are never taken for an alias.
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "OUTER", "CROSS", "NATURAL", "STRAIGHT_JOIN", "ON",
    "USING", "GROUP", "ORDER", "LIMIT", "HAVING", "WINDOW", "UNION", "EXCEPT", "INTERSECT", "FOR",
    "LOCK", "SET", "VALUES", "VALUE", "SELECT", "PARTITION", "USE", "FORCE", "IGNORE", "INTO",
    "AS", "WITH", "RETURNING", "ROW", "TABLE", "LATERAL",
];

pub struct SafetyGuard {
    policy: GuardPolicy,
}

impl SafetyGuard {
    pub fn new(policy: GuardPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    /// Produce exactly one verdict for `candidate`. `schema` enables the
    /// table existence check; pass `None` when no snapshot is available.
    pub fn validate(&self, candidate: &SqlCandidate, schema: Option<&SchemaSnapshot>) -> SafetyVerdict {
        let sql = candidate.sql.as_str();
        let tokens = match tokenize(sql) {
            Ok(tokens) => tokens,
            Err(e) => return SafetyVerdict::reject(RejectReason::ForbiddenConstruct, e.to_string()),
        };

        if tokens.is_empty() {
            return SafetyVerdict::reject(RejectReason::ForbiddenStatementKind, "empty statement");
        }

        if let Some(sep) = tokens.iter().find(|t| t.kind == TokenKind::Separator) {
            return SafetyVerdict::reject(
                RejectReason::MultipleStatementsDetected,
                format!("statement separator at offset {}", sep.start),
            );
        }

        let kind = classify(&tokens);
        if !self.policy.allowed.contains(&kind) {
            let mut allowed: Vec<&str> = self.policy.allowed.iter().map(StatementKind::name).collect();
            allowed.sort_unstable();
            return SafetyVerdict::reject(
                RejectReason::ForbiddenStatementKind,
                format!("{kind} statements are not permitted (allowed: {})", allowed.join(", ")),
            );
        }

        if let Some(detail) = find_forbidden_construct(&tokens) {
            return SafetyVerdict::reject(RejectReason::ForbiddenConstruct, detail);
        }

        let mut warnings = Vec::new();
        let mut final_sql = sql.trim().to_string();
        if kind == StatementKind::Select && !has_top_level_limit(&tokens) {
            final_sql = inject_limit(sql, &tokens, self.policy.row_limit);
            warnings.push(Warning::RowLimitInjected(self.policy.row_limit));
        }

        if let Some(schema) = schema {
            let ctes = cte_names(&tokens);
            let mut seen = HashSet::new();
            for table in referenced_tables(&tokens) {
                let lower = table.to_lowercase();
                if lower == "dual" || ctes.contains(&lower) || !seen.insert(lower) {
                    continue;
                }
                if schema.table(&table).is_none() {
                    warnings.push(Warning::UnknownTable(table));
                }
            }
        }

        debug!(
            "Approved {kind} statement ({}) with {} warning(s)",
            candidate.provenance,
            warnings.len()
        );
        SafetyVerdict::Approved {
            statement: ApprovedStatement {
                sql: final_sql,
                kind,
                provenance: candidate.provenance,
            },
            warnings,
        }
    }
}

/// Leading-keyword classifier. Parentheses before the first keyword are
/// skipped; `WITH`, `EXPLAIN` and `DESCRIBE` take the kind of the statement
/// they wrap when that statement writes.
fn classify(tokens: &[Token<'_>]) -> StatementKind {
    let start = tokens.iter().position(|t| !t.is_punct('(')).unwrap_or(tokens.len());
    let Some(first) = tokens.get(start) else {
        return StatementKind::Other("(".into());
    };
    if first.kind != TokenKind::Word {
        return StatementKind::Other(first.text.to_string());
    }

    match first.upper().as_str() {
        "SELECT" => StatementKind::Select,
        "WITH" => classify_with(&tokens[start + 1..]),
        "SHOW" => StatementKind::Show,
        "INSERT" | "REPLACE" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        keyword @ ("EXPLAIN" | "DESCRIBE" | "DESC") => {
            let wrapped = tokens[start + 1..].iter().position(|t| {
                ["SELECT", "WITH", "INSERT", "REPLACE", "UPDATE", "DELETE"]
                    .iter()
                    .any(|k| t.is_keyword(k))
            });
            let inner = wrapped.map(|at| classify(&tokens[start + 1 + at..]));
            match inner {
                Some(kind) if !kind.is_read_only() => kind,
                _ if keyword == "EXPLAIN" => StatementKind::Explain,
                _ => StatementKind::Describe,
            }
        }
        other => StatementKind::Other(other.to_string()),
    }
}

/// The main statement of a `WITH` query is the first statement keyword at
/// parenthesis depth zero.
fn classify_with(tokens: &[Token<'_>]) -> StatementKind {
    let mut depth = 0i32;
    for token in tokens {
        match token.kind {
            TokenKind::Punct('(') => depth += 1,
            TokenKind::Punct(')') => depth -= 1,
            TokenKind::Word if depth == 0 => match token.upper().as_str() {
                "SELECT" => return StatementKind::Select,
                "INSERT" | "REPLACE" => return StatementKind::Insert,
                "UPDATE" => return StatementKind::Update,
                "DELETE" => return StatementKind::Delete,
                _ => {}
            },
            _ => {}
        }
    }
    StatementKind::Other("WITH".into())
}

fn find_forbidden_construct(tokens: &[Token<'_>]) -> Option<String> {
    for (i, token) in tokens.iter().enumerate() {
        let next = tokens.get(i + 1);
        let prev_is_dot = i > 0 && tokens[i - 1].is_punct('.');

        if token.kind == TokenKind::Variable && token.text.starts_with("@@") {
            return Some(format!("system variable access ({})", token.text));
        }

        if let Some(name) = token.ident() {
            let lower = name.to_lowercase();
            if SYSTEM_SCHEMAS.contains(&lower.as_str()) && !prev_is_dot {
                let qualifies = next.is_some_and(|n| n.is_punct('.'));
                let always = lower == "information_schema" || lower == "performance_schema";
                if always || qualifies {
                    return Some(format!("reference to system schema '{name}'"));
                }
            }
        }

        if token.kind != TokenKind::Word || prev_is_dot {
            continue;
        }
        let upper = token.upper();

        if FORBIDDEN_FUNCTIONS.contains(&upper.as_str()) && next.is_some_and(|n| n.is_punct('(')) {
            return Some(format!("call to {upper}()"));
        }
        let at_statement_start = i == 0 || tokens[i - 1].is_punct('(');
        if FORBIDDEN_KEYWORDS.contains(&upper.as_str())
            && at_statement_start
            && next.is_some_and(|n| n.ident().is_some())
        {
            return Some(format!("stored procedure or dynamic SQL ({upper})"));
        }
        if upper == "INTO" && next.is_some_and(|n| n.is_keyword("OUTFILE") || n.is_keyword("DUMPFILE")) {
            return Some(format!("file output (INTO {})", next.map(|n| n.upper()).unwrap_or_default()));
        }
        if upper == "LOAD" && next.is_some_and(|n| n.is_keyword("DATA") || n.is_keyword("XML")) {
            return Some("file input (LOAD DATA/XML)".into());
        }
    }
    None
}

fn has_top_level_limit(tokens: &[Token<'_>]) -> bool {
    let mut depth = 0i32;
    tokens.iter().any(|t| {
        match t.kind {
            TokenKind::Punct('(') => depth += 1,
            TokenKind::Punct(')') => depth -= 1,
            _ => {}
        }
        depth == 0 && t.is_keyword("LIMIT")
    })
}

/// Append `LIMIT n`, placing it before a trailing locking clause or a
/// trailing `INTO @var` so the statement stays valid.
fn inject_limit(sql: &str, tokens: &[Token<'_>], limit: u64) -> String {
    let mut depth = 0i32;
    let mut seen_from = false;
    let mut insert_at = None;

    for (i, t) in tokens.iter().enumerate() {
        match t.kind {
            TokenKind::Punct('(') => depth += 1,
            TokenKind::Punct(')') => depth -= 1,
            _ => {}
        }
        if depth != 0 || t.kind != TokenKind::Word {
            continue;
        }
        let next = tokens.get(i + 1);
        if t.is_keyword("FROM") {
            seen_from = true;
        } else if (t.is_keyword("FOR") && next.is_some_and(|n| n.is_keyword("UPDATE") || n.is_keyword("SHARE")))
            || (t.is_keyword("LOCK") && next.is_some_and(|n| n.is_keyword("IN")))
            || (t.is_keyword("INTO") && seen_from)
        {
            insert_at = Some(t.start);
            break;
        }
    }

    let end = tokens.last().map(|t| t.end).unwrap_or(sql.len());
    match insert_at {
        Some(at) => format!("{} LIMIT {limit} {}", sql[..at].trim(), sql[at..end].trim()),
        None => format!("{} LIMIT {limit}", sql[..end].trim()),
    }
}

/// Names defined by a leading `WITH` clause.
fn cte_names(tokens: &[Token<'_>]) -> HashSet<String> {
    let mut names = HashSet::new();
    let Some(start) = tokens.iter().position(|t| !t.is_punct('(')) else {
        return names;
    };
    if !tokens[start].is_keyword("WITH") {
        return names;
    }

    let mut i = start + 1;
    if tokens.get(i).is_some_and(|t| t.is_keyword("RECURSIVE")) {
        i += 1;
    }
    while let Some(name) = tokens.get(i).and_then(Token::ident) {
        names.insert(name.to_lowercase());
        i += 1;
        if tokens.get(i).is_some_and(|t| t.is_punct('(')) {
            i = skip_group(tokens, i);
        }
        if !tokens.get(i).is_some_and(|t| t.is_keyword("AS")) {
            break;
        }
        i += 1;
        if !tokens.get(i).is_some_and(|t| t.is_punct('(')) {
            break;
        }
        i = skip_group(tokens, i);
        if !tokens.get(i).is_some_and(|t| t.is_punct(',')) {
            break;
        }
        i += 1;
    }
    names
}

/// Index just past the parenthesised group opening at `open`.
fn skip_group(tokens: &[Token<'_>], open: usize) -> usize {
    let mut depth = 0i32;
    for (i, t) in tokens.iter().enumerate().skip(open) {
        match t.kind {
            TokenKind::Punct('(') => depth += 1,
            TokenKind::Punct(')') => {
                depth -= 1;
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
    }
    tokens.len()
}

fn is_clause_keyword(token: &Token<'_>) -> bool {
    token.kind == TokenKind::Word && CLAUSE_KEYWORDS.iter().any(|k| token.is_keyword(k))
}

/// Table names following FROM, JOIN, UPDATE, INTO and DESCRIBE. Subqueries
/// and derived tables are skipped; qualified names yield their last part.
/// A FROM inside function arguments such as `EXTRACT(YEAR FROM col)` is not
/// a table list.
fn referenced_tables(tokens: &[Token<'_>]) -> Vec<String> {
    let mut tables = Vec::new();
    // One entry per open parenthesis: true for a function argument list.
    let mut groups: Vec<bool> = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        if token.is_punct('(') {
            let after_word = i > 0 && tokens[i - 1].kind == TokenKind::Word;
            let subquery = tokens
                .get(i + 1)
                .is_some_and(|t| t.is_keyword("SELECT") || t.is_keyword("WITH"));
            groups.push(after_word && !subquery);
            continue;
        }
        if token.is_punct(')') {
            groups.pop();
            continue;
        }
        if groups.contains(&true) {
            continue;
        }

        let starts_list = ["FROM", "JOIN", "UPDATE", "INTO"].iter().any(|k| token.is_keyword(k))
            || (i == 0 && (token.is_keyword("DESCRIBE") || token.is_keyword("DESC")));
        if !starts_list || (i > 0 && tokens[i - 1].is_punct('.')) {
            continue;
        }

        let mut j = i + 1;
        loop {
            let Some(first) = tokens.get(j) else { break };
            if first.ident().is_none() || is_clause_keyword(first) {
                break;
            }
            let mut name = first.ident().unwrap_or_default();
            j += 1;
            while tokens.get(j).is_some_and(|t| t.is_punct('.')) {
                match tokens.get(j + 1).and_then(Token::ident) {
                    Some(part) => {
                        name = part;
                        j += 2;
                    }
                    None => break,
                }
            }
            tables.push(name);

            if tokens.get(j).is_some_and(|t| t.is_keyword("AS")) {
                j += 2;
            } else if tokens.get(j).is_some_and(|t| t.ident().is_some() && !is_clause_keyword(t)) {
                j += 1;
            }
            if tokens.get(j).is_some_and(|t| t.is_punct(',')) {
                j += 1;
                continue;
            }
            break;
        }
    }

    tables
}
