//! Natural-language to SQL prompt compilation and reply parsing.

use log::debug;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::guard::SqlCandidate;
use crate::lexer::first_statement;
use crate::llm::LanguageModel;
use crate::schema::{SchemaSnapshot, TableDescriptor};

/// Keywords a reply's statement may start with. Anything the guard will
/// later refuse is still recognized here so the caller gets the policy
/// reason rather than a parse failure.
const STATEMENT_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "INSERT", "REPLACE", "UPDATE", "DELETE", "SHOW", "DESCRIBE", "DESC", "EXPLAIN",
    "CREATE", "DROP", "ALTER", "TRUNCATE", "RENAME", "GRANT", "REVOKE", "CALL", "SET", "LOAD", "LOCK",
    "UNLOCK", "HANDLER", "USE", "TABLE", "VALUES",
];

/// Keywords distinctive enough to locate SQL embedded in prose.
const ANCHOR_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "INSERT", "REPLACE", "UPDATE", "DELETE", "SHOW", "DESCRIBE", "EXPLAIN",
];

/// Secondary keywords that confirm a lower-case line is SQL, not prose.
const CLAUSE_HINTS: &[&str] = &["FROM", "INTO", "SET", "TABLE", "TABLES", "WHERE", "VALUES"];

/// Words that may open a continuation line of a statement.
const CONTINUATION_KEYWORDS: &[&str] = &[
    "JOIN", "INNER", "LEFT", "RIGHT", "OUTER", "CROSS", "NATURAL", "ON", "USING", "AND", "OR", "NOT",
    "GROUP", "ORDER", "BY", "HAVING", "LIMIT", "OFFSET", "UNION", "ALL", "AS", "CASE", "WHEN", "THEN",
    "ELSE", "END", "IN", "IS", "NULL", "EXISTS", "BETWEEN", "LIKE", "ASC", "DISTINCT", "WINDOW", "OVER",
    "PARTITION", "FOR", "DUPLICATE", "KEY",
];

#[derive(Debug, Clone, PartialEq)]
pub struct TranslationRequest {
    pub text: String,
    pub table_hint: Option<String>,
}

/// Schema text embedded in a prompt, with a record of what was left out.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSchema {
    pub text: String,
    pub included: Vec<String>,
    pub omitted: Vec<String>,
}

impl RenderedSchema {
    pub fn is_partial(&self) -> bool {
        !self.omitted.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Translation {
    pub candidate: SqlCandidate,
    pub schema: RenderedSchema,
}

pub struct PromptCompiler {
    model: Arc<dyn LanguageModel>,
    schema_budget: usize,
}

impl PromptCompiler {
    pub fn new(model: Arc<dyn LanguageModel>, schema_budget: usize) -> Self {
        Self { model, schema_budget }
    }

    /// Ask the model for one statement answering `request`, grounded in
    /// `schema`. The returned candidate is unvalidated.
    pub async fn compile(
        &self,
        request: &TranslationRequest,
        schema: &SchemaSnapshot,
    ) -> Result<Translation, PipelineError> {
        let rendered = render_schema(schema, request, self.schema_budget);
        let prompt = build_prompt(request, &rendered);
        debug!(
            "Compiling request with {} ({} tables described, {} omitted)",
            self.model.model(),
            rendered.included.len(),
            rendered.omitted.len()
        );

        let reply = self
            .model
            .complete(&prompt)
            .await
            .map_err(|e| PipelineError::ModelUnavailable(e.to_string()))?;
        debug!("Model reply: {reply}");

        let sql = extract_statement(&reply).map_err(PipelineError::TranslationUnparseable)?;
        Ok(Translation {
            candidate: SqlCandidate::model_generated(sql, reply),
            schema: rendered,
        })
    }
}

/// One table block of the prompt schema text.
pub fn render_table(table: &TableDescriptor) -> String {
    let mut out = format!("Table: {} (~{} rows)\n", table.name, table.row_estimate);
    for column in &table.columns {
        out.push_str(&format!(
            "  - {}: {} {}",
            column.name,
            column.declared_type,
            if column.nullable { "NULL" } else { "NOT NULL" }
        ));
        if table.primary_key.contains(&column.name) {
            out.push_str(" PRIMARY KEY");
        } else if column.is_key {
            out.push_str(" KEY");
        }
        out.push('\n');
    }
    out
}

/// Relevance of a table to the request: 2 for the hinted table, 1 when the
/// request mentions it (plural or singular), 0 otherwise.
fn relevance(table: &TableDescriptor, request: &TranslationRequest, words: &[String]) -> u8 {
    let name = table.name.to_lowercase();
    if request.table_hint.as_deref().is_some_and(|hint| hint.eq_ignore_ascii_case(&name)) {
        return 2;
    }
    let singular = name.strip_suffix('s').unwrap_or(&name);
    let mentioned = words.iter().any(|w| {
        let w = w.strip_suffix('s').unwrap_or(w);
        w == singular
    });
    u8::from(mentioned)
}

/// Render tables most-relevant first until `budget` characters are used;
/// the rest are omitted and counted in a trailing note. Deterministic for a
/// given snapshot and request.
pub fn render_schema(schema: &SchemaSnapshot, request: &TranslationRequest, budget: usize) -> RenderedSchema {
    let words: Vec<String> = request
        .text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();

    let mut ranked: Vec<&TableDescriptor> = schema.tables.iter().collect();
    ranked.sort_by_key(|t| std::cmp::Reverse(relevance(t, request, &words)));

    let mut blocks: Vec<(String, String)> = Vec::new();
    let mut used = 0;
    let mut omitted = Vec::new();
    for table in ranked {
        let block = render_table(table) + "\n";
        if omitted.is_empty() && used + block.len() <= budget {
            used += block.len();
            blocks.push((table.name.clone(), block));
        } else {
            omitted.push(table.name.clone());
        }
    }

    // The omission note counts against the budget too.
    while !omitted.is_empty() && used + omission_note(omitted.len()).len() > budget {
        let Some((name, block)) = blocks.pop() else { break };
        used -= block.len();
        omitted.insert(0, name);
    }

    let mut text = String::with_capacity(used);
    let mut included = Vec::with_capacity(blocks.len());
    for (name, block) in blocks {
        text.push_str(&block);
        included.push(name);
    }
    if !omitted.is_empty() {
        let note = omission_note(omitted.len());
        if text.len() + note.len() <= budget {
            text.push_str(&note);
        }
    }

    RenderedSchema { text, included, omitted }
}

fn omission_note(count: usize) -> String {
    format!("({count} more table(s) not shown)\n")
}

pub fn build_prompt(request: &TranslationRequest, schema: &RenderedSchema) -> String {
    let mut prompt = String::from(
        "You are a MySQL expert. Translate the request below into exactly one MySQL statement.\n\n\
         Rules:\n\
         - Use only the tables and columns listed in the schema. Never invent names.\n\
         - Prefer a read-only SELECT unless the request explicitly asks to change data.\n\
         - Reply with the statement inside a single ```sql code block and nothing else.\n\n\
         Database schema:\n",
    );
    prompt.push_str(&schema.text);
    if let Some(hint) = &request.table_hint {
        prompt.push_str(&format!("\nFocus on table: {hint}\n"));
    }
    prompt.push_str(&format!("\nRequest: {}\n", request.text.trim()));
    prompt
}

/// Isolate one statement from a model reply: the first fenced code block if
/// there is one, otherwise the reply with surrounding prose trimmed.
pub fn extract_statement(reply: &str) -> Result<String, String> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Err("empty reply".into());
    }

    let body = match fenced_block(reply) {
        Some(block) => block,
        None => strip_prose(reply).ok_or("reply contains no recognizable SQL")?,
    };

    let (statement, rest) = first_statement(body).map_err(|e| e.to_string())?;
    if statement.is_empty() {
        return Err("no SQL statement found".into());
    }
    if !starts_with_keyword(statement, STATEMENT_KEYWORDS) {
        return Err("reply contains no recognizable SQL".into());
    }
    if starts_with_keyword(rest.trim_start(), STATEMENT_KEYWORDS) {
        return Err("multiple statements with no clear primary one".into());
    }
    Ok(statement.to_string())
}

fn first_word(text: &str) -> &str {
    let text = text.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
    let end = text.find(|c: char| !(c.is_alphanumeric() || c == '_')).unwrap_or(text.len());
    &text[..end]
}

fn starts_with_keyword(text: &str, keywords: &[&str]) -> bool {
    let word = first_word(text);
    keywords.iter().any(|k| word.eq_ignore_ascii_case(k))
}

/// Contents of the first ``` fence, minus its language tag. An unclosed
/// fence runs to the end of the reply.
fn fenced_block(reply: &str) -> Option<&str> {
    let open = reply.find("```")?;
    let after = &reply[open + 3..];
    let content_start = match after.find('\n') {
        Some(nl) if is_language_tag(after[..nl].trim()) => nl + 1,
        _ => 0,
    };
    let content = &after[content_start..];
    let content = match content.find("```") {
        Some(close) => &content[..close],
        None => content,
    };
    Some(content.trim())
}

/// Text after an opening fence: `sql`, `mysql` or nothing. A keyword means
/// the statement itself starts on the fence line.
fn is_language_tag(first_line: &str) -> bool {
    first_line.chars().all(|c| c.is_ascii_alphanumeric()) && !starts_with_keyword(first_line, STATEMENT_KEYWORDS)
}

fn is_sql_word(word: &str) -> bool {
    [STATEMENT_KEYWORDS, CLAUSE_HINTS, CONTINUATION_KEYWORDS]
        .iter()
        .any(|keywords| keywords.iter().any(|k| word.eq_ignore_ascii_case(k)))
}

/// A line following SQL that reads as an English sentence: it opens with a
/// capitalised word and either ends like a sentence or the word is not SQL.
fn is_prose_line(line: &str) -> bool {
    let line = line.trim();
    if !line.starts_with(char::is_alphabetic) {
        return false;
    }
    let word = first_word(line);
    let mut chars = word.chars();
    let capitalised = chars.next().is_some_and(char::is_uppercase) && chars.any(char::is_lowercase);
    if !capitalised {
        return false;
    }
    let sentence_end = line.ends_with(|c: char| matches!(c, '.' | '!' | ':'));
    let followed_by_space = line[word.len()..].starts_with(char::is_whitespace);
    sentence_end || (followed_by_space && !is_sql_word(word))
}

/// Start at the first line that opens with a statement keyword (upper-case,
/// or lower-case with a clause keyword on the line); failing that, at the
/// first upper-case anchor keyword anywhere. The statement ends at a blank
/// line or at the first line that reads as prose.
fn strip_prose(reply: &str) -> Option<&str> {
    let mut start = None;
    let mut offset = 0;
    for line in reply.split_inclusive('\n') {
        let word = first_word(line);
        if starts_with_keyword(line, STATEMENT_KEYWORDS) {
            let upper = !word.is_empty() && word.chars().all(|c| !c.is_lowercase());
            let has_clause = line
                .split(|c: char| !c.is_alphanumeric() && c != '_')
                .any(|w| CLAUSE_HINTS.iter().any(|k| w.eq_ignore_ascii_case(k)));
            if upper || has_clause {
                start = Some(offset + line.len() - line.trim_start().len());
                break;
            }
        }
        offset += line.len();
    }

    let start = start.or_else(|| {
        ANCHOR_KEYWORDS
            .iter()
            .filter_map(|k| find_word(reply, k))
            .min()
    })?;

    let tail = &reply[start..];
    let mut end = 0;
    for (i, line) in tail.split_inclusive('\n').enumerate() {
        if i > 0 && (line.trim().is_empty() || is_prose_line(line)) {
            break;
        }
        end += line.len();
    }
    Some(tail[..end].trim())
}

/// Byte offset of `word` in `text` as a whole, case-sensitive word.
fn find_word(text: &str, word: &str) -> Option<usize> {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    text.match_indices(word).map(|(i, _)| i).find(|&i| {
        let before = text[..i].chars().next_back().map_or(true, |c| !is_word(c));
        let after = text[i + word.len()..].chars().next().map_or(true, |c| !is_word(c));
        before && after
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::Provenance;
    use crate::testing::{orders_table, sample_snapshot, users_table, FakeModel};

    fn request(text: &str) -> TranslationRequest {
        TranslationRequest {
            text: text.into(),
            table_hint: None,
        }
    }

    #[test]
    fn test_extracts_fenced_block() {
        let reply = "Sure! Here you go:\n```sql\nSELECT COUNT(*) FROM users;\n```\nThis counts users.";
        assert_eq!(extract_statement(reply).unwrap(), "SELECT COUNT(*) FROM users");
    }

    #[test]
    fn test_extracts_unlabelled_and_unclosed_fences() {
        assert_eq!(extract_statement("```\nSELECT 1\n```").unwrap(), "SELECT 1");
        assert_eq!(extract_statement("```SELECT 1```").unwrap(), "SELECT 1");
        assert_eq!(extract_statement("```mysql\nSELECT 2").unwrap(), "SELECT 2");
        assert_eq!(
            extract_statement("```SELECT\n* FROM users\n```").unwrap(),
            "SELECT\n* FROM users"
        );
    }

    #[test]
    fn test_bare_statement() {
        assert_eq!(
            extract_statement("  SELECT name FROM users WHERE id = 1  ").unwrap(),
            "SELECT name FROM users WHERE id = 1"
        );
        assert_eq!(
            extract_statement("select count(*) from users;").unwrap(),
            "select count(*) from users"
        );
    }

    #[test]
    fn test_prose_is_trimmed() {
        let reply = "Here's the query you asked for:\nSELECT * FROM orders WHERE total > 10\n\nIt returns large orders.";
        assert_eq!(extract_statement(reply).unwrap(), "SELECT * FROM orders WHERE total > 10");

        let reply = "The answer is SELECT name FROM users; it lists every user's name.";
        assert_eq!(extract_statement(reply).unwrap(), "SELECT name FROM users");
    }

    #[test]
    fn test_trailing_sentence_without_blank_line() {
        let reply = "SELECT name FROM users\nThis query returns each user's name.";
        assert_eq!(extract_statement(reply).unwrap(), "SELECT name FROM users");

        let reply = "SELECT name FROM users\nThis returns all names.";
        assert_eq!(extract_statement(reply).unwrap(), "SELECT name FROM users");

        let reply = "Here it is:\nSELECT u.name, SUM(o.total)\nFROM users u\nJOIN orders o ON o.user_id = u.id\n\
                     GROUP BY u.name\nOrder by nothing in particular.";
        assert_eq!(
            extract_statement(reply).unwrap(),
            "SELECT u.name, SUM(o.total)\nFROM users u\nJOIN orders o ON o.user_id = u.id\nGROUP BY u.name"
        );
    }

    #[test]
    fn test_multiline_statement_is_kept_whole() {
        let reply = "SELECT name\nFROM users\nWhere id > 1\n  AND email IS NOT NULL";
        assert_eq!(extract_statement(reply).unwrap(), reply);
    }

    #[test]
    fn test_prose_line_starting_with_keyword_is_skipped() {
        let reply = "With pleasure.\nSELECT id FROM users";
        assert_eq!(extract_statement(reply).unwrap(), "SELECT id FROM users");
    }

    #[test]
    fn test_unparseable_replies() {
        assert_eq!(extract_statement("").unwrap_err(), "empty reply");
        assert_eq!(extract_statement("   \n ").unwrap_err(), "empty reply");
        assert!(extract_statement("I cannot help with that.").is_err());
        assert!(extract_statement("```\nhello there\n```").is_err());
        assert_eq!(
            extract_statement("```sql\nSELECT 1;\nSELECT 2;\n```").unwrap_err(),
            "multiple statements with no clear primary one"
        );
    }

    #[test]
    fn test_forbidden_statement_still_extracted() {
        assert_eq!(extract_statement("DROP TABLE users").unwrap(), "DROP TABLE users");
    }

    #[test]
    fn test_render_table_lists_every_column() {
        let text = render_table(&users_table());
        assert!(text.starts_with("Table: users (~3 rows)\n"));
        assert!(text.contains("  - id: int(11) NOT NULL PRIMARY KEY\n"));
        assert!(text.contains("  - email: varchar(255) NULL\n"));
    }

    #[test]
    fn test_schema_render_is_deterministic() {
        let snapshot = sample_snapshot();
        let a = render_schema(&snapshot, &request("list orders"), 10_000);
        let b = render_schema(&snapshot, &request("list orders"), 10_000);
        assert_eq!(a, b);
        assert!(!a.is_partial());
    }

    #[test]
    fn test_schema_budget_omits_least_relevant_tables() {
        let snapshot = sample_snapshot();
        let budget = render_table(&users_table()).len() + 1 + omission_note(1).len();
        let rendered = render_schema(&snapshot, &request("How many users are there?"), budget);
        assert_eq!(rendered.included, vec!["users"]);
        assert_eq!(rendered.omitted, vec!["orders"]);
        assert!(rendered.is_partial());
        assert!(rendered.text.contains("(1 more table(s) not shown)"));
        assert_eq!(rendered.text.len(), budget);
    }

    #[test]
    fn test_schema_text_never_exceeds_budget() {
        let snapshot = sample_snapshot();
        let req = request("total per user");
        for budget in 0..400 {
            let rendered = render_schema(&snapshot, &req, budget);
            assert!(rendered.text.len() <= budget, "budget {budget}: {} chars", rendered.text.len());
            assert_eq!(rendered.included.len() + rendered.omitted.len(), snapshot.tables.len());
        }
    }

    #[test]
    fn test_table_hint_ranks_first() {
        let snapshot = sample_snapshot();
        let mut req = request("show me everything");
        req.table_hint = Some("users".into());
        let rendered = render_schema(&snapshot, &req, 10_000);
        assert_eq!(rendered.included, vec!["users", "orders"]);

        let rendered = render_schema(&snapshot, &request("what was each order's total"), 10_000);
        assert_eq!(rendered.included[0], "orders");
    }

    #[test]
    fn test_prompt_mentions_hint_and_rules() {
        let mut req = request("total spend per customer");
        req.table_hint = Some("orders".into());
        let rendered = render_schema(&sample_snapshot(), &req, 10_000);
        let prompt = build_prompt(&req, &rendered);
        assert!(prompt.contains("Focus on table: orders"));
        assert!(prompt.contains("Never invent names"));
        assert!(prompt.contains(&render_table(&orders_table())));
    }

    #[test]
    fn test_describe_matches_prompt_columns() {
        let snapshot = sample_snapshot();
        let rendered = render_schema(&snapshot, &request("anything"), 10_000);
        for table in &snapshot.tables {
            for column in &table.columns {
                assert!(
                    rendered.text.contains(&format!("  - {}: {}", column.name, column.declared_type)),
                    "{}.{} missing",
                    table.name,
                    column.name
                );
            }
        }
    }

    #[tokio::test]
    async fn test_compile_embeds_schema_and_request() {
        let model = Arc::new(FakeModel::replying("```sql\nSELECT COUNT(*) FROM users\n```"));
        let compiler = PromptCompiler::new(model.clone(), 10_000);
        let translation = compiler
            .compile(&request("How many users are there?"), &sample_snapshot())
            .await
            .unwrap();

        assert_eq!(translation.candidate.sql, "SELECT COUNT(*) FROM users");
        assert_eq!(translation.candidate.provenance, Provenance::ModelGenerated);
        assert!(translation.candidate.raw_output.is_some());

        let prompt = model.last_prompt().unwrap();
        assert!(prompt.contains("Table: users"));
        assert!(prompt.contains("Request: How many users are there?"));
    }

    #[tokio::test]
    async fn test_compile_empty_reply_is_unparseable() {
        let compiler = PromptCompiler::new(Arc::new(FakeModel::replying("")), 10_000);
        let err = compiler.compile(&request("anything"), &sample_snapshot()).await.unwrap_err();
        assert_eq!(err.kind(), "TranslationUnparseable");
    }

    #[tokio::test]
    async fn test_compile_model_failure() {
        let compiler = PromptCompiler::new(Arc::new(FakeModel::failing("connection refused")), 10_000);
        let err = compiler.compile(&request("anything"), &sample_snapshot()).await.unwrap_err();
        assert_eq!(err.kind(), "ModelUnavailable");
    }
}
