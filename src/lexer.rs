//! Comment- and literal-aware SQL tokenizer.
//!
//! This is a lexical pass only, not a parser. It knows enough of MySQL's
//! surface syntax to tell code apart from string literals, quoted
//! identifiers and comments, which is what statement-separator detection and
//! keyword scanning need. It cannot see through every obfuscation (for
//! example dynamic SQL assembled inside string literals and then passed to a
//! function); that residual risk is accepted and the database's own errors
//! cover deeper correctness.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Unquoted identifier or keyword.
    Word,
    /// `` `backticked` `` identifier.
    QuotedIdent,
    /// Single- or double-quoted string literal.
    StringLit,
    Number,
    /// `@user_var` or `@@system_var`.
    Variable,
    /// Statement separator (`;`) outside literals and comments.
    Separator,
    Punct(char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub start: usize,
    pub end: usize,
}

impl<'a> Token<'a> {
    /// Case-insensitive keyword match against an unquoted word.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct(c)
    }

    /// Identifier name for words and backticked identifiers.
    pub fn ident(&self) -> Option<String> {
        match self.kind {
            TokenKind::Word => Some(self.text.to_string()),
            TokenKind::QuotedIdent => {
                let inner = &self.text[1..self.text.len() - 1];
                Some(inner.replace("``", "`"))
            }
            _ => None,
        }
    }

    pub fn upper(&self) -> String {
        self.text.to_ascii_uppercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexError {
    UnterminatedLiteral(usize),
    UnterminatedComment(usize),
    /// MySQL `/*! ... */` comments are executed by the server.
    ExecutableComment(usize),
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexError::UnterminatedLiteral(at) => write!(f, "unterminated quoted text starting at offset {at}"),
            LexError::UnterminatedComment(at) => write!(f, "unterminated comment starting at offset {at}"),
            LexError::ExecutableComment(at) => write!(f, "executable comment at offset {at}"),
        }
    }
}

impl std::error::Error for LexError {}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

struct Scanner<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().collect(),
            pos: 0,
        }
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|&(_, c)| c)
    }

    fn offset(&self) -> usize {
        self.chars.get(self.pos).map(|&(i, _)| i).unwrap_or(self.src.len())
    }

    fn skip_while(&mut self, pred: impl Fn(char) -> bool) {
        while let Some(c) = self.peek(0) {
            if !pred(c) {
                break;
            }
            self.pos += 1;
        }
    }

    /// Consume a quoted run opened by `quote`; supports doubled quotes and,
    /// for string literals, backslash escapes.
    fn quoted(&mut self, quote: char, backslash_escapes: bool) -> Result<(), LexError> {
        let start = self.offset();
        self.pos += 1;
        loop {
            match self.peek(0) {
                None => return Err(LexError::UnterminatedLiteral(start)),
                Some('\\') if backslash_escapes => self.pos += 2,
                Some(c) if c == quote => {
                    if self.peek(1) == Some(quote) {
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                        return Ok(());
                    }
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn block_comment(&mut self) -> Result<(), LexError> {
        let start = self.offset();
        if self.peek(2) == Some('!') {
            return Err(LexError::ExecutableComment(start));
        }
        self.pos += 2;
        loop {
            match (self.peek(0), self.peek(1)) {
                (Some('*'), Some('/')) => {
                    self.pos += 2;
                    return Ok(());
                }
                (Some(_), _) => self.pos += 1,
                (None, _) => return Err(LexError::UnterminatedComment(start)),
            }
        }
    }
}

/// Split `sql` into tokens, dropping whitespace and comments.
pub fn tokenize(sql: &str) -> Result<Vec<Token<'_>>, LexError> {
    scan(sql, false).map(|(tokens, _)| tokens)
}

/// The first statement of `sql` (terminator excluded, trimmed) and the
/// unscanned text after its terminator. Text after the first separator is
/// not lexed, so trailing prose cannot cause a lex error.
pub fn first_statement(sql: &str) -> Result<(&str, &str), LexError> {
    let (tokens, rest_at) = scan(sql, true)?;
    let body = match (tokens.first(), tokens.iter().rev().find(|t| t.kind != TokenKind::Separator)) {
        (Some(first), Some(last)) if first.kind != TokenKind::Separator => &sql[first.start..last.end],
        _ => "",
    };
    Ok((body, rest_at.map_or("", |at| &sql[at..])))
}

fn scan(sql: &str, stop_at_separator: bool) -> Result<(Vec<Token<'_>>, Option<usize>), LexError> {
    let mut s = Scanner::new(sql);
    let mut tokens = Vec::new();

    while let Some(c) = s.peek(0) {
        let start = s.offset();
        let kind = match c {
            c if c.is_whitespace() => {
                s.pos += 1;
                continue;
            }
            '#' => {
                s.skip_while(|c| c != '\n');
                continue;
            }
            // MySQL only treats `--` as a comment when followed by whitespace.
            '-' if s.peek(1) == Some('-') && s.peek(2).map_or(true, char::is_whitespace) => {
                s.skip_while(|c| c != '\n');
                continue;
            }
            '/' if s.peek(1) == Some('*') => {
                s.block_comment()?;
                continue;
            }
            '\'' | '"' => {
                s.quoted(c, true)?;
                TokenKind::StringLit
            }
            '`' => {
                s.quoted('`', false)?;
                TokenKind::QuotedIdent
            }
            ';' => {
                s.pos += 1;
                TokenKind::Separator
            }
            '@' => {
                s.pos += 1;
                if s.peek(0) == Some('@') {
                    s.pos += 1;
                }
                match s.peek(0) {
                    Some(q @ ('\'' | '"' | '`')) => s.quoted(q, q != '`')?,
                    _ => s.skip_while(|c| is_word_char(c) || c == '.'),
                }
                TokenKind::Variable
            }
            c if c.is_ascii_digit() || (c == '.' && s.peek(1).is_some_and(|n| n.is_ascii_digit())) => {
                s.skip_while(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
                TokenKind::Number
            }
            c if is_word_char(c) => {
                s.skip_while(is_word_char);
                TokenKind::Word
            }
            other => {
                s.pos += 1;
                TokenKind::Punct(other)
            }
        };
        let end = s.offset();
        tokens.push(Token {
            kind,
            text: &sql[start..end],
            start,
            end,
        });
        if stop_at_separator && kind == TokenKind::Separator {
            return Ok((tokens, Some(end)));
        }
    }

    Ok((tokens, None))
}
