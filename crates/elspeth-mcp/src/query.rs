// elspeth-mcp/src/query.rs
// ============================================================================
// Module: MCP Query Validation & Service
// Description: Read-only SQL enforcement and row retrieval.
// Purpose: Let inspection tools query the Landscape without any ability to
//          mutate it, fail closed on every bypass trick.
// Dependencies: rusqlite, serde_json
// ============================================================================

//! ## Overview
//! The query surface claims to be read-only, so validation enforces it:
//! the leading statement verb must be `SELECT` or `WITH`; a semicolon
//! followed by anything non-empty is a multi-statement payload and is
//! rejected; comments are stripped with string-literal awareness before
//! analysis so `--` and `/* */` cannot hide a payload; and a fixed set of
//! dangerous verbs is matched on word boundaries outside string literals,
//! so `created_at` and `'INSERT'` stay legal while `CREATE TABLE` does not.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::types::ValueRef;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Statement verbs that are never allowed, matched on word boundaries.
const FORBIDDEN_VERBS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "GRANT", "REVOKE",
    "COPY", "PRAGMA", "ATTACH", "DETACH", "VACUUM", "SET", "BEGIN", "COMMIT", "ROLLBACK",
    "SAVEPOINT", "RELEASE", "REINDEX",
];

/// Default row cap for query results.
pub const DEFAULT_ROW_LIMIT: usize = 1_000;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by query validation and execution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The payload is empty or contains no statement.
    #[error("query is empty; a read-only SELECT is required")]
    Empty,
    /// The leading statement verb is not SELECT or WITH.
    #[error("only read-only SELECT statements are allowed (found '{0}')")]
    NotSelect(String),
    /// A semicolon-separated second statement was found.
    #[error("multiple statements are not allowed; remove the semicolon-separated payload")]
    MultiStatement,
    /// A forbidden verb appeared outside identifiers and string literals.
    #[error("forbidden keyword '{0}' is not allowed in read-only queries")]
    ForbiddenKeyword(String),
    /// Query execution failed.
    #[error("query execution failed: {0}")]
    Execution(String),
}

// ============================================================================
// SECTION: Lexical Stripping
// ============================================================================

/// Strips SQL comments, preserving string literals.
///
/// Line comments run to end of line; block comments are removed without
/// nesting. Comment markers inside single-quoted literals are data, not
/// comments.
fn strip_comments(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut index = 0;
    let mut in_string = false;
    while index < chars.len() {
        let ch = chars[index];
        if in_string {
            out.push(ch);
            if ch == '\'' {
                // Doubled quotes are an escaped quote inside the literal.
                if chars.get(index + 1) == Some(&'\'') {
                    out.push('\'');
                    index += 1;
                } else {
                    in_string = false;
                }
            }
            index += 1;
            continue;
        }
        match ch {
            '\'' => {
                in_string = true;
                out.push(ch);
                index += 1;
            }
            '-' if chars.get(index + 1) == Some(&'-') => {
                while index < chars.len() && chars[index] != '\n' {
                    index += 1;
                }
            }
            '/' if chars.get(index + 1) == Some(&'*') => {
                index += 2;
                while index + 1 < chars.len() && !(chars[index] == '*' && chars[index + 1] == '/')
                {
                    index += 1;
                }
                index = (index + 2).min(chars.len());
                out.push(' ');
            }
            _ => {
                out.push(ch);
                index += 1;
            }
        }
    }
    out
}

/// Replaces string literal contents with spaces, keeping word boundaries.
fn blank_string_literals(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut index = 0;
    let mut in_string = false;
    while index < chars.len() {
        let ch = chars[index];
        if in_string {
            if ch == '\'' {
                if chars.get(index + 1) == Some(&'\'') {
                    out.push(' ');
                    index += 1;
                } else {
                    in_string = false;
                    out.push('\'');
                }
            } else {
                out.push(' ');
            }
        } else {
            if ch == '\'' {
                in_string = true;
            }
            out.push(ch);
        }
        index += 1;
    }
    out
}

/// Splits a word stream into uppercase tokens on non-identifier boundaries.
fn word_tokens(sql: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in sql.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            current.push(ch.to_ascii_uppercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

// ============================================================================
// SECTION: Validation
// ============================================================================

/// Validates that a SQL payload is a single read-only SELECT.
///
/// # Errors
///
/// Returns [`QueryError`] describing the first violated rule: emptiness,
/// non-SELECT leading verb, multi-statement payload, or a forbidden verb on
/// a word boundary outside string literals.
pub fn validate_readonly_sql(sql: &str) -> Result<(), QueryError> {
    let stripped = strip_comments(sql);
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        return Err(QueryError::Empty);
    }

    // A trailing semicolon is fine; anything after one is a second
    // statement. The check runs on the literal-blanked form so semicolons
    // inside strings stay data.
    let blanked = blank_string_literals(trimmed);
    if let Some(position) = blanked.find(';') {
        let remainder = blanked[position + 1..].trim();
        if !remainder.is_empty() {
            return Err(QueryError::MultiStatement);
        }
    }

    let statement = blanked.split(';').next().unwrap_or_default();
    let tokens = word_tokens(statement);
    let Some(first) = tokens.first() else {
        return Err(QueryError::Empty);
    };
    if first != "SELECT" && first != "WITH" {
        return Err(QueryError::NotSelect(first.clone()));
    }
    for token in &tokens {
        if FORBIDDEN_VERBS.contains(&token.as_str()) {
            return Err(QueryError::ForbiddenKeyword(token.clone()));
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: Query Service
// ============================================================================

/// Read-only query service over a Landscape database file.
pub struct QueryService {
    /// Read-only connection.
    connection: Connection,
    /// Maximum rows returned per query.
    row_limit: usize,
}

impl QueryService {
    /// Opens a read-only connection to a Landscape database.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Execution`] when the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueryError> {
        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| QueryError::Execution(err.to_string()))?;
        Ok(Self { connection, row_limit: DEFAULT_ROW_LIMIT })
    }

    /// Overrides the row cap.
    #[must_use]
    pub const fn with_row_limit(mut self, row_limit: usize) -> Self {
        self.row_limit = row_limit;
        self
    }

    /// Validates and executes a read-only query.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] when validation or execution fails.
    pub fn query(&self, sql: &str) -> Result<Vec<Value>, QueryError> {
        validate_readonly_sql(sql)?;
        let mut statement = self
            .connection
            .prepare(sql)
            .map_err(|err| QueryError::Execution(err.to_string()))?;
        let column_names: Vec<String> =
            statement.column_names().iter().map(ToString::to_string).collect();
        let mut rows = statement
            .query([])
            .map_err(|err| QueryError::Execution(err.to_string()))?;
        let mut results = Vec::new();
        while let Some(row) =
            rows.next().map_err(|err| QueryError::Execution(err.to_string()))?
        {
            if results.len() >= self.row_limit {
                break;
            }
            let mut object = Map::new();
            for (index, name) in column_names.iter().enumerate() {
                let value = match row.get_ref(index) {
                    Ok(ValueRef::Null) => Value::Null,
                    Ok(ValueRef::Integer(int)) => Value::from(int),
                    Ok(ValueRef::Real(real)) => {
                        serde_json::Number::from_f64(real).map_or(Value::Null, Value::Number)
                    }
                    Ok(ValueRef::Text(text)) => {
                        Value::String(String::from_utf8_lossy(text).into_owned())
                    }
                    Ok(ValueRef::Blob(blob)) => Value::String(format!("<{} bytes>", blob.len())),
                    Err(err) => return Err(QueryError::Execution(err.to_string())),
                };
                object.insert(name.clone(), value);
            }
            results.push(Value::Object(object));
        }
        Ok(results)
    }
}
