//! Query-related data models.
//!
//! This module defines types for SQL query requests and results, and the
//! display rendering used to enrich error messages with the failing statement.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt::Write as _;

/// Maximum allowed query timeout in seconds.
pub const MAX_QUERY_TIMEOUT_SECS: u32 = 3600;

/// A single result row, keyed by column name.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// JSON document
    Json(JsonValue),
    /// Raw SQL fragment, substituted verbatim (e.g. `DEFAULT`).
    #[serde(skip_deserializing)]
    Raw(String),
    /// Value intentionally omitted by the caller.
    ///
    /// The client replaces it with its default-value sentinel before dispatch.
    #[serde(skip_deserializing)]
    Default,
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::Raw(_) => "raw",
            Self::Default => "default",
        }
    }

    /// Render this value as a SQL literal for display purposes.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::String(v) => quote_string(v),
            Self::Bytes(v) => {
                let mut out = String::with_capacity(v.len() * 2 + 3);
                out.push_str("X'");
                for byte in v {
                    let _ = write!(out, "{:02x}", byte);
                }
                out.push('\'');
                out
            }
            Self::Json(v) => quote_string(&v.to_string()),
            Self::Raw(v) => v.clone(),
            Self::Default => "DEFAULT".to_string(),
        }
    }
}

fn quote_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<JsonValue> for QueryParam {
    fn from(v: JsonValue) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A statement plus its positional `?` bindings.
///
/// Plain strings convert into a request with no bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub bindings: Vec<QueryParam>,
    /// Client-side execution timeout. `None` waits indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<u32>,
}

impl QueryRequest {
    /// Create a new query request without bindings.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bindings: Vec::new(),
            timeout_secs: None,
        }
    }

    /// Add a positional binding.
    pub fn bind(mut self, param: impl Into<QueryParam>) -> Self {
        self.bindings.push(param.into());
        self
    }

    /// Replace all bindings.
    pub fn with_bindings(mut self, bindings: Vec<QueryParam>) -> Self {
        self.bindings = bindings;
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Get the effective timeout (with bounds checking).
    pub fn effective_timeout(&self) -> Option<u32> {
        self.timeout_secs.map(|t| t.min(MAX_QUERY_TIMEOUT_SECS))
    }

    /// Render the statement with bindings substituted, for display only.
    ///
    /// `?` placeholders are replaced in order; `\?` renders a literal `?`.
    /// Placeholders without a matching binding are left untouched.
    pub fn to_display_string(&self) -> String {
        let mut out = String::with_capacity(self.sql.len() + self.bindings.len() * 4);
        let mut bindings = self.bindings.iter();
        let mut chars = self.sql.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&'?') => {
                    chars.next();
                    out.push('?');
                }
                '?' => match bindings.next() {
                    Some(param) => out.push_str(&param.to_sql_literal()),
                    None => out.push('?'),
                },
                other => out.push(other),
            }
        }
        out
    }

    /// Splice [`QueryParam::Raw`] bindings into the SQL text.
    ///
    /// Returns the statement a driver should prepare and the bindings that
    /// remain positional. `\?` is unescaped to `?`.
    pub fn inline_raw(&self) -> (String, Vec<&QueryParam>) {
        let mut sql = String::with_capacity(self.sql.len());
        let mut remaining = Vec::with_capacity(self.bindings.len());
        let mut bindings = self.bindings.iter();
        let mut chars = self.sql.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&'?') => {
                    chars.next();
                    sql.push('?');
                }
                '?' => match bindings.next() {
                    Some(QueryParam::Raw(raw)) => sql.push_str(raw),
                    Some(param) => {
                        sql.push('?');
                        remaining.push(param);
                    }
                    None => sql.push('?'),
                },
                other => sql.push(other),
            }
        }
        (sql, remaining)
    }
}

impl From<&str> for QueryRequest {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for QueryRequest {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

impl<P: Into<QueryParam>> From<(&str, Vec<P>)> for QueryRequest {
    fn from((sql, bindings): (&str, Vec<P>)) -> Self {
        Self::new(sql).with_bindings(bindings.into_iter().map(Into::into).collect())
    }
}

/// Options for streaming execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Stop after this many rows have been pushed into the sink.
    #[serde(default)]
    pub max_rows: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    /// Database-specific type (e.g., "INTEGER", "TEXT")
    pub type_name: String,
    pub nullable: bool,
}

impl ColumnMetadata {
    /// Create new column metadata.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Create an empty result (for statements without a result set).
    pub fn empty(execution_time_ms: u64) -> Self {
        Self {
            execution_time_ms,
            ..Self::default()
        }
    }

    /// Create a result for write operations (INSERT/UPDATE/DELETE).
    pub fn write_result(rows_affected: u64, execution_time_ms: u64) -> Self {
        Self {
            rows_affected: Some(rows_affected),
            execution_time_ms,
            ..Self::default()
        }
    }

    /// Create a result carrying rows.
    pub fn with_rows(columns: Vec<ColumnMetadata>, rows: Vec<Row>, execution_time_ms: u64) -> Self {
        Self {
            columns,
            rows,
            execution_time_ms,
            ..Self::default()
        }
    }

    /// Get the number of rows in the result.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.rows_affected.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::Int(42).type_name(), "int");
        assert_eq!(
            QueryParam::String("hello".to_string()).type_name(),
            "string"
        );
        assert_eq!(QueryParam::from(None::<i64>), QueryParam::Null);
    }

    #[test]
    fn test_render_positional_bindings() {
        let req = QueryRequest::new("SELECT ? AS x").bind(1);
        assert_eq!(req.to_display_string(), "SELECT 1 AS x");
    }

    #[test]
    fn test_render_escapes_strings() {
        let req = QueryRequest::new("SELECT * FROM users WHERE name = ? AND active = ?")
            .bind("O'Brien")
            .bind(true);
        assert_eq!(
            req.to_display_string(),
            "SELECT * FROM users WHERE name = 'O''Brien' AND active = true"
        );
    }

    #[test]
    fn test_render_escaped_placeholder_and_missing_bindings() {
        let req = QueryRequest::new(r"SELECT '\?', ?, ?").bind(QueryParam::Null);
        assert_eq!(req.to_display_string(), "SELECT '?', NULL, ?");
    }

    #[test]
    fn test_render_bytes_raw_and_default() {
        let req = QueryRequest::new("INSERT INTO t VALUES (?, ?, ?)")
            .bind(vec![0xde_u8, 0xad])
            .bind(QueryParam::Raw("CURRENT_TIMESTAMP".to_string()))
            .bind(QueryParam::Default);
        assert_eq!(
            req.to_display_string(),
            "INSERT INTO t VALUES (X'dead', CURRENT_TIMESTAMP, DEFAULT)"
        );
    }

    #[test]
    fn test_string_converts_into_request() {
        let req: QueryRequest = "SELECT 1".into();
        assert_eq!(req.sql, "SELECT 1");
        assert!(req.bindings.is_empty());

        let req: QueryRequest = ("SELECT ?", vec![5_i64]).into();
        assert_eq!(req.bindings, vec![QueryParam::Int(5)]);
    }

    #[test]
    fn test_query_request_timeout_bounds() {
        let req = QueryRequest::new("SELECT 1").with_timeout(999_999);
        assert_eq!(req.effective_timeout(), Some(MAX_QUERY_TIMEOUT_SECS));
        assert_eq!(QueryRequest::new("SELECT 1").effective_timeout(), None);
    }

    #[test]
    fn test_bindings_deserialize_untagged() {
        let req: QueryRequest =
            serde_json::from_str(r#"{"sql":"SELECT ?, ?, ?","bindings":[null, 3, "a"]}"#).unwrap();
        assert_eq!(
            req.bindings,
            vec![
                QueryParam::Null,
                QueryParam::Int(3),
                QueryParam::String("a".to_string())
            ]
        );
    }

    #[test]
    fn test_inline_raw_splices_default_expression() {
        let req = QueryRequest::new("INSERT INTO t (a, b, c) VALUES (?, ?, ?)")
            .bind(1)
            .bind(QueryParam::Raw("DEFAULT".to_string()))
            .bind("x");
        let (sql, remaining) = req.inline_raw();
        assert_eq!(sql, "INSERT INTO t (a, b, c) VALUES (?, DEFAULT, ?)");
        assert_eq!(remaining, vec![&QueryParam::Int(1), &QueryParam::String("x".into())]);
    }

    #[test]
    fn test_query_result_empty() {
        let result = QueryResult::empty(10);
        assert!(result.is_empty());
        assert_eq!(result.row_count(), 0);
    }

    #[test]
    fn test_query_result_write() {
        let result = QueryResult::write_result(5, 20);
        assert!(!result.is_empty());
        assert_eq!(result.rows_affected, Some(5));
    }
}
