//! SQLite driver over `sqlx::SqliteConnection`.
//!
//! Rows are decoded into JSON maps. SQLite typing is per value, so each value
//! is decoded by its storage class, with the declared column type only used
//! to recognise booleans and JSON text.

use crate::config::ConnectionSettings;
use crate::driver::{Dialect, Driver};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnMetadata, IsolationLevel, QueryParam, QueryRequest, QueryResult, Row, StreamOptions,
    TransactionOptions,
};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, Connection, Row as _, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// Logical category for SQLite column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Text,
    Binary,
    Json,
    Null,
}

/// Classify a SQLite type name (declared or storage class).
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("int") {
        return TypeCategory::Integer;
    }
    if lower.contains("real")
        || lower.contains("floa")
        || lower.contains("doub")
        || lower.contains("numeric")
        || lower.contains("decimal")
    {
        return TypeCategory::Float;
    }
    if lower.contains("blob") || lower.contains("binary") {
        return TypeCategory::Binary;
    }
    if lower.contains("json") {
        return TypeCategory::Json;
    }
    if lower.is_empty() || lower == "null" {
        return TypeCategory::Null;
    }
    TypeCategory::Text
}

/// Decode binary data to JSON value.
///
/// If `decode_binary` is true, attempts to decode as UTF-8 text first.
/// Falls back to base64 encoding if not valid UTF-8 or if `decode_binary` is false.
pub fn decode_binary_value(bytes: &[u8], decode_binary: bool) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    if decode_binary {
        if let Ok(s) = std::str::from_utf8(bytes) {
            return JsonValue::String(s.to_string());
        }
    }
    JsonValue::String(STANDARD.encode(bytes))
}

/// Decode one value. The storage class decides the JSON shape; the declared
/// type only refines INTEGER into a boolean and TEXT into JSON.
fn decode_column(row: &SqliteRow, idx: usize, decode_binary: bool) -> DbResult<JsonValue> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(JsonValue::Null);
    }
    let stored = categorize_type(raw.type_info().name());
    let declared = categorize_type(row.columns()[idx].type_info().name());

    // Each arm decodes the Rust type of the storage class, unchecked against
    // the declared type
    let value = match (stored, declared) {
        (TypeCategory::Integer, TypeCategory::Boolean) => {
            JsonValue::Bool(row.try_get_unchecked::<i64, _>(idx)? != 0)
        }
        (TypeCategory::Integer, _) => {
            JsonValue::Number(row.try_get_unchecked::<i64, _>(idx)?.into())
        }
        (TypeCategory::Float, _) => {
            let v = row.try_get_unchecked::<f64, _>(idx)?;
            serde_json::Number::from_f64(v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string()))
        }
        (TypeCategory::Binary, _) => {
            decode_binary_value(&row.try_get_unchecked::<Vec<u8>, _>(idx)?, decode_binary)
        }
        (TypeCategory::Text, TypeCategory::Json) => {
            let v = row.try_get_unchecked::<String, _>(idx)?;
            serde_json::from_str(&v).unwrap_or(JsonValue::String(v))
        }
        _ => JsonValue::String(row.try_get_unchecked::<String, _>(idx)?),
    };
    Ok(value)
}

fn row_to_json(row: &SqliteRow, decode_binary: bool) -> DbResult<Row> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            Ok::<_, DbError>((col.name().to_string(), decode_column(row, idx, decode_binary)?))
        })
        .collect()
}

fn column_metadata(row: &SqliteRow) -> Vec<ColumnMetadata> {
    row.columns()
        .iter()
        .map(|col| {
            ColumnMetadata::new(col.name(), col.type_info().name(), !col.type_info().is_null())
        })
        .collect()
}

/// Bind a parameter to a SQLite query.
fn bind_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null | QueryParam::Default => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        // SQLite doesn't have native JSON type, store as string
        QueryParam::Json(v) => query.bind(v.to_string()),
        // Spliced into the statement before binding; kept as text if one slips through
        QueryParam::Raw(v) => query.bind(v.as_str()),
    }
}

/// Whether a statement produces rows.
fn returns_rows(sql: &str) -> bool {
    let trimmed = sql.trim_start();
    let first = trimmed
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        first.as_str(),
        "SELECT" | "WITH" | "PRAGMA" | "VALUES" | "EXPLAIN"
    ) || trimmed.to_ascii_uppercase().contains(" RETURNING ")
}

/// SQLite driver.
#[derive(Debug, Clone, Default)]
pub struct SqliteDriver {
    decode_binary: bool,
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return BLOB columns as UTF-8 text when they decode cleanly.
    pub fn with_decode_binary(mut self, decode_binary: bool) -> Self {
        self.decode_binary = decode_binary;
        self
    }

    fn connect_options(settings: &ConnectionSettings) -> DbResult<SqliteConnectOptions> {
        let mut options = match (&settings.url, &settings.database) {
            (Some(url), _) => SqliteConnectOptions::from_str(url).map_err(|e| {
                DbError::connection(
                    format!("Invalid SQLite connection string: {}", e),
                    "Check the connection URL format: sqlite:path/to/db.sqlite",
                )
            })?,
            (None, Some(path)) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
            (None, None) => {
                return Err(DbError::configuration(
                    "SQLite needs a `url` or a `database` path",
                ));
            }
        };
        for (key, value) in &settings.params {
            match key.as_str() {
                "foreign_keys" => options = options.foreign_keys(value.eq_ignore_ascii_case("true")),
                "busy_timeout_ms" => {
                    let ms = value.parse::<u64>().map_err(|_| {
                        DbError::configuration(format!("Invalid busy_timeout_ms: {}", value))
                    })?;
                    options = options.busy_timeout(Duration::from_millis(ms));
                }
                "read_only" => options = options.read_only(value.eq_ignore_ascii_case("true")),
                other => debug!(param = %other, "Ignoring unknown SQLite parameter"),
            }
        }
        Ok(options)
    }
}

impl Dialect for SqliteDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    /// SQLite has no `DEFAULT` keyword inside `VALUES`.
    fn default_value_expression(&self) -> &str {
        "NULL"
    }

    fn default_max_connections(&self) -> u32 {
        1
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    type Connection = SqliteConnection;

    async fn connect(&self, settings: &ConnectionSettings) -> DbResult<SqliteConnection> {
        let options = Self::connect_options(settings)?;
        debug!(endpoint = %settings.label(), "Opening SQLite connection");
        SqliteConnection::connect_with(&options).await.map_err(|e| {
            DbError::connection(
                format!("Failed to connect: {}", e),
                "Check the database file path and permissions",
            )
        })
    }

    async fn disconnect(&self, conn: SqliteConnection) -> DbResult<()> {
        conn.close().await.map_err(DbError::from)
    }

    async fn ping(&self, conn: &mut SqliteConnection) -> DbResult<()> {
        conn.ping().await.map_err(DbError::from)
    }

    async fn execute(
        &self,
        conn: &mut SqliteConnection,
        request: &QueryRequest,
    ) -> DbResult<QueryResult> {
        let start = Instant::now();
        let (sql, params) = request.inline_raw();
        let mut query = sqlx::query(&sql);
        for param in params {
            query = bind_param(query, param);
        }

        if returns_rows(&sql) {
            let rows = query.fetch_all(&mut *conn).await?;
            let columns = rows.first().map(column_metadata).unwrap_or_default();
            let json_rows = rows
                .iter()
                .map(|r| row_to_json(r, self.decode_binary))
                .collect::<DbResult<Vec<_>>>()?;
            Ok(QueryResult::with_rows(
                columns,
                json_rows,
                start.elapsed().as_millis() as u64,
            ))
        } else {
            let done = query.execute(&mut *conn).await?;
            let mut result =
                QueryResult::write_result(done.rows_affected(), start.elapsed().as_millis() as u64);
            result.last_insert_id = Some(done.last_insert_rowid());
            Ok(result)
        }
    }

    async fn stream(
        &self,
        conn: &mut SqliteConnection,
        request: &QueryRequest,
        sink: mpsc::Sender<Row>,
        options: &StreamOptions,
    ) -> DbResult<u64> {
        let (sql, params) = request.inline_raw();
        let mut query = sqlx::query(&sql);
        for param in params {
            query = bind_param(query, param);
        }

        let mut rows = query.fetch(&mut *conn);
        let mut sent = 0u64;
        while let Some(row) = rows.try_next().await? {
            if options.max_rows.is_some_and(|max| sent >= max) {
                break;
            }
            if sink.send(row_to_json(&row, self.decode_binary)?).await.is_err() {
                debug!(sent, "Stream receiver dropped, stopping");
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }

    async fn begin(
        &self,
        conn: &mut SqliteConnection,
        options: &TransactionOptions,
    ) -> DbResult<()> {
        if let Some(level) = options.isolation_level {
            if level != IsolationLevel::Serializable {
                return Err(DbError::unsupported(
                    format!("Isolation level {}", level.as_sql()),
                    self.name(),
                ));
            }
        }
        if options.read_only {
            return Err(DbError::unsupported("Read-only transactions", self.name()));
        }
        sqlx::query("BEGIN").execute(&mut *conn).await?;
        Ok(())
    }
}
