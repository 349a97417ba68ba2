//! Driver abstraction.
//!
//! The dispatch layer never talks to a database directly. Each backend
//! implements [`Driver`] (raw connection primitives) and [`Dialect`]
//! (naming, quoting and capability flags); pools, clusters, the client and
//! transactions call through these traits only.

use crate::config::{ConnectionSettings, DEFAULT_MAX_CONNECTIONS};
use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionId, QueryRequest, QueryResult, Row, StreamOptions, TransactionOptions,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle hook run against a raw connection (`after_create`, `before_destroy`).
///
/// The returned future is the completion signal; an `Err` fails the
/// operation the hook belongs to.
pub type ConnectionHook<C> =
    Arc<dyn for<'a> Fn(&'a mut C) -> BoxFuture<'a, DbResult<()>> + Send + Sync>;

/// Dialect-specific behaviour that does not need a connection.
pub trait Dialect {
    /// Driver identifier, matched against `ClientConfig::client`.
    fn name(&self) -> &str;

    /// Quote `name` as one identifier, verbatim. `*` passes through.
    fn wrap_identifier(&self, name: &str) -> String {
        if name == "*" {
            return name.to_string();
        }
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Quote a qualified name (`schema.table.column`) segment by segment.
    fn wrap_qualified(&self, name: &str) -> String {
        name.split('.')
            .map(|part| self.wrap_identifier(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Raw SQL used for a binding the caller intentionally omitted.
    fn default_value_expression(&self) -> &str {
        "DEFAULT"
    }

    fn can_cancel_query(&self) -> bool {
        false
    }

    /// Pool size used when the configuration does not set `max_connections`.
    fn default_max_connections(&self) -> u32 {
        DEFAULT_MAX_CONNECTIONS
    }
}

/// Raw connection primitives for one backend.
///
/// Transaction primitives default to the standard SQL statements issued
/// through [`Driver::execute`]; drivers override them when the backend
/// needs something else.
#[async_trait]
pub trait Driver: Dialect + Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self, settings: &ConnectionSettings) -> DbResult<Self::Connection>;

    async fn disconnect(&self, conn: Self::Connection) -> DbResult<()>;

    async fn ping(&self, conn: &mut Self::Connection) -> DbResult<()>;

    async fn execute(
        &self,
        conn: &mut Self::Connection,
        request: &QueryRequest,
    ) -> DbResult<QueryResult>;

    /// Push result rows into `sink` until exhausted, `options.max_rows` is
    /// reached, or the receiver goes away. Returns the number of rows sent.
    async fn stream(
        &self,
        conn: &mut Self::Connection,
        request: &QueryRequest,
        sink: mpsc::Sender<Row>,
        options: &StreamOptions,
    ) -> DbResult<u64>;

    async fn begin(
        &self,
        conn: &mut Self::Connection,
        options: &TransactionOptions,
    ) -> DbResult<()> {
        if let Some(level) = options.isolation_level {
            let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
            self.execute(conn, &QueryRequest::new(sql)).await?;
        }
        let sql = if options.read_only {
            "BEGIN READ ONLY"
        } else {
            "BEGIN"
        };
        self.execute(conn, &QueryRequest::new(sql)).await?;
        Ok(())
    }

    async fn commit(&self, conn: &mut Self::Connection) -> DbResult<()> {
        self.execute(conn, &QueryRequest::new("COMMIT")).await?;
        Ok(())
    }

    async fn rollback(&self, conn: &mut Self::Connection) -> DbResult<()> {
        self.execute(conn, &QueryRequest::new("ROLLBACK")).await?;
        Ok(())
    }

    async fn savepoint(&self, conn: &mut Self::Connection, name: &str) -> DbResult<()> {
        let sql = format!("SAVEPOINT {}", self.wrap_identifier(name));
        self.execute(conn, &QueryRequest::new(sql)).await?;
        Ok(())
    }

    async fn release_savepoint(&self, conn: &mut Self::Connection, name: &str) -> DbResult<()> {
        let sql = format!("RELEASE SAVEPOINT {}", self.wrap_identifier(name));
        self.execute(conn, &QueryRequest::new(sql)).await?;
        Ok(())
    }

    async fn rollback_to_savepoint(
        &self,
        conn: &mut Self::Connection,
        name: &str,
    ) -> DbResult<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", self.wrap_identifier(name));
        self.execute(conn, &QueryRequest::new(sql)).await?;
        Ok(())
    }

    /// Cancel the statement currently running on the identified connection.
    async fn cancel_query(&self, connection_id: &ConnectionId) -> DbResult<()> {
        let _ = connection_id;
        Err(DbError::unsupported("Query cancellation", self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl Dialect for Plain {
        fn name(&self) -> &str {
            "plain"
        }
    }

    struct Backtick;

    impl Dialect for Backtick {
        fn name(&self) -> &str {
            "backtick"
        }

        fn wrap_identifier(&self, part: &str) -> String {
            if part == "*" {
                return part.to_string();
            }
            format!("`{}`", part.replace('`', "``"))
        }
    }

    #[test]
    fn test_wrap_identifier_doubles_quotes() {
        assert_eq!(Plain.wrap_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_wrap_identifier_star_passthrough() {
        assert_eq!(Plain.wrap_identifier("*"), "*");
        assert_eq!(Plain.wrap_qualified("users.*"), "\"users\".*");
    }

    #[test]
    fn test_wrap_identifier_keeps_name_verbatim() {
        assert_eq!(Plain.wrap_identifier("a.b"), "\"a.b\"");
        assert_eq!(Plain.wrap_identifier(" a "), "\" a \"");
    }

    #[test]
    fn test_wrap_qualified() {
        assert_eq!(
            Plain.wrap_qualified("public.users.id"),
            "\"public\".\"users\".\"id\""
        );
    }

    #[test]
    fn test_dialect_override() {
        assert_eq!(Backtick.wrap_identifier("t`x"), "`t``x`");
        assert_eq!(Backtick.wrap_qualified("db.t`x"), "`db`.`t``x`");
    }

    #[test]
    fn test_dialect_defaults() {
        assert_eq!(Plain.default_value_expression(), "DEFAULT");
        assert!(!Plain.can_cancel_query());
        assert_eq!(Plain.default_max_connections(), DEFAULT_MAX_CONNECTIONS);
    }
}
