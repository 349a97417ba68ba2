//! Built-in drivers.
//!
//! Drivers are compiled in through cargo features. [`resolve`] maps a
//! configured client name onto a built-in driver, failing with installation
//! guidance when the driver is not compiled in.

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDriver;

use crate::error::{DbError, DbResult};

/// A built-in driver available in this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DriverKind {
    #[cfg(feature = "sqlite")]
    Sqlite,
}

/// Resolve a client name (e.g. `"sqlite"`) to a compiled-in driver.
pub fn resolve(name: &str) -> DbResult<DriverKind> {
    match name.to_ascii_lowercase().as_str() {
        "sqlite" | "sqlite3" => {
            #[cfg(feature = "sqlite")]
            {
                Ok(DriverKind::Sqlite)
            }
            #[cfg(not(feature = "sqlite"))]
            {
                Err(DbError::driver_unavailable(
                    name,
                    "Enable the `sqlite` feature: db-dispatch = { version = \"*\", features = [\"sqlite\"] }",
                ))
            }
        }
        "postgres" | "postgresql" | "pg" | "mysql" | "mysql2" | "mariadb" | "mssql" | "oracle" => {
            Err(DbError::driver_unavailable(
                name,
                "No built-in driver; implement `Driver` for your connection type and pass it to `Client::new`",
            ))
        }
        other => Err(DbError::configuration(format!(
            "Unknown client '{}'",
            other
        ))),
    }
}

/// Build a SQLite client, checking `config.client` when it is set.
#[cfg(feature = "sqlite")]
pub fn sqlite_client(
    config: crate::config::ClientConfig,
) -> DbResult<crate::db::Client<SqliteDriver>> {
    if let Some(name) = &config.client {
        match resolve(name)? {
            DriverKind::Sqlite => {}
        }
    }
    crate::db::Client::new(SqliteDriver::new(), config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_unknown_client() {
        let err = resolve("cassandra").unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }

    #[test]
    fn test_resolve_missing_driver_has_guidance() {
        let err = resolve("pg").unwrap_err();
        assert!(matches!(err, DbError::DriverUnavailable { .. }));
        assert!(err.suggestion().unwrap().contains("Driver"));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_resolve_sqlite() {
        assert_eq!(resolve("SQLite3").unwrap(), DriverKind::Sqlite);
    }
}
