//! db-dispatch
//!
//! Driver-agnostic connection pooling, cluster routing, statement dispatch
//! and transactions for SQL databases. Backends plug in through the
//! [`Driver`] and [`Dialect`] traits; a SQLite driver is built in behind the
//! `sqlite` feature.

pub mod config;
pub mod db;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod events;
pub mod models;

pub use config::{ClientConfig, ClusterEndpoint, ConnectionSettings, PoolOptions};
pub use db::{Client, ClientBuilder, PooledConnection, RouteHint, Transaction};
pub use driver::{ConnectionHook, Dialect, Driver};
pub use error::{DbError, DbResult};
pub use events::{CallContext, ClientEvent};
pub use models::{QueryParam, QueryRequest, QueryResult};
