//! Data models for db-dispatch.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{
    ConnectionId, ConnectionIdSource, IsolationLevel, MonotonicIds, TransactionInfo,
    TransactionOptions, TransactionState, UuidIds,
};
pub use query::{
    ColumnMetadata, MAX_QUERY_TIMEOUT_SECS, QueryParam, QueryRequest, QueryResult, Row,
    StreamOptions,
};
