//! Client lifecycle events.
//!
//! Events are published on a `tokio::sync::broadcast` channel. Publishing is
//! fire-and-forget: with no subscribers the event is dropped, and slow
//! subscribers observe `RecvError::Lagged` instead of applying backpressure.

use crate::models::{ConnectionId, QueryRequest};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Caller-supplied tracing context, threaded from acquire into event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallContext {
    pub trace_id: Uuid,
    pub labels: BTreeMap<String, String>,
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_trace_id(trace_id: Uuid) -> Self {
        Self {
            trace_id,
            labels: BTreeMap::new(),
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A statement tagged with the connection it runs on.
#[derive(Debug, Clone, Serialize)]
pub struct QueryEvent {
    pub connection_id: ConnectionId,
    pub endpoint: String,
    pub request: QueryRequest,
    /// Statement with bindings substituted, for display
    pub rendered: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub context: CallContext,
    pub connection_id: ConnectionId,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Emitted before a statement is dispatched to the driver.
    Query(QueryEvent),
    QueryError {
        #[serde(flatten)]
        query: QueryEvent,
        error: String,
    },
    AcquireConnection(ConnectionEvent),
    ReleaseConnection(ConnectionEvent),
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::QueryError { .. } => "query-error",
            Self::AcquireConnection(_) => "acquire-connection",
            Self::ReleaseConnection(_) => "release-connection",
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            Self::Query(q) | Self::QueryError { query: q, .. } => &q.connection_id,
            Self::AcquireConnection(c) | Self::ReleaseConnection(c) => &c.connection_id,
        }
    }
}
