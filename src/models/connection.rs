//! Connection- and transaction-related data models.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier tagged onto a raw connection when it is created.
///
/// Used to correlate pool activity, query events and errors with the
/// physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Source of connection identifiers, owned by the pools that use it.
pub trait ConnectionIdSource: Send + Sync + fmt::Debug {
    fn next_id(&self) -> ConnectionId;
}

/// Monotonic counter producing `conn1`, `conn2`, ...
#[derive(Debug, Default)]
pub struct MonotonicIds {
    next: AtomicU64,
}

impl MonotonicIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionIdSource for MonotonicIds {
    fn next_id(&self) -> ConnectionId {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        ConnectionId::new(format!("conn{}", n))
    }
}

/// Random identifiers (`conn_<uuid>`), unique across processes.
#[derive(Debug, Default)]
pub struct UuidIds;

impl ConnectionIdSource for UuidIds {
    fn next_id(&self) -> ConnectionId {
        ConnectionId::new(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }
}

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Created, `BEGIN` not yet issued
    Pending,
    Running,
    Committed,
    RolledBack,
}

impl TransactionState {
    /// Check if the transaction accepts statements.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Check if the transaction has ended (committed or rolled back).
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

/// SQL transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Snapshot => "SNAPSHOT",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options passed to the driver when a transaction begins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    #[serde(default)]
    pub isolation_level: Option<IsolationLevel>,
    #[serde(default)]
    pub read_only: bool,
}

impl TransactionOptions {
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Snapshot of a transaction, for logging and inspection.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    pub id: String,
    pub connection_id: ConnectionId,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub state: TransactionState,
    /// 0 for the outermost transaction
    pub depth: u32,
}
