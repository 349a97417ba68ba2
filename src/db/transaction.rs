//! Transactions over a single checked-out connection.
//!
//! A top-level [`Transaction`] owns its connection and hands it back to the
//! pool exactly once, when it commits or rolls back. Nested transactions are
//! savepoints on the same connection and borrow it from their parent.

use crate::db::client::Client;
use crate::db::cluster::RouteHint;
use crate::db::pool::PooledConnection;
use crate::driver::Driver;
use crate::error::{DbError, DbResult};
use crate::events::CallContext;
use crate::models::{
    ConnectionId, QueryRequest, QueryResult, Row, StreamOptions, TransactionInfo,
    TransactionOptions, TransactionState,
};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

enum Handle<'c, D: Driver> {
    Owned(PooledConnection<D>),
    Borrowed(&'c mut PooledConnection<D>),
    Released,
}

impl<D: Driver> Handle<'_, D> {
    fn get_mut(&mut self, transaction_id: &str) -> DbResult<&mut PooledConnection<D>> {
        match self {
            Handle::Owned(conn) => Ok(conn),
            Handle::Borrowed(conn) => Ok(&mut **conn),
            Handle::Released => Err(DbError::transaction(
                "Connection was already released",
                transaction_id,
            )),
        }
    }

    fn connection_id(&self) -> Option<&ConnectionId> {
        match self {
            Handle::Owned(conn) => Some(conn.id()),
            Handle::Borrowed(conn) => Some(conn.id()),
            Handle::Released => None,
        }
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

fn generate_savepoint_name() -> String {
    format!("sp_{}", uuid::Uuid::new_v4().simple())
}

/// A unit of work on one connection.
///
/// Any failing statement rolls the transaction back before the error is
/// returned. A top-level transaction dropped while still running is rolled
/// back on a background task; a dropped savepoint is rolled back before the
/// next operation on its parent.
pub struct Transaction<'c, D: Driver> {
    client: &'c Client<D>,
    conn: Handle<'c, D>,
    id: String,
    /// Set for nested transactions
    savepoint: Option<String>,
    state: TransactionState,
    depth: u32,
    started_at: DateTime<Utc>,
    context: CallContext,
}

impl<'c, D: Driver> Transaction<'c, D> {
    /// Start a top-level transaction on `conn`. The connection is released
    /// if `BEGIN` fails.
    pub async fn begin(
        client: &'c Client<D>,
        mut conn: PooledConnection<D>,
        options: &TransactionOptions,
        context: CallContext,
    ) -> DbResult<Self> {
        let id = generate_transaction_id();
        let started = match conn.raw_mut() {
            Ok(raw) => client.driver().begin(raw, options).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            warn!(transaction_id = %id, connection_id = %conn.id(), error = %e, "Failed to begin transaction");
            client.release_connection(conn, context);
            return Err(e);
        }

        info!(
            transaction_id = %id,
            connection_id = %conn.id(),
            isolation = ?options.isolation_level,
            read_only = options.read_only,
            "Transaction started"
        );
        Ok(Self {
            client,
            conn: Handle::Owned(conn),
            id,
            savepoint: None,
            state: TransactionState::Running,
            depth: 0,
            started_at: Utc::now(),
            context,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_nested(&self) -> bool {
        self.savepoint.is_some()
    }

    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.conn.connection_id()
    }

    pub fn info(&self) -> Option<TransactionInfo> {
        Some(TransactionInfo {
            id: self.id.clone(),
            connection_id: self.conn.connection_id()?.clone(),
            started_at: self.started_at,
            state: self.state,
            depth: self.depth,
        })
    }

    /// Fail unless running, then roll back savepoints abandoned on this connection.
    async fn ensure_running(&mut self, operation: &str) -> DbResult<()> {
        if !self.state.is_active() {
            return Err(DbError::transaction(
                format!("Cannot {}: transaction is already {}", operation, self.state),
                &self.id,
            ));
        }
        let client = self.client;
        let conn = self.conn.get_mut(&self.id)?;
        let orphans = std::mem::take(&mut conn.orphaned_savepoints);
        for name in orphans {
            debug!(transaction_id = %self.id, savepoint = %name, "Rolling back abandoned savepoint");
            let raw = conn.raw_mut()?;
            client.driver().rollback_to_savepoint(raw, &name).await?;
            client.driver().release_savepoint(raw, &name).await?;
        }
        Ok(())
    }

    /// Run a statement inside the transaction.
    pub async fn query(&mut self, request: impl Into<QueryRequest>) -> DbResult<QueryResult> {
        self.ensure_running("query").await?;
        let client = self.client;
        let conn = self.conn.get_mut(&self.id)?;
        match client.query(conn, request).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(transaction_id = %self.id, error = %e, "Statement failed, rolling back transaction");
                if let Err(rollback_err) = self.undo().await {
                    warn!(transaction_id = %self.id, error = %rollback_err, "Rollback after failure also failed");
                }
                Err(e)
            }
        }
    }

    /// Stream rows from a statement inside the transaction.
    pub async fn stream(
        &mut self,
        request: impl Into<QueryRequest>,
        sink: mpsc::Sender<Row>,
        options: StreamOptions,
    ) -> DbResult<u64> {
        self.ensure_running("stream").await?;
        let client = self.client;
        let conn = self.conn.get_mut(&self.id)?;
        match client.stream(conn, request, sink, options).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                warn!(transaction_id = %self.id, error = %e, "Stream failed, rolling back transaction");
                if let Err(rollback_err) = self.undo().await {
                    warn!(transaction_id = %self.id, error = %rollback_err, "Rollback after failure also failed");
                }
                Err(e)
            }
        }
    }

    /// Start a nested transaction (savepoint) on the same connection.
    pub async fn savepoint(&mut self) -> DbResult<Transaction<'_, D>> {
        self.ensure_running("start a savepoint").await?;
        let client = self.client;
        let name = generate_savepoint_name();
        let conn = self.conn.get_mut(&self.id)?;
        client.driver().savepoint(conn.raw_mut()?, &name).await?;

        let id = generate_transaction_id();
        debug!(transaction_id = %id, parent = %self.id, savepoint = %name, "Savepoint created");
        Ok(Transaction {
            client,
            conn: Handle::Borrowed(conn),
            id,
            savepoint: Some(name),
            state: TransactionState::Running,
            depth: self.depth + 1,
            started_at: Utc::now(),
            context: self.context.clone(),
        })
    }

    /// Commit, or release the savepoint for a nested transaction.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.ensure_running("commit").await?;
        let client = self.client;
        let outcome = {
            let raw = self.conn.get_mut(&self.id)?.raw_mut()?;
            match &self.savepoint {
                Some(name) => client.driver().release_savepoint(raw, name).await,
                None => client.driver().commit(raw).await,
            }
        };

        if let Err(e) = outcome {
            warn!(transaction_id = %self.id, error = %e, "Commit failed, rolling back");
            if let Err(rollback_err) = self.undo().await {
                warn!(transaction_id = %self.id, error = %rollback_err, "Rollback after failed commit also failed");
            }
            return Err(e);
        }

        self.state = TransactionState::Committed;
        info!(transaction_id = %self.id, depth = self.depth, "Transaction committed");
        self.finish(true).await;
        Ok(())
    }

    /// Roll back, or roll back to the savepoint for a nested transaction.
    pub async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_running("rollback").await?;
        self.undo().await
    }

    async fn undo(&mut self) -> DbResult<()> {
        let client = self.client;
        let outcome = match self.conn.get_mut(&self.id) {
            Ok(conn) => match conn.raw_mut() {
                Ok(raw) => match &self.savepoint {
                    Some(name) => {
                        let rolled_back = client.driver().rollback_to_savepoint(raw, name).await;
                        match rolled_back {
                            Ok(()) => client.driver().release_savepoint(raw, name).await,
                            Err(e) => Err(e),
                        }
                    }
                    None => client.driver().rollback(raw).await,
                },
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        self.state = TransactionState::RolledBack;
        info!(transaction_id = %self.id, depth = self.depth, "Transaction rolled back");
        self.finish(outcome.is_ok()).await;
        outcome
    }

    /// Give an owned connection back: released when healthy, disposed otherwise.
    async fn finish(&mut self, healthy: bool) {
        if !matches!(self.conn, Handle::Owned(_)) {
            return;
        }
        if let Handle::Owned(conn) = std::mem::replace(&mut self.conn, Handle::Released) {
            if healthy {
                self.client.release_connection(conn, self.context.clone());
            } else {
                warn!(transaction_id = %self.id, connection_id = %conn.id(), "Disposing connection in unknown transaction state");
                if let Err(e) = self.client.dispose_connection(conn).await {
                    warn!(transaction_id = %self.id, error = %e, "Failed to dispose connection");
                }
            }
        }
    }
}

impl<D: Driver> Drop for Transaction<'_, D> {
    fn drop(&mut self) {
        if !self.state.is_active() {
            return;
        }
        match std::mem::replace(&mut self.conn, Handle::Released) {
            Handle::Borrowed(conn) => {
                if let Some(name) = self.savepoint.take() {
                    warn!(transaction_id = %self.id, savepoint = %name, "Savepoint dropped while running");
                    conn.orphaned_savepoints.push(name);
                }
            }
            Handle::Owned(mut conn) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!(transaction_id = %self.id, "Transaction dropped outside a runtime, closing connection without rollback");
                    conn.invalidate();
                    return;
                };
                warn!(transaction_id = %self.id, connection_id = %conn.id(), "Transaction dropped while running, rolling back");
                let driver = self.client.driver().clone();
                let id = std::mem::take(&mut self.id);
                runtime.spawn(async move {
                    let rolled_back = match conn.raw_mut() {
                        Ok(raw) => driver.rollback(raw).await,
                        Err(e) => Err(e),
                    };
                    match rolled_back {
                        Ok(()) => conn.release(),
                        Err(e) => {
                            warn!(transaction_id = %id, error = %e, "Rollback of dropped transaction failed");
                            let owner = conn.pool().clone();
                            let _ = owner.dispose(conn).await;
                        }
                    }
                });
            }
            Handle::Released => {}
        }
    }
}

impl<D: Driver> Client<D> {
    /// Acquire a connection and begin a transaction on it.
    pub async fn begin_transaction(
        &self,
        hint: RouteHint,
        context: CallContext,
        options: TransactionOptions,
    ) -> DbResult<Transaction<'_, D>> {
        let conn = self.acquire(hint, context.clone()).await?;
        Transaction::begin(self, conn, &options, context).await
    }

    /// Run `body` in a transaction: committed when it returns `Ok`, rolled
    /// back when it returns `Err`.
    ///
    /// ```ignore
    /// client
    ///     .transaction(RouteHint::Any, CallContext::new(), |tx| {
    ///         Box::pin(async move {
    ///             tx.query("INSERT INTO t VALUES (1)").await?;
    ///             Ok(())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn transaction<'c, T, F>(
        &'c self,
        hint: RouteHint,
        context: CallContext,
        body: F,
    ) -> DbResult<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction<'c, D>) -> BoxFuture<'t, DbResult<T>>,
    {
        self.transaction_with_options(hint, context, TransactionOptions::default(), body)
            .await
    }

    pub async fn transaction_with_options<'c, T, F>(
        &'c self,
        hint: RouteHint,
        context: CallContext,
        options: TransactionOptions,
        body: F,
    ) -> DbResult<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction<'c, D>) -> BoxFuture<'t, DbResult<T>>,
    {
        let mut tx = self.begin_transaction(hint, context, options).await?;
        match body(&mut tx).await {
            Ok(value) => {
                if tx.state().is_active() {
                    tx.commit().await?;
                }
                Ok(value)
            }
            Err(e) => {
                if tx.state().is_active() {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(transaction_id = %tx.id(), error = %rollback_err, "Rollback failed");
                    }
                }
                Err(e)
            }
        }
    }
}
