//! Client orchestration.
//!
//! The [`Client`] owns at most one backend (a single [`Pool`] or a
//! [`Cluster`]) and exposes the connection lifecycle, statement dispatch,
//! teardown and lifecycle events on top of it. It keeps no per-request
//! state, so one client can be shared across the whole process.

use crate::config::ClientConfig;
use crate::db::cluster::{Cluster, RoundRobin, RouteHint, RoutingPolicy};
use crate::db::pool::{Pool, PoolConfig, PoolHooks, PoolStatus, PooledConnection};
use crate::driver::{ConnectionHook, Driver};
use crate::error::{DbError, DbResult};
use crate::events::{CallContext, ClientEvent, ConnectionEvent, QueryEvent};
use crate::models::{
    ConnectionId, ConnectionIdSource, MonotonicIds, QueryParam, QueryRequest, QueryResult, Row,
    StreamOptions,
};
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// The connection source a client dispatches to.
pub enum Backend<D: Driver> {
    Pool(Pool<D>),
    Cluster(Cluster<D>),
}

impl<D: Driver> Backend<D> {
    async fn acquire(
        &self,
        hint: &RouteHint,
        cancel: &CancellationToken,
    ) -> DbResult<PooledConnection<D>> {
        match self {
            Backend::Pool(pool) => pool.acquire(cancel).await,
            Backend::Cluster(cluster) => cluster.acquire(hint, cancel).await,
        }
    }

    fn status(&self) -> Vec<PoolStatus> {
        match self {
            Backend::Pool(pool) => vec![pool.status()],
            Backend::Cluster(cluster) => cluster.status(),
        }
    }

    async fn destroy(&self) {
        match self {
            Backend::Pool(pool) => pool.drain().await,
            Backend::Cluster(cluster) => cluster.destroy().await,
        }
    }
}

impl<D: Driver> fmt::Debug for Backend<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Pool(pool) => f.debug_tuple("Pool").field(pool).finish(),
            Backend::Cluster(cluster) => f.debug_tuple("Cluster").field(cluster).finish(),
        }
    }
}

/// Cancels a pending [`AcquireRequest`]. Cloneable; calling it more than
/// once, or after the request completed, has no effect.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl AbortHandle {
    pub fn abort(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A pending connection acquisition.
///
/// Nothing is acquired until [`AcquireRequest::completed`] is awaited; an
/// abort issued before that point makes the acquisition fail immediately.
pub struct AcquireRequest<D: Driver> {
    target: DbResult<Arc<Backend<D>>>,
    hint: RouteHint,
    context: CallContext,
    abort: AbortHandle,
    events: broadcast::Sender<ClientEvent>,
}

impl<D: Driver> AcquireRequest<D> {
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort(&self, reason: impl Into<String>) {
        self.abort.abort(reason);
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    /// Resolve to a checked-out connection.
    pub async fn completed(self) -> DbResult<PooledConnection<D>> {
        let backend = self.target?;
        match backend.acquire(&self.hint, &self.abort.token).await {
            Ok(conn) => {
                debug!(
                    connection_id = %conn.id(),
                    endpoint = %conn.endpoint(),
                    trace_id = %self.context.trace_id,
                    "Connection acquired"
                );
                let _ = self
                    .events
                    .send(ClientEvent::AcquireConnection(ConnectionEvent {
                        context: self.context,
                        connection_id: conn.id().clone(),
                        endpoint: conn.endpoint().to_string(),
                    }));
                Ok(conn)
            }
            Err(DbError::AcquireAborted { reason }) => {
                let reason = self.abort.reason.lock().clone().unwrap_or(reason);
                debug!(trace_id = %self.context.trace_id, reason = %reason, "Acquire aborted");
                Err(DbError::acquire_aborted(reason))
            }
            Err(e) => Err(e),
        }
    }
}

/// Builder for a [`Client`] with hooks, routing policy and id source.
pub struct ClientBuilder<D: Driver> {
    driver: Arc<D>,
    config: ClientConfig,
    hooks: PoolHooks<D::Connection>,
    policy: Arc<dyn RoutingPolicy>,
    ids: Arc<dyn ConnectionIdSource>,
    event_capacity: usize,
}

impl<D: Driver> ClientBuilder<D> {
    pub fn new(driver: D, config: ClientConfig) -> Self {
        Self::with_shared_driver(Arc::new(driver), config)
    }

    pub fn with_shared_driver(driver: Arc<D>, config: ClientConfig) -> Self {
        Self {
            driver,
            config,
            hooks: PoolHooks::default(),
            policy: Arc::new(RoundRobin::default()),
            ids: Arc::new(MonotonicIds::new()),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Run against every new connection before it is first handed out.
    pub fn after_create<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut D::Connection) -> BoxFuture<'a, DbResult<()>>
            + Send
            + Sync
            + 'static,
    {
        let hook: ConnectionHook<D::Connection> = Arc::new(hook);
        self.hooks.after_create = Some(hook);
        self
    }

    /// Run against every connection before the driver disconnects it.
    pub fn before_destroy<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut D::Connection) -> BoxFuture<'a, DbResult<()>>
            + Send
            + Sync
            + 'static,
    {
        let hook: ConnectionHook<D::Connection> = Arc::new(hook);
        self.hooks.before_destroy = Some(hook);
        self
    }

    pub fn routing_policy(mut self, policy: impl RoutingPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn connection_ids(mut self, ids: impl ConnectionIdSource + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> DbResult<Client<D>> {
        self.config.validate()?;

        if let Some(name) = &self.config.client {
            if !name.eq_ignore_ascii_case(self.driver.name()) {
                return Err(DbError::driver_unavailable(
                    name.clone(),
                    format!(
                        "This client was built with the '{}' driver; construct it with a driver for '{}'",
                        self.driver.name(),
                        name
                    ),
                ));
            }
        }

        let default_value = if self.config.use_null_as_default {
            QueryParam::Null
        } else {
            QueryParam::Raw(self.driver.default_value_expression().to_string())
        };
        let (events, _) = broadcast::channel(self.event_capacity);

        let client = Client {
            driver: self.driver,
            config: self.config,
            hooks: self.hooks,
            policy: self.policy,
            ids: self.ids,
            backend: RwLock::new(None),
            events,
            default_value,
        };

        let backend = client.build_backend()?;
        let kind = match &backend {
            Some(Backend::Pool(_)) => "pool",
            Some(Backend::Cluster(_)) => "cluster",
            None => "none",
        };
        info!(driver = %client.driver.name(), backend = kind, "Client created");
        *client.backend.write() = backend.map(Arc::new);
        Ok(client)
    }
}

/// Connection management and statement dispatch for one database configuration.
pub struct Client<D: Driver> {
    driver: Arc<D>,
    config: ClientConfig,
    hooks: PoolHooks<D::Connection>,
    policy: Arc<dyn RoutingPolicy>,
    ids: Arc<dyn ConnectionIdSource>,
    backend: RwLock<Option<Arc<Backend<D>>>>,
    events: broadcast::Sender<ClientEvent>,
    default_value: QueryParam,
}

impl<D: Driver> fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("driver", &self.driver.name())
            .field("backend", &self.backend.read())
            .field("default_value", &self.default_value)
            .finish()
    }
}

impl<D: Driver> Client<D> {
    /// Create a client with default hooks and routing.
    pub fn new(driver: D, config: ClientConfig) -> DbResult<Self> {
        ClientBuilder::new(driver, config).build()
    }

    pub fn builder(driver: D, config: ClientConfig) -> ClientBuilder<D> {
        ClientBuilder::new(driver, config)
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Value substituted for [`QueryParam::Default`] bindings.
    pub fn value_for_default(&self) -> &QueryParam {
        &self.default_value
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn has_pool(&self) -> bool {
        self.backend.read().is_some()
    }

    /// Status of every pool, in cluster order. Empty without a backend.
    pub fn status(&self) -> Vec<PoolStatus> {
        self.backend
            .read()
            .as_ref()
            .map(|b| b.status())
            .unwrap_or_default()
    }

    fn build_backend(&self) -> DbResult<Option<Backend<D>>> {
        if let Some(endpoints) = self.config.resolved_cluster() {
            let mut pools = Vec::with_capacity(endpoints.len());
            for (idx, endpoint) in endpoints.into_iter().enumerate() {
                let name = endpoint
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}[{}]", endpoint.settings.label(), idx));
                let options = endpoint.pool.unwrap_or_default();
                if options.disables_pooling() {
                    return Err(DbError::configuration(format!(
                        "cluster endpoint '{}' sets max_connections = 0",
                        name
                    )));
                }
                let pool = Pool::new(
                    Arc::clone(&self.driver),
                    PoolConfig::new(name.clone(), endpoint.settings)
                        .with_options(options)
                        .with_hooks(self.hooks.clone())
                        .with_ids(Arc::clone(&self.ids)),
                )?;
                pools.push((name, pool));
            }
            return Ok(Some(Backend::Cluster(Cluster::new(
                pools,
                Arc::clone(&self.policy),
            )?)));
        }

        if !self.config.has_endpoints() {
            return Ok(None);
        }
        let settings = self.config.connection.clone().unwrap_or_default();
        let options = self.config.pool.clone().unwrap_or_default();
        if options.disables_pooling() {
            info!(driver = %self.driver.name(), "Pooling disabled (max_connections = 0)");
            return Ok(None);
        }
        let pool = Pool::new(
            Arc::clone(&self.driver),
            PoolConfig::new(settings.label(), settings)
                .with_options(options)
                .with_hooks(self.hooks.clone())
                .with_ids(Arc::clone(&self.ids)),
        )?;
        Ok(Some(Backend::Pool(pool)))
    }

    /// Rebuild the pool or cluster from the configuration. Any existing
    /// backend is swapped out first and then drained.
    pub async fn initialize_pool(&self) -> DbResult<()> {
        let fresh = self.build_backend()?.map(Arc::new);
        let previous = std::mem::replace(&mut *self.backend.write(), fresh);
        if let Some(previous) = previous {
            info!(driver = %self.driver.name(), "Replacing existing connection pool");
            previous.destroy().await;
        }
        Ok(())
    }

    /// Start acquiring a connection.
    ///
    /// Fails (when awaited) with [`DbError::NoPoolDefined`] if the client has
    /// no pool or cluster.
    pub fn acquire_connection(&self, hint: RouteHint, context: CallContext) -> AcquireRequest<D> {
        let target = self
            .backend
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(DbError::NoPoolDefined);
        AcquireRequest {
            target,
            hint,
            context,
            abort: AbortHandle {
                token: CancellationToken::new(),
                reason: Arc::new(Mutex::new(None)),
            },
            events: self.events.clone(),
        }
    }

    /// Acquire a connection with no way to abort.
    pub async fn acquire(&self, hint: RouteHint, context: CallContext) -> DbResult<PooledConnection<D>> {
        self.acquire_connection(hint, context).completed().await
    }

    /// Return a connection to the pool that issued it. Never fails.
    pub fn release_connection(&self, conn: PooledConnection<D>, context: CallContext) {
        let _ = self
            .events
            .send(ClientEvent::ReleaseConnection(ConnectionEvent {
                context,
                connection_id: conn.id().clone(),
                endpoint: conn.endpoint().to_string(),
            }));
        conn.release();
    }

    /// Close a connection instead of returning it to the pool.
    pub async fn dispose_connection(&self, conn: PooledConnection<D>) -> DbResult<()> {
        let owner = conn.pool().clone();
        owner.dispose(conn).await
    }

    /// Liveness check through the driver.
    pub async fn ping(&self, conn: &mut PooledConnection<D>) -> DbResult<()> {
        let owner = conn.pool().clone();
        owner.ping(conn).await
    }

    /// Replace omitted bindings with the default-value sentinel.
    fn prepare(&self, mut request: QueryRequest) -> QueryRequest {
        for param in request.bindings.iter_mut() {
            if matches!(param, QueryParam::Default) {
                *param = self.default_value.clone();
            }
        }
        request
    }

    fn tag(&self, conn: &PooledConnection<D>, request: &QueryRequest) -> QueryEvent {
        QueryEvent {
            connection_id: conn.id().clone(),
            endpoint: conn.endpoint().to_string(),
            request: request.clone(),
            rendered: request.to_display_string(),
        }
    }

    /// Run a statement on a checked-out connection.
    ///
    /// Driver failures are re-raised as [`DbError::Query`], whose message is
    /// the rendered statement followed by the driver's error text; other
    /// failures are wrapped in [`DbError::Statement`]. A timed-out statement
    /// invalidates `conn`, so releasing it closes it.
    pub async fn query(
        &self,
        conn: &mut PooledConnection<D>,
        request: impl Into<QueryRequest>,
    ) -> DbResult<QueryResult> {
        let request = self.prepare(request.into());
        let tagged = self.tag(conn, &request);
        let _ = self.events.send(ClientEvent::Query(tagged.clone()));

        let start = Instant::now();
        let result = self.execute_on(conn, &request).await;

        match result {
            Ok(result) => {
                debug!(
                    connection_id = %tagged.connection_id,
                    rows = result.row_count(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Query completed"
                );
                Ok(result)
            }
            Err(e) => {
                let err = e.with_statement(tagged.rendered.clone());
                warn!(
                    connection_id = %tagged.connection_id,
                    endpoint = %tagged.endpoint,
                    error = %err,
                    "Query failed"
                );
                let _ = self.events.send(ClientEvent::QueryError {
                    query: tagged,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn execute_on(
        &self,
        conn: &mut PooledConnection<D>,
        request: &QueryRequest,
    ) -> DbResult<QueryResult> {
        let raw = conn.raw_mut()?;
        let Some(secs) = request.effective_timeout() else {
            return self.driver.execute(raw, request).await;
        };
        let limit = Duration::from_secs(u64::from(secs));
        match tokio::time::timeout(limit, self.driver.execute(raw, request)).await {
            Ok(result) => result,
            Err(_) => {
                // The statement may still be running; never reuse the connection
                warn!(connection_id = %conn.id(), timeout_secs = secs, "Query timed out, invalidating connection");
                conn.invalidate();
                Err(DbError::timeout("query", limit.as_millis() as u64))
            }
        }
    }

    /// Stream result rows into `sink`. Errors are returned as the driver
    /// reports them. Returns the number of rows sent.
    pub async fn stream(
        &self,
        conn: &mut PooledConnection<D>,
        request: impl Into<QueryRequest>,
        sink: mpsc::Sender<Row>,
        options: StreamOptions,
    ) -> DbResult<u64> {
        let request = self.prepare(request.into());
        let _ = self.events.send(ClientEvent::Query(self.tag(conn, &request)));
        let raw = conn.raw_mut()?;
        self.driver.stream(raw, &request, sink, &options).await
    }

    /// Tear down the pool or cluster, waiting for every checked-out
    /// connection to come back. Later acquires fail with
    /// [`DbError::NoPoolDefined`].
    pub async fn destroy(&self) {
        let backend = self.backend.write().take();
        match backend {
            Some(backend) => {
                info!(driver = %self.driver.name(), "Destroying client connections");
                backend.destroy().await;
                info!(driver = %self.driver.name(), "Client destroyed");
            }
            None => debug!("destroy called without a pool"),
        }
    }

    /// Quote `name` as a single identifier using the driver's dialect.
    pub fn wrap_identifier(&self, name: &str) -> String {
        self.driver.wrap_identifier(name)
    }

    /// Quote a dot-qualified name segment by segment.
    pub fn wrap_qualified(&self, name: &str) -> String {
        self.driver.wrap_qualified(name)
    }

    pub fn assert_can_cancel_query(&self) -> DbResult<()> {
        if self.driver.can_cancel_query() {
            Ok(())
        } else {
            Err(DbError::unsupported("Query cancellation", self.driver.name()))
        }
    }

    /// Cancel the statement running on another checked-out connection.
    pub async fn cancel_query(&self, connection_id: &ConnectionId) -> DbResult<()> {
        self.assert_can_cancel_query()?;
        self.driver.cancel_query(connection_id).await
    }
}
