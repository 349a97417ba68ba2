//! Connection pool for a single endpoint.
//!
//! All mutable pool state (idle handles, the FIFO wait queue, the size
//! counter and the closed flag) lives behind one `parking_lot::Mutex` that is
//! only ever held for bookkeeping; driver calls and hooks run outside it.
//!
//! A queued acquire is woken with a [`Grant`]: either an idle connection
//! handed over directly by `release`, or a free slot that lets the waiter
//! open a new connection itself. Grants go to the oldest live waiter first.

use crate::config::{ConnectionSettings, PoolOptions};
use crate::driver::{ConnectionHook, Driver};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionId, ConnectionIdSource, MonotonicIds};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle hooks run against raw connections.
pub struct PoolHooks<C> {
    /// Runs after connect, before the connection is first handed out.
    pub after_create: Option<ConnectionHook<C>>,
    /// Runs before the driver disconnects a connection.
    pub before_destroy: Option<ConnectionHook<C>>,
}

impl<C> Default for PoolHooks<C> {
    fn default() -> Self {
        Self {
            after_create: None,
            before_destroy: None,
        }
    }
}

impl<C> Clone for PoolHooks<C> {
    fn clone(&self) -> Self {
        Self {
            after_create: self.after_create.clone(),
            before_destroy: self.before_destroy.clone(),
        }
    }
}

impl<C> fmt::Debug for PoolHooks<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHooks")
            .field("after_create", &self.after_create.is_some())
            .field("before_destroy", &self.before_destroy.is_some())
            .finish()
    }
}

/// Everything needed to build a [`Pool`].
pub struct PoolConfig<C> {
    /// Label used in logs, events and errors
    pub endpoint: String,
    pub settings: ConnectionSettings,
    pub options: PoolOptions,
    pub hooks: PoolHooks<C>,
    pub ids: Arc<dyn ConnectionIdSource>,
}

impl<C> PoolConfig<C> {
    pub fn new(endpoint: impl Into<String>, settings: ConnectionSettings) -> Self {
        Self {
            endpoint: endpoint.into(),
            settings,
            options: PoolOptions::default(),
            hooks: PoolHooks::default(),
            ids: Arc::new(MonotonicIds::new()),
        }
    }

    pub fn with_options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_hooks(mut self, hooks: PoolHooks<C>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn ConnectionIdSource>) -> Self {
        self.ids = ids;
        self
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub idle: u32,
    /// Checked out or being created
    pub in_use: u32,
    /// Queued acquire requests
    pub pending: u32,
    pub size: u32,
    pub max: u32,
}

impl PoolStatus {
    /// Fraction of `max` currently in use, in `[0.0, 1.0]`.
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        self.in_use as f64 / self.max as f64
    }

    pub fn is_saturated(&self) -> bool {
        self.idle == 0 && self.size >= self.max
    }
}

/// Lifetime counters for a pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    created: AtomicU64,
    destroyed: AtomicU64,
    acquired: AtomicU64,
    timed_out: AtomicU64,
    aborted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetricsSnapshot {
    pub created: u64,
    pub destroyed: u64,
    pub acquired: u64,
    pub timed_out: u64,
    pub aborted: u64,
}

impl PoolMetrics {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

struct IdleConnection<C> {
    id: ConnectionId,
    raw: C,
    idle_since: Instant,
}

enum Grant<C> {
    Connection(IdleConnection<C>),
    /// Permission to open a new connection; the slot is already counted in `size`.
    Slot,
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<Grant<C>>,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    waiters: VecDeque<Waiter<C>>,
    /// Open connections plus reserved creation slots
    size: u32,
    closed: bool,
    next_waiter: u64,
}

impl<C> PoolState<C> {
    /// Hand `grant` to the oldest waiter still listening; gives it back if none is.
    fn offer(&mut self, mut grant: Grant<C>) -> Option<Grant<C>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(grant) {
                Ok(()) => return None,
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }
}

struct PoolInner<D: Driver> {
    driver: Arc<D>,
    endpoint: String,
    settings: ConnectionSettings,
    options: PoolOptions,
    max: u32,
    min: u32,
    hooks: PoolHooks<D::Connection>,
    ids: Arc<dyn ConnectionIdSource>,
    state: Mutex<PoolState<D::Connection>>,
    /// Signalled whenever a connection returns or leaves while closed
    drained: Notify,
    shutdown: CancellationToken,
    metrics: PoolMetrics,
}

/// Bounded pool of raw connections for one endpoint. Cheap to clone.
pub struct Pool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> fmt::Debug for Pool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("endpoint", &self.inner.endpoint)
            .field("status", &self.status())
            .finish()
    }
}

enum Step<C> {
    Ready(IdleConnection<C>),
    Create,
    Wait(u64, oneshot::Receiver<Grant<C>>),
}

impl<D: Driver> Pool<D> {
    /// Build a pool. No connection is opened until the first acquire
    /// (or the first reaper tick when `min_connections > 0`).
    pub fn new(driver: Arc<D>, config: PoolConfig<D::Connection>) -> DbResult<Self> {
        config.options.validate()?;
        let max = config
            .options
            .max_connections_or(driver.default_max_connections());
        if max == 0 {
            return Err(DbError::configuration(format!(
                "max_connections = 0 disables pooling for endpoint '{}'",
                config.endpoint
            )));
        }
        let min = config.options.min_connections_or_default().min(max);

        debug!(
            endpoint = %config.endpoint,
            driver = %driver.name(),
            min,
            max,
            "Creating connection pool"
        );

        let pool = Self {
            inner: Arc::new(PoolInner {
                driver,
                endpoint: config.endpoint,
                settings: config.settings,
                options: config.options,
                max,
                min,
                hooks: config.hooks,
                ids: config.ids,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    waiters: VecDeque::new(),
                    size: 0,
                    closed: false,
                    next_waiter: 0,
                }),
                drained: Notify::new(),
                shutdown: CancellationToken::new(),
                metrics: PoolMetrics::default(),
            }),
        };
        pool.spawn_reaper();
        Ok(pool)
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.inner.driver
    }

    pub fn max_size(&self) -> u32 {
        self.inner.max
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn same_pool(&self, other: &Pool<D>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        let idle = state.idle.len() as u32;
        PoolStatus {
            idle,
            in_use: state.size.saturating_sub(idle),
            pending: state.waiters.len() as u32,
            size: state.size,
            max: self.inner.max,
        }
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Check out a connection.
    ///
    /// Order of preference: an idle connection, a new connection if the pool
    /// is below `max`, otherwise a FIFO wait for a release. Cancelling `cancel`
    /// while queued withdraws the request; a connection already handed over
    /// is returned regardless. Dropping the future part way gives back any
    /// slot or connection it was holding.
    pub async fn acquire(&self, cancel: &CancellationToken) -> DbResult<PooledConnection<D>> {
        let started = Instant::now();
        let deadline = started + self.inner.options.acquire_timeout();

        let step = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(DbError::pool_closed(&self.inner.endpoint));
            }
            if cancel.is_cancelled() {
                return Err(DbError::acquire_aborted("aborted before acquisition started"));
            }
            if let Some(conn) = state.idle.pop_back() {
                Step::Ready(conn)
            } else if state.size < self.inner.max {
                state.size += 1;
                Step::Create
            } else {
                let (tx, rx) = oneshot::channel();
                state.next_waiter += 1;
                let id = state.next_waiter;
                state.waiters.push_back(Waiter { id, tx });
                Step::Wait(id, rx)
            }
        };

        let grant = match step {
            Step::Ready(conn) => Grant::Connection(conn),
            Step::Create => Grant::Slot,
            Step::Wait(id, rx) => {
                debug!(endpoint = %self.inner.endpoint, waiter = id, "Pool saturated, queueing acquire");
                let queued = QueuedAcquire {
                    pool: self,
                    id,
                    rx,
                    resolved: false,
                };
                self.wait_for_grant(queued, cancel, started, deadline).await?
            }
        };

        let mut reservation = match grant {
            Grant::Connection(conn) => Reservation::holding(self, conn),
            Grant::Slot => Reservation::empty(self),
        };

        if let Some(conn) = reservation.conn.as_mut() {
            let checked = if self.inner.options.test_before_acquire_or_default() {
                self.inner.driver.ping(&mut conn.raw).await
            } else {
                Ok(())
            };
            match (checked, reservation.conn.take()) {
                (Ok(()), Some(conn)) => {
                    reservation.disarm();
                    return Ok(self.checkout(conn));
                }
                (Err(e), Some(conn)) => {
                    warn!(
                        connection_id = %conn.id,
                        endpoint = %self.inner.endpoint,
                        error = %e,
                        "Idle connection failed ping, replacing it"
                    );
                    // The slot stays reserved for the replacement
                    let _ = self.close_raw(&conn.id, conn.raw, true).await;
                }
                (_, None) => {}
            }
        }
        self.create(reservation, cancel).await
    }

    async fn wait_for_grant(
        &self,
        mut queued: QueuedAcquire<'_, D>,
        cancel: &CancellationToken,
        started: Instant,
        deadline: Instant,
    ) -> DbResult<Grant<D::Connection>> {
        let failure = tokio::select! {
            biased;
            granted = &mut queued.rx => {
                queued.resolved = true;
                return granted.map_err(|_| DbError::pool_closed(&self.inner.endpoint));
            }
            _ = cancel.cancelled() => {
                PoolMetrics::incr(&self.inner.metrics.aborted);
                DbError::acquire_aborted("aborted while waiting for a connection")
            }
            _ = tokio::time::sleep_until(deadline) => {
                PoolMetrics::incr(&self.inner.metrics.timed_out);
                DbError::timeout(
                    format!("acquire connection from '{}'", self.inner.endpoint),
                    started.elapsed().as_millis() as u64,
                )
            }
        };

        if let Some(grant) = queued.withdraw() {
            debug!(endpoint = %self.inner.endpoint, "Grant arrived before abort took effect");
            return Ok(grant);
        }
        Err(failure)
    }

    /// Open a connection into a reserved slot. The slot is given back if
    /// opening fails or this future is dropped first.
    async fn create(
        &self,
        mut slot: Reservation<'_, D>,
        cancel: &CancellationToken,
    ) -> DbResult<PooledConnection<D>> {
        let conn = self.open().await?;
        slot.disarm();

        if self.is_closed() {
            self.put_back(conn);
            return Err(DbError::pool_closed(&self.inner.endpoint));
        }
        if cancel.is_cancelled() {
            PoolMetrics::incr(&self.inner.metrics.aborted);
            debug!(
                connection_id = %conn.id,
                endpoint = %self.inner.endpoint,
                "Acquire aborted during connect, keeping connection for the pool"
            );
            self.put_back(conn);
            return Err(DbError::acquire_aborted("aborted while connecting"));
        }
        Ok(self.checkout(conn))
    }

    async fn open(&self) -> DbResult<IdleConnection<D::Connection>> {
        let id = self.inner.ids.next_id();
        let mut raw = self.inner.driver.connect(&self.inner.settings).await?;

        if let Some(hook) = &self.inner.hooks.after_create {
            if let Err(e) = hook(&mut raw).await {
                warn!(
                    connection_id = %id,
                    endpoint = %self.inner.endpoint,
                    error = %e,
                    "after_create hook failed, disposing connection"
                );
                // Never handed out, so before_destroy does not apply
                let _ = self.close_raw(&id, raw, false).await;
                return Err(DbError::hook("after_create", e.to_string()));
            }
        }

        PoolMetrics::incr(&self.inner.metrics.created);
        debug!(connection_id = %id, endpoint = %self.inner.endpoint, "Connection created");
        Ok(IdleConnection {
            id,
            raw,
            idle_since: Instant::now(),
        })
    }

    fn checkout(&self, conn: IdleConnection<D::Connection>) -> PooledConnection<D> {
        PoolMetrics::incr(&self.inner.metrics.acquired);
        PooledConnection {
            id: conn.id,
            pool: self.clone(),
            raw: Some(conn.raw),
            invalidated: false,
            orphaned_savepoints: Vec::new(),
        }
    }

    /// Return a connection to the pool, or straight to the oldest waiter.
    fn put_back(&self, mut conn: IdleConnection<D::Connection>) {
        conn.idle_since = Instant::now();
        let mut state = self.inner.state.lock();
        if state.closed {
            state.idle.push_back(conn);
            drop(state);
            self.inner.drained.notify_waiters();
            return;
        }
        if let Some(Grant::Connection(conn)) = state.offer(Grant::Connection(conn)) {
            state.idle.push_back(conn);
        }
    }

    /// Hand back a grant its waiter can no longer use.
    fn return_grant(&self, grant: Grant<D::Connection>) {
        match grant {
            Grant::Connection(conn) => self.put_back(conn),
            Grant::Slot => self.free_slot(),
        }
    }

    /// Close a connection whose state cannot be trusted, off the caller's path.
    fn discard(&self, conn: IdleConnection<D::Connection>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = self.clone();
                runtime.spawn(async move {
                    let _ = pool.close_raw(&conn.id, conn.raw, true).await;
                    pool.free_slot();
                });
            }
            Err(_) => {
                warn!(
                    connection_id = %conn.id,
                    endpoint = %self.inner.endpoint,
                    "No runtime, dropping connection without disconnect"
                );
                drop(conn);
                PoolMetrics::incr(&self.inner.metrics.destroyed);
                self.free_slot();
            }
        }
    }

    /// Give up a slot: the oldest waiter may use it to connect, otherwise the pool shrinks.
    fn free_slot(&self) {
        let mut state = self.inner.state.lock();
        if !state.closed && state.offer(Grant::Slot).is_none() {
            return;
        }
        state.size = state.size.saturating_sub(1);
        drop(state);
        self.inner.drained.notify_waiters();
    }

    async fn close_raw(
        &self,
        id: &ConnectionId,
        mut raw: D::Connection,
        run_before_destroy: bool,
    ) -> DbResult<()> {
        let mut outcome = Ok(());
        if run_before_destroy {
            if let Some(hook) = &self.inner.hooks.before_destroy {
                if let Err(e) = hook(&mut raw).await {
                    warn!(connection_id = %id, error = %e, "before_destroy hook failed");
                    outcome = Err(DbError::hook("before_destroy", e.to_string()));
                }
            }
        }
        if let Err(e) = self.inner.driver.disconnect(raw).await {
            warn!(connection_id = %id, error = %e, "Failed to disconnect");
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }
        PoolMetrics::incr(&self.inner.metrics.destroyed);
        debug!(connection_id = %id, endpoint = %self.inner.endpoint, "Connection destroyed");
        outcome
    }

    /// Return a checked-out connection. Never fails.
    pub fn release(&self, conn: PooledConnection<D>) {
        if !conn.pool.same_pool(self) {
            warn!(
                connection_id = %conn.id,
                endpoint = %self.inner.endpoint,
                owner = %conn.pool.inner.endpoint,
                "Connection released to a foreign pool, routing to its owner"
            );
        }
        conn.release();
    }

    /// Close a checked-out connection instead of returning it. `None` is a no-op.
    pub async fn dispose(&self, conn: impl Into<Option<PooledConnection<D>>>) -> DbResult<()> {
        let Some(mut conn) = conn.into() else {
            return Ok(());
        };
        let owner = conn.pool.clone();
        let Some(raw) = conn.raw.take() else {
            return Ok(());
        };
        let result = owner.close_raw(&conn.id, raw, true).await;
        owner.free_slot();
        result
    }

    /// Liveness check for a checked-out connection.
    pub async fn ping(&self, conn: &mut PooledConnection<D>) -> DbResult<()> {
        let raw = conn.raw_mut()?;
        self.inner.driver.ping(raw).await
    }

    /// Close the pool: reject queued and future acquires, wait for every
    /// checked-out connection to come back, and dispose all of them.
    pub async fn drain(&self) {
        let rejected = {
            let mut state = self.inner.state.lock();
            if !state.closed {
                state.closed = true;
                info!(
                    endpoint = %self.inner.endpoint,
                    in_use = state.size.saturating_sub(state.idle.len() as u32),
                    "Draining connection pool"
                );
            }
            std::mem::take(&mut state.waiters)
        };
        // Dropping the senders fails those acquires with PoolClosed
        drop(rejected);
        self.inner.shutdown.cancel();

        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle: Vec<_> = self.inner.state.lock().idle.drain(..).collect();
            for conn in idle {
                let _ = self.close_raw(&conn.id, conn.raw, true).await;
                self.free_slot();
            }

            let remaining = self.inner.state.lock().size;
            if remaining == 0 {
                break;
            }
            debug!(
                endpoint = %self.inner.endpoint,
                remaining,
                "Waiting for checked-out connections"
            );
            notified.await;
        }
        info!(endpoint = %self.inner.endpoint, "Connection pool drained");
    }

    fn spawn_reaper(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(endpoint = %self.inner.endpoint, "No runtime, idle reaper disabled");
            return;
        };
        let weak: Weak<PoolInner<D>> = Arc::downgrade(&self.inner);
        let interval = self.inner.options.reap_interval();
        let shutdown = self.inner.shutdown.clone();

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Pool { inner }.reap().await;
            }
        });
    }

    /// Close idle connections past `idle_timeout` (keeping `min`) and top the pool up to `min`.
    async fn reap(&self) {
        let idle_timeout = self.inner.options.idle_timeout();
        let (expired, missing) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            let mut expired = Vec::new();
            while state.size - expired.len() as u32 > self.inner.min {
                match state.idle.front() {
                    Some(conn) if conn.idle_since.elapsed() >= idle_timeout => {
                        if let Some(conn) = state.idle.pop_front() {
                            expired.push(conn);
                        }
                    }
                    _ => break,
                }
            }
            let missing = self.inner.min.saturating_sub(state.size);
            state.size += missing;
            (expired, missing)
        };

        for conn in expired {
            debug!(connection_id = %conn.id, endpoint = %self.inner.endpoint, "Reaping idle connection");
            let _ = self.close_raw(&conn.id, conn.raw, true).await;
            self.free_slot();
        }

        for _ in 0..missing {
            match self.open().await {
                Ok(conn) => self.put_back(conn),
                Err(e) => {
                    warn!(
                        endpoint = %self.inner.endpoint,
                        error = %e,
                        "Failed to open connection for min_connections"
                    );
                    self.free_slot();
                }
            }
        }
    }
}

/// A `size` slot held by an in-flight acquire, possibly with the connection
/// occupying it. Dropped while armed, it gives the slot back.
struct Reservation<'a, D: Driver> {
    pool: &'a Pool<D>,
    conn: Option<IdleConnection<D::Connection>>,
    armed: bool,
}

impl<'a, D: Driver> Reservation<'a, D> {
    fn empty(pool: &'a Pool<D>) -> Self {
        Self {
            pool,
            conn: None,
            armed: true,
        }
    }

    fn holding(pool: &'a Pool<D>, conn: IdleConnection<D::Connection>) -> Self {
        Self {
            pool,
            conn: Some(conn),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<D: Driver> Drop for Reservation<'_, D> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.conn.take() {
            Some(conn) => {
                debug!(connection_id = %conn.id, "Acquire dropped mid-checkout, closing connection");
                self.pool.discard(conn);
            }
            None => self.pool.free_slot(),
        }
    }
}

/// A place in the wait queue. Dropped unresolved, it leaves the queue and
/// returns any grant that already landed.
struct QueuedAcquire<'a, D: Driver> {
    pool: &'a Pool<D>,
    id: u64,
    rx: oneshot::Receiver<Grant<D::Connection>>,
    resolved: bool,
}

impl<D: Driver> QueuedAcquire<'_, D> {
    /// Leave the queue, returning a grant sent before we got off it.
    fn withdraw(&mut self) -> Option<Grant<D::Connection>> {
        self.resolved = true;
        let still_queued = {
            let mut state = self.pool.inner.state.lock();
            match state.waiters.iter().position(|w| w.id == self.id) {
                Some(pos) => {
                    state.waiters.remove(pos);
                    true
                }
                None => false,
            }
        };
        // Grants are sent under the lock, so once off the queue the outcome
        // is already in the channel.
        if still_queued {
            None
        } else {
            self.rx.try_recv().ok()
        }
    }
}

impl<D: Driver> Drop for QueuedAcquire<'_, D> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if let Some(grant) = self.withdraw() {
            debug!(endpoint = %self.pool.endpoint(), waiter = self.id, "Queued acquire dropped after grant");
            self.pool.return_grant(grant);
        }
    }
}

/// A connection checked out of a [`Pool`].
///
/// Release it with [`PooledConnection::release`] (or through the client).
/// Dropping it releases it too, with a warning.
pub struct PooledConnection<D: Driver> {
    id: ConnectionId,
    pool: Pool<D>,
    raw: Option<D::Connection>,
    /// Closed instead of reused once released
    invalidated: bool,
    /// Savepoints abandoned by dropped nested transactions, rolled back lazily
    pub(crate) orphaned_savepoints: Vec<String>,
}

impl<D: Driver> PooledConnection<D> {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        self.pool.endpoint()
    }

    /// The pool that issued this connection.
    pub fn pool(&self) -> &Pool<D> {
        &self.pool
    }

    pub fn raw_mut(&mut self) -> DbResult<&mut D::Connection> {
        self.raw
            .as_mut()
            .ok_or_else(|| DbError::internal(format!("connection {} was already released", self.id)))
    }

    /// Mark the connection as being in an unknown protocol or transaction
    /// state. Releasing or dropping it then closes it instead of returning
    /// it to the idle set.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Return the connection to its pool.
    pub fn release(mut self) {
        if let Some(raw) = self.raw.take() {
            self.return_raw(raw);
        }
    }

    fn return_raw(&mut self, raw: D::Connection) {
        let conn = IdleConnection {
            id: self.id.clone(),
            raw,
            idle_since: Instant::now(),
        };
        if self.invalidated {
            debug!(connection_id = %self.id, endpoint = %self.pool.endpoint(), "Invalidated connection released, closing it");
            self.pool.discard(conn);
            return;
        }
        debug!(connection_id = %self.id, endpoint = %self.pool.endpoint(), "Connection released");
        self.pool.put_back(conn);
    }
}

impl<D: Driver> fmt::Debug for PooledConnection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("endpoint", &self.pool.endpoint())
            .finish()
    }
}

impl<D: Driver> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            warn!(
                connection_id = %self.id,
                "PooledConnection dropped without release, returning it to the pool"
            );
            self.return_raw(raw);
        }
    }
}
