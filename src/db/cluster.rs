//! Cluster router: one pool per endpoint behind a single acquire contract.
//!
//! The target pool is picked by a [`RoutingPolicy`]. Connections remember
//! the pool that issued them, so release and dispose always go back to the
//! right endpoint regardless of the policy.

use crate::db::pool::{Pool, PoolStatus, PooledConnection};
use crate::driver::Driver;
use crate::error::{DbError, DbResult};
use futures_util::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Caller preference for which endpoint serves a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RouteHint {
    /// Let the routing policy decide
    #[default]
    Any,
    /// Endpoint by position in the cluster list
    Endpoint(usize),
    /// Endpoint by configured name
    Named(String),
}

/// Picks the endpoint for an unhinted request. Must be deterministic for a
/// given status snapshot and internal state.
pub trait RoutingPolicy: Send + Sync + fmt::Debug {
    /// Return an index into `statuses` (never empty).
    fn select(&self, statuses: &[PoolStatus]) -> usize;
}

/// Cycles through endpoints in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoutingPolicy for RoundRobin {
    fn select(&self, statuses: &[PoolStatus]) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % statuses.len()
    }
}

/// Endpoint with the fewest connections in use; ties go to the lowest index.
#[derive(Debug, Default)]
pub struct LeastBusy;

impl RoutingPolicy for LeastBusy {
    fn select(&self, statuses: &[PoolStatus]) -> usize {
        statuses
            .iter()
            .enumerate()
            .min_by_key(|(idx, s)| (s.in_use + s.pending, *idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }
}

struct Member<D: Driver> {
    name: String,
    pool: Pool<D>,
}

pub struct Cluster<D: Driver> {
    members: Vec<Member<D>>,
    policy: Arc<dyn RoutingPolicy>,
}

impl<D: Driver> fmt::Debug for Cluster<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field(
                "endpoints",
                &self.members.iter().map(|m| &m.name).collect::<Vec<_>>(),
            )
            .field("policy", &self.policy)
            .finish()
    }
}

impl<D: Driver> Cluster<D> {
    /// Build a cluster from named pools, in routing order.
    pub fn new(pools: Vec<(String, Pool<D>)>, policy: Arc<dyn RoutingPolicy>) -> DbResult<Self> {
        if pools.is_empty() {
            return Err(DbError::configuration(
                "A cluster needs at least one endpoint",
            ));
        }
        let members = pools
            .into_iter()
            .map(|(name, pool)| Member { name, pool })
            .collect::<Vec<_>>();
        debug!(endpoints = members.len(), policy = ?policy, "Creating cluster");
        Ok(Self { members, policy })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool<D>> {
        self.members.iter().map(|m| &m.pool)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name.as_str())
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        self.members.iter().map(|m| m.pool.status()).collect()
    }

    /// Resolve a hint to the pool that will serve it.
    pub fn route(&self, hint: &RouteHint) -> DbResult<&Pool<D>> {
        let idx = match hint {
            RouteHint::Any => self.policy.select(&self.status()),
            RouteHint::Endpoint(idx) => {
                if *idx >= self.members.len() {
                    return Err(DbError::invalid_input(format!(
                        "Cluster endpoint {} out of range (cluster has {})",
                        idx,
                        self.members.len()
                    )));
                }
                *idx
            }
            RouteHint::Named(name) => self
                .members
                .iter()
                .position(|m| &m.name == name)
                .ok_or_else(|| {
                    DbError::invalid_input(format!("Unknown cluster endpoint '{}'", name))
                })?,
        };
        Ok(&self.members[idx.min(self.members.len() - 1)].pool)
    }

    pub async fn acquire(
        &self,
        hint: &RouteHint,
        cancel: &CancellationToken,
    ) -> DbResult<PooledConnection<D>> {
        let pool = self.route(hint)?;
        debug!(endpoint = %pool.endpoint(), hint = ?hint, "Routing acquire");
        pool.acquire(cancel).await
    }

    /// Return a connection to the pool that issued it.
    pub fn release(&self, conn: PooledConnection<D>) {
        conn.release();
    }

    pub async fn dispose(&self, conn: impl Into<Option<PooledConnection<D>>>) -> DbResult<()> {
        match conn.into() {
            Some(conn) => {
                let owner = conn.pool().clone();
                owner.dispose(conn).await
            }
            None => Ok(()),
        }
    }

    /// Drain every pool concurrently; completes once all are drained.
    pub async fn destroy(&self) {
        info!(endpoints = self.members.len(), "Destroying cluster");
        join_all(self.members.iter().map(|m| m.pool.drain())).await;
    }
}
