//! Connection management and dispatch.
//!
//! This module provides:
//! - Connection pools for a single endpoint
//! - Cluster routing over several pools
//! - The client that owns a pool or cluster and dispatches statements
//! - Transactions and savepoints on a checked-out connection

pub mod client;
pub mod cluster;
pub mod pool;
pub mod transaction;

pub use client::{AbortHandle, AcquireRequest, Backend, Client, ClientBuilder};
pub use cluster::{Cluster, LeastBusy, RoundRobin, RouteHint, RoutingPolicy};
pub use pool::{
    Pool, PoolConfig, PoolHooks, PoolMetricsSnapshot, PoolStatus, PooledConnection,
};
pub use transaction::Transaction;
