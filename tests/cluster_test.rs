//! Integration tests for cluster routing through the client.

mod common;

use common::{MockDriver, pool_options};
use db_dispatch::config::{ClientConfig, ClusterEndpoint, ConnectionSettings};
use db_dispatch::db::{Client, LeastBusy, RouteHint};
use db_dispatch::error::DbError;
use db_dispatch::events::CallContext;
use tokio_test::{assert_pending, assert_ready, task};

fn endpoint(host: &str, max: u32) -> ClusterEndpoint {
    ClusterEndpoint::new(ConnectionSettings {
        host: Some(host.to_string()),
        ..ConnectionSettings::default()
    })
    .named(host)
    .with_pool(pool_options(max))
}

/// Two endpoints sharing `database = app`.
fn cluster_config(max: u32) -> ClientConfig {
    ClientConfig {
        connection: Some(ConnectionSettings {
            database: Some("app".to_string()),
            ..ConnectionSettings::default()
        }),
        ..ClientConfig::clustered(vec![endpoint("a", max), endpoint("b", max)])
    }
}

#[tokio::test]
async fn test_endpoints_merge_shared_settings() {
    let driver = MockDriver::new();
    let client = Client::new(driver.clone(), cluster_config(1)).unwrap();

    let first = client.acquire(RouteHint::Any, CallContext::new()).await.unwrap();
    let second = client.acquire(RouteHint::Any, CallContext::new()).await.unwrap();
    assert_eq!(driver.connected_to(), vec!["a/app", "b/app"]);
    assert_eq!(first.endpoint(), "a");
    assert_eq!(second.endpoint(), "b");

    client.release_connection(first, CallContext::new());
    client.release_connection(second, CallContext::new());
}

#[tokio::test]
async fn test_saturated_cluster_queues_third_acquire() {
    let driver = MockDriver::new();
    let client = Client::new(driver.clone(), cluster_config(1)).unwrap();

    let first = client.acquire(RouteHint::Any, CallContext::new()).await.unwrap();
    let second = client.acquire(RouteHint::Any, CallContext::new()).await.unwrap();

    let mut third = task::spawn(
        client
            .acquire_connection(RouteHint::Any, CallContext::new())
            .completed(),
    );
    assert_pending!(third.poll());
    let pending: u32 = client.status().iter().map(|s| s.pending).sum();
    assert_eq!(pending, 1);

    // Round robin sent the third request back to the first endpoint
    client.release_connection(first, CallContext::new());
    assert!(third.is_woken());
    let conn = assert_ready!(third.poll()).unwrap();
    assert_eq!(conn.endpoint(), "a");
    assert_eq!(driver.connects(), 2);

    client.release_connection(conn, CallContext::new());
    client.release_connection(second, CallContext::new());
}

#[tokio::test]
async fn test_release_returns_to_owning_endpoint() {
    let driver = MockDriver::new();
    let client = Client::new(driver.clone(), cluster_config(2)).unwrap();

    let conn = client
        .acquire(RouteHint::Named("b".to_string()), CallContext::new())
        .await
        .unwrap();
    client.release_connection(conn, CallContext::new());

    let status = client.status();
    assert_eq!(status[0].size, 0);
    assert_eq!(status[1].idle, 1);
}

#[tokio::test]
async fn test_route_by_index_and_unknown_endpoint() {
    let driver = MockDriver::new();
    let client = Client::new(driver.clone(), cluster_config(1)).unwrap();

    let conn = client
        .acquire(RouteHint::Endpoint(1), CallContext::new())
        .await
        .unwrap();
    assert_eq!(conn.endpoint(), "b");
    client.release_connection(conn, CallContext::new());

    let err = client
        .acquire(RouteHint::Endpoint(5), CallContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));

    let err = client
        .acquire(RouteHint::Named("replica".to_string()), CallContext::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("replica"));
}

#[tokio::test]
async fn test_destroy_drains_every_endpoint() {
    let driver = MockDriver::new();
    let client = Client::new(driver.clone(), cluster_config(1)).unwrap();

    let a = client.acquire(RouteHint::Any, CallContext::new()).await.unwrap();
    let b = client.acquire(RouteHint::Any, CallContext::new()).await.unwrap();
    client.release_connection(a, CallContext::new());
    client.release_connection(b, CallContext::new());

    client.destroy().await;
    assert_eq!(driver.disconnects(), 2);
    assert!(!client.has_pool());
    let err = client
        .acquire(RouteHint::Any, CallContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NoPoolDefined));
}

#[tokio::test]
async fn test_least_busy_policy_balances_load() {
    let driver = MockDriver::new();
    let client = Client::builder(driver.clone(), cluster_config(4))
        .routing_policy(LeastBusy)
        .build()
        .unwrap();

    let first = client.acquire(RouteHint::Any, CallContext::new()).await.unwrap();
    assert_eq!(first.endpoint(), "a");
    let second = client.acquire(RouteHint::Any, CallContext::new()).await.unwrap();
    assert_eq!(second.endpoint(), "b");

    client.release_connection(second, CallContext::new());
    // "b" holds only an idle connection now
    let third = client.acquire(RouteHint::Any, CallContext::new()).await.unwrap();
    assert_eq!(third.endpoint(), "b");

    client.release_connection(first, CallContext::new());
    client.release_connection(third, CallContext::new());
}

#[tokio::test]
async fn test_endpoint_with_zero_max_is_rejected() {
    let config = ClientConfig::clustered(vec![endpoint("a", 1), endpoint("b", 0)]);
    let err = Client::new(MockDriver::new(), config).unwrap_err();
    assert!(matches!(err, DbError::Configuration { .. }));
    assert!(err.to_string().contains("'b'"));
}

#[tokio::test]
async fn test_unnamed_endpoints_get_positional_names() {
    let config = ClientConfig::clustered(vec![
        ClusterEndpoint::new(ConnectionSettings::from_url("mock://one/app")),
        ClusterEndpoint::new(ConnectionSettings::from_url("mock://two/app")),
    ]);
    let client = Client::new(MockDriver::new(), config).unwrap();

    let conn = client
        .acquire(
            RouteHint::Named("mock://two/app[1]".to_string()),
            CallContext::new(),
        )
        .await
        .unwrap();
    assert_eq!(conn.endpoint(), "mock://two/app[1]");
    client.release_connection(conn, CallContext::new());
}
