//! Shared test helpers: a scripted in-memory driver.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use db_dispatch::config::{ConnectionSettings, PoolOptions};
use db_dispatch::db::{Pool, PoolConfig, PoolHooks};
use db_dispatch::driver::{ConnectionHook, Dialect, Driver};
use db_dispatch::error::{DbError, DbResult};
use db_dispatch::models::{ConnectionId, QueryRequest, QueryResult, Row, StreamOptions};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
pub struct MockState {
    connects: AtomicU32,
    disconnects: AtomicU32,
    serial: AtomicU32,
    fail_connect: AtomicBool,
    fail_ping: AtomicBool,
    connect_delay_ms: AtomicU64,
    execute_delay_ms: AtomicU64,
    statements: Mutex<Vec<String>>,
    connected_to: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<ConnectionId>>,
    fail_on: Mutex<Vec<String>>,
}

/// A driver whose connections live in memory and record every statement.
///
/// Statements containing a registered failure marker fail with
/// `mock failure`. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
    cancellable: bool,
}

#[derive(Debug)]
pub struct MockConnection {
    pub serial: u32,
    pub tags: Vec<String>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancellable() -> Self {
        Self {
            state: Arc::default(),
            cancellable: true,
        }
    }

    pub fn fail_on(&self, marker: &str) {
        self.state.fail_on.lock().push(marker.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.fail_on.lock().clear();
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.state.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_execute_delay(&self, delay: Duration) {
        self.state
            .execute_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.statements.lock().clone()
    }

    pub fn connected_to(&self) -> Vec<String> {
        self.state.connected_to.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<ConnectionId> {
        self.state.cancelled.lock().clone()
    }

    fn check_failure(&self, sql: &str) -> DbResult<()> {
        let failing = self
            .state
            .fail_on
            .lock()
            .iter()
            .any(|marker| sql.contains(marker.as_str()));
        if failing {
            return Err(DbError::database(
                "mock failure",
                Some("HY000".to_string()),
                "scripted by the test",
            ));
        }
        Ok(())
    }
}

impl Dialect for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn can_cancel_query(&self) -> bool {
        self.cancellable
    }
}

#[async_trait]
impl Driver for MockDriver {
    type Connection = MockConnection;

    async fn connect(&self, settings: &ConnectionSettings) -> DbResult<MockConnection> {
        let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::connection("mock connect refused", "retry later"));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.connected_to.lock().push(settings.label());
        Ok(MockConnection {
            serial: self.state.serial.fetch_add(1, Ordering::SeqCst) + 1,
            tags: Vec::new(),
        })
    }

    async fn disconnect(&self, _conn: MockConnection) -> DbResult<()> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self, _conn: &mut MockConnection) -> DbResult<()> {
        if self.state.fail_ping.load(Ordering::SeqCst) {
            return Err(DbError::connection("mock ping failed", "reconnect"));
        }
        Ok(())
    }

    async fn execute(
        &self,
        conn: &mut MockConnection,
        request: &QueryRequest,
    ) -> DbResult<QueryResult> {
        let rendered = request.to_display_string();
        self.state.statements.lock().push(rendered.clone());
        let delay = self.state.execute_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_failure(&request.sql)?;

        let mut row = Row::new();
        row.insert("sql".to_string(), json!(rendered));
        row.insert("connection".to_string(), json!(conn.serial));
        Ok(QueryResult::with_rows(Vec::new(), vec![row], 0))
    }

    async fn stream(
        &self,
        conn: &mut MockConnection,
        request: &QueryRequest,
        sink: mpsc::Sender<Row>,
        options: &StreamOptions,
    ) -> DbResult<u64> {
        self.state
            .statements
            .lock()
            .push(request.to_display_string());
        self.check_failure(&request.sql)?;

        let mut sent = 0;
        for n in 0..5u64 {
            if options.max_rows.is_some_and(|max| sent >= max) {
                break;
            }
            let mut row = Row::new();
            row.insert("n".to_string(), json!(n));
            row.insert("connection".to_string(), json!(conn.serial));
            if sink.send(row).await.is_err() {
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }

    async fn cancel_query(&self, connection_id: &ConnectionId) -> DbResult<()> {
        self.state.cancelled.lock().push(connection_id.clone());
        Ok(())
    }
}

pub fn settings() -> ConnectionSettings {
    ConnectionSettings::from_url("mock://localhost/app")
}

pub fn pool_options(max: u32) -> PoolOptions {
    PoolOptions {
        max_connections: Some(max),
        ..PoolOptions::default()
    }
}

pub fn pool(driver: &MockDriver, options: PoolOptions) -> Pool<MockDriver> {
    pool_with_hooks(driver, options, PoolHooks::default())
}

pub fn pool_with_hooks(
    driver: &MockDriver,
    options: PoolOptions,
    hooks: PoolHooks<MockConnection>,
) -> Pool<MockDriver> {
    Pool::new(
        Arc::new(driver.clone()),
        PoolConfig::new("mock", settings())
            .with_options(options)
            .with_hooks(hooks),
    )
    .unwrap()
}

/// Wrap a closure as a pool lifecycle hook.
pub fn hook<F>(f: F) -> ConnectionHook<MockConnection>
where
    F: for<'a> Fn(&'a mut MockConnection) -> BoxFuture<'a, DbResult<()>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Poll `check` until it holds, failing the test after a second.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
