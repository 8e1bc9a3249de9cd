//! Server reuse, transaction boundaries and waiter queue behaviour

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sluice::config::PoolMode;
use sluice::protocol::sqlstate;

use super::*;

#[tokio::test]
async fn test_session_mode_pins_one_server() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler(vec![route("app", "orders", &backend, PoolMode::Session, 2)]).await;
    let addr = pooler.local_addr();

    let mut a = TestClient::connect(addr, "app", "orders").await.unwrap();
    let first = a.pid("SELECT 1").await;
    assert_eq!(a.pid("SELECT 2").await, first);
    assert!(a.params.iter().any(|(k, v)| k == "server_version" && v == "16.0"));

    let mut b = TestClient::connect(addr, "app", "orders").await.unwrap();
    assert_ne!(b.pid("SELECT 1").await, first);
    assert_eq!(pool_stats(&pooler, "app", "orders").active, 2);

    a.terminate().await;
    eventually("server returned to idle", || {
        let stats = pool_stats(&pooler, "app", "orders");
        stats.idle == 1 && stats.active == 1
    })
    .await;

    // The released server is the one handed to the next session
    let mut c = TestClient::connect(addr, "app", "orders").await.unwrap();
    assert_eq!(c.pid("SELECT 1").await, first);
    assert_eq!(backend.login_count(), 2);

    b.terminate().await;
    c.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_session_waits_for_single_server() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler(vec![route("app", "orders", &backend, PoolMode::Session, 1)]).await;
    let addr = pooler.local_addr();

    let mut a = TestClient::connect(addr, "app", "orders").await.unwrap();
    let pid = a.pid("SELECT 1").await;

    // Login completes only once the single server is free again
    let second = tokio::spawn(async move {
        let mut b = TestClient::connect(addr, "app", "orders").await.unwrap();
        let pid = b.pid("SELECT 1").await;
        (b, pid)
    });
    eventually("second client queued", || pool_stats(&pooler, "app", "orders").waiting == 1).await;
    assert!(!second.is_finished());

    a.terminate().await;
    let (b, b_pid) = second.await.unwrap();
    assert_eq!(b_pid, pid);
    assert_eq!(backend.login_count(), 1);

    b.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_transaction_mode_shares_server_between_clients() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler(vec![route("app", "orders", &backend, PoolMode::Transaction, 1)]).await;
    let addr = pooler.local_addr();

    let mut a = TestClient::connect(addr, "app", "orders").await.unwrap();
    let mut b = TestClient::connect(addr, "app", "orders").await.unwrap();
    assert!(b.params.iter().any(|(k, _)| k == "client_encoding"));

    let pid = a.pid("SELECT 1").await;
    assert_eq!(b.pid("SELECT 1").await, pid);
    assert_eq!(a.pid("SELECT 2").await, pid);

    eventually("server back in the pool", || {
        let stats = pool_stats(&pooler, "app", "orders");
        (stats.idle, stats.active) == (1, 0)
    })
    .await;
    assert_eq!(backend.login_count(), 1);

    a.terminate().await;
    b.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_transaction_holds_server_until_commit() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler(vec![route("app", "orders", &backend, PoolMode::Transaction, 1)]).await;
    let addr = pooler.local_addr();

    let mut a = TestClient::connect(addr, "app", "orders").await.unwrap();
    let mut b = TestClient::connect(addr, "app", "orders").await.unwrap();

    let pid = a.pid("BEGIN").await;
    assert_eq!(pool_stats(&pooler, "app", "orders").active, 1);

    let blocked = tokio::spawn(async move {
        let pid = b.pid("SELECT 1").await;
        (b, pid)
    });
    eventually("second client queued", || pool_stats(&pooler, "app", "orders").waiting == 1).await;
    assert!(!blocked.is_finished());

    assert_eq!(a.pid("UPDATE t").await, pid);
    a.query("COMMIT").await.unwrap();

    let (b, b_pid) = blocked.await.unwrap();
    assert_eq!(b_pid, pid);
    assert_eq!(pool_stats(&pooler, "app", "orders").waiting, 0);

    a.terminate().await;
    b.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_disconnect_mid_transaction_discards_server() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler(vec![route("app", "orders", &backend, PoolMode::Transaction, 1)]).await;
    let addr = pooler.local_addr();

    let mut a = TestClient::connect(addr, "app", "orders").await.unwrap();
    let pid = a.pid("BEGIN").await;
    drop(a);

    eventually("server discarded", || {
        pool_stats(&pooler, "app", "orders").total() == 0 && backend.disconnects() == 1
    })
    .await;

    let mut b = TestClient::connect(addr, "app", "orders").await.unwrap();
    assert_ne!(b.pid("SELECT 1").await, pid);

    b.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_waiters_served_in_arrival_order() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler(vec![route("app", "orders", &backend, PoolMode::Transaction, 1)]).await;
    let addr = pooler.local_addr();

    let mut holder = TestClient::connect(addr, "app", "orders").await.unwrap();
    holder.query("BEGIN").await.unwrap();

    let finished = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for (i, name) in ["first", "second", "third"].into_iter().enumerate() {
        let mut client = TestClient::connect(addr, "app", "orders").await.unwrap();
        let finished = finished.clone();
        tasks.push(tokio::spawn(async move {
            client.query("SLEEP 20").await.unwrap();
            finished.lock().push(name);
            client.terminate().await;
        }));
        eventually("client queued", || pool_stats(&pooler, "app", "orders").waiting == i + 1).await;
    }

    holder.query("COMMIT").await.unwrap();
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(*finished.lock(), vec!["first", "second", "third"]);
    assert_eq!(backend.login_count(), 1);

    holder.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_acquire_timeout_reports_too_many_connections() {
    let backend = FakeBackend::start().await;
    let mut rule = route("app", "orders", &backend, PoolMode::Transaction, 1);
    rule.pool.acquire_timeout_ms = 100;
    let pooler = start_pooler(vec![rule]).await;
    let addr = pooler.local_addr();

    let mut a = TestClient::connect(addr, "app", "orders").await.unwrap();
    a.query("BEGIN").await.unwrap();

    let mut b = TestClient::connect(addr, "app", "orders").await.unwrap();
    let err = b.query("SELECT 1").await.unwrap_err();
    assert_eq!(err.code, sqlstate::TOO_MANY_CONNECTIONS);
    assert_eq!(err.severity, "FATAL");
    b.expect_closed().await;

    let stats = pool_stats(&pooler, "app", "orders");
    assert_eq!((stats.waiting, stats.active), (0, 1));

    a.query("COMMIT").await.unwrap();
    a.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_client_leaving_queue_is_forgotten() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler(vec![route("app", "orders", &backend, PoolMode::Transaction, 1)]).await;
    let addr = pooler.local_addr();

    let mut a = TestClient::connect(addr, "app", "orders").await.unwrap();
    let pid = a.pid("BEGIN").await;

    let mut b = TestClient::connect(addr, "app", "orders").await.unwrap();
    let waiting = tokio::spawn(async move { b.query("SELECT 1").await });
    eventually("second client queued", || pool_stats(&pooler, "app", "orders").waiting == 1).await;

    waiting.abort();
    eventually("waiter removed", || pool_stats(&pooler, "app", "orders").waiting == 0).await;

    a.query("COMMIT").await.unwrap();
    eventually("server back in the pool", || {
        let stats = pool_stats(&pooler, "app", "orders");
        (stats.idle, stats.active) == (1, 0)
    })
    .await;

    let mut c = TestClient::connect(addr, "app", "orders").await.unwrap();
    assert_eq!(c.pid("SELECT 1").await, pid);

    a.terminate().await;
    c.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_session_reset_query_runs_before_reuse() {
    let backend = FakeBackend::start().await;
    let mut rule = route("app", "orders", &backend, PoolMode::Session, 1);
    rule.pool.reset_query = Some("DISCARD ALL".into());
    let pooler = start_pooler(vec![rule]).await;
    let addr = pooler.local_addr();

    let mut a = TestClient::connect(addr, "app", "orders").await.unwrap();
    let pid = a.pid("SET search_path TO app").await;
    a.terminate().await;

    eventually("server reset and idle", || {
        backend.queries().iter().any(|q| q == "DISCARD ALL")
            && pool_stats(&pooler, "app", "orders").idle == 1
    })
    .await;

    let mut b = TestClient::connect(addr, "app", "orders").await.unwrap();
    assert_eq!(b.pid("SELECT 1").await, pid);

    b.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}
