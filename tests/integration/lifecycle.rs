//! Backend failures, authentication, maintenance sweeps and shutdown

use std::time::Duration;

use sluice::config::{AuthMode, PoolMode, UserConfig};
use sluice::protocol::sqlstate;

use super::*;

#[tokio::test]
async fn test_backend_refusal_reaches_client() {
    let backend = FakeBackend::start().await;
    backend.set_refuse(true);
    let pooler = start_pooler(vec![route("app", "orders", &backend, PoolMode::Transaction, 2)]).await;
    let addr = pooler.local_addr();

    let err = TestClient::connect(addr, "app", "orders").await.err().unwrap();
    assert_eq!(err.code, sqlstate::CONNECTION_FAILURE);
    assert_eq!(pool_stats(&pooler, "app", "orders").total(), 0);

    // Nothing is cached from the failure; the next login connects afresh
    backend.set_refuse(false);
    let mut client = TestClient::connect(addr, "app", "orders").await.unwrap();
    client.query("SELECT 1").await.unwrap();
    assert_eq!(backend.login_count(), 1);

    client.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_password_authentication() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler_with(
        vec![route("app", "orders", &backend, PoolMode::Transaction, 2)],
        password_pooler_config,
    )
    .await;
    let addr = pooler.local_addr();

    let err = TestClient::connect_with_password(addr, "app", "orders", Some("wrong"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.code, sqlstate::INVALID_PASSWORD);
    assert!(pooler.context().routes.is_empty());
    assert_eq!(backend.login_count(), 0);

    let mut client = TestClient::connect_with_password(addr, "app", "orders", Some("secret"))
        .await
        .unwrap();
    client.query("SELECT 1").await.unwrap();

    client.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}

fn password_pooler_config(config: &mut Config) {
    config.auth.mode = AuthMode::Password;
    config.auth.users = vec![UserConfig {
        name: "app".into(),
        password: "secret".into(),
    }];
}

/// Send a startup packet and read up to the cleartext password request
async fn start_login(framed: &mut Framed<TcpStream, MessageCodec>) {
    framed
        .send(&StartupMessage::new("app", "orders").encode()[..])
        .await
        .unwrap();
    let msg = framed.next().await.unwrap().unwrap();
    assert_eq!(msg.tag, backend::AUTHENTICATION);
    assert_eq!(AuthRequest::parse(&msg.payload), Some(AuthRequest::CleartextPassword));
}

#[tokio::test]
async fn test_oversized_password_message_closes_connection() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler_with(
        vec![route("app", "orders", &backend, PoolMode::Transaction, 2)],
        password_pooler_config,
    )
    .await;

    let stream = TcpStream::connect(pooler.local_addr()).await.unwrap();
    let mut framed = Framed::new(stream, MessageCodec::new());
    start_login(&mut framed).await;

    // Header announcing a 1 MiB password, followed by a little of it
    let mut frame = vec![frontend::PASSWORD];
    frame.extend_from_slice(&(1i32 << 20).to_be_bytes());
    frame.extend_from_slice(&[b'x'; 64]);
    framed.send(&frame[..]).await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(Ok(msg)) = framed.next().await {
            assert_ne!(msg.tag, backend::READY_FOR_QUERY, "oversized login was accepted");
        }
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed by the pooler");
    eventually("client removed", || pooler.context().clients.count() == 0).await;
    assert_eq!(backend.login_count(), 0);

    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_login_timeout_covers_startup_and_password() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler_with(
        vec![route("app", "orders", &backend, PoolMode::Transaction, 2)],
        |config| {
            password_pooler_config(config);
            config.listen.login_timeout_ms = 300;
        },
    )
    .await;

    let started = tokio::time::Instant::now();
    let stream = TcpStream::connect(pooler.local_addr()).await.unwrap();
    let mut framed = Framed::new(stream, MessageCodec::new());

    // A slow startup leaves less time for the password, never a fresh budget
    tokio::time::sleep(Duration::from_millis(200)).await;
    start_login(&mut framed).await;

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(Ok(_)) = framed.next().await {}
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed by the pooler");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "closed early after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(450), "login took {:?}", elapsed);

    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shutdown_closes_clients_and_pools() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler(vec![route("app", "orders", &backend, PoolMode::Session, 2)]).await;
    let addr = pooler.local_addr();
    let ctx = pooler.context().clone();

    let mut client = TestClient::connect(addr, "app", "orders").await.unwrap();
    client.query("BEGIN").await.unwrap();

    pooler.shutdown(Duration::from_millis(100)).await;

    client.expect_closed().await;
    assert_eq!(ctx.clients.count(), 0);
    let route = ctx.routes.get(&RouteKey::new("app", "orders")).unwrap();
    assert!(route.pool.is_closed());
    assert_eq!(route.pool.stats().total(), 0);
    eventually("backend connection closed", || backend.disconnects() == 1).await;

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_idle_client_drains_within_grace() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler(vec![route("app", "orders", &backend, PoolMode::Transaction, 2)]).await;
    let addr = pooler.local_addr();
    let ctx = pooler.context().clone();

    let client = TestClient::connect(addr, "app", "orders").await.unwrap();
    let leaving = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.terminate().await;
    });

    pooler.shutdown(Duration::from_secs(5)).await;
    leaving.await.unwrap();
    assert_eq!(ctx.clients.count(), 0);
}

#[tokio::test]
async fn test_maintainer_prefills_min_size() {
    let backend = FakeBackend::start().await;
    let mut rule = route("app", "orders", &backend, PoolMode::Transaction, 4);
    rule.pool.min_size = 2;
    let pooler = start_pooler_with(vec![rule], |config| config.periodic.interval_ms = 20).await;
    let addr = pooler.local_addr();

    // Pools are created lazily, on the first client for the key
    let mut client = TestClient::connect(addr, "app", "orders").await.unwrap();
    eventually("pool filled to min_size", || {
        pool_stats(&pooler, "app", "orders").idle == 2 && backend.login_count() == 2
    })
    .await;

    client.query("SELECT 1").await.unwrap();
    assert_eq!(backend.login_count(), 2);

    client.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_maintainer_evicts_idle_servers() {
    let backend = FakeBackend::start().await;
    let mut rule = route("app", "orders", &backend, PoolMode::Transaction, 2);
    rule.pool.idle_timeout_ms = 50;
    let pooler = start_pooler_with(vec![rule], |config| config.periodic.interval_ms = 20).await;
    let addr = pooler.local_addr();

    let mut client = TestClient::connect(addr, "app", "orders").await.unwrap();
    let pid = client.pid("SELECT 1").await;

    eventually("idle server evicted", || {
        pool_stats(&pooler, "app", "orders").total() == 0 && backend.disconnects() >= 1
    })
    .await;

    // The client is unaffected and gets a fresh server
    assert_ne!(client.pid("SELECT 1").await, pid);

    client.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_health_check_discards_failing_servers() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler_with(
        vec![route("app", "orders", &backend, PoolMode::Transaction, 2)],
        |config| {
            config.periodic.interval_ms = 20;
            config.periodic.health_check = true;
        },
    )
    .await;
    let addr = pooler.local_addr();

    let mut client = TestClient::connect(addr, "app", "orders").await.unwrap();
    client.query("SELECT 1").await.unwrap();

    eventually("idle server probed", || backend.queries().iter().any(|q| q.is_empty())).await;
    assert_eq!(pool_stats(&pooler, "app", "orders").total(), 1);

    backend.set_fail_probes(true);
    eventually("failing server discarded", || {
        pool_stats(&pooler, "app", "orders").total() == 0 && backend.disconnects() == 1
    })
    .await;

    client.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}
