//! Global client limit enforced on accept

use std::time::Duration;

use sluice::config::PoolMode;
use tokio::io::AsyncReadExt;

use super::*;

/// The pooler closes the socket without sending anything
async fn assert_refused_on_accept(addr: SocketAddr) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("connection left open");
    assert!(matches!(read, Ok(0) | Err(_)), "unexpected read {:?}", read);
}

#[tokio::test]
async fn test_client_limit_closes_extra_connections() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler_with(
        vec![route("app", "orders", &backend, PoolMode::Transaction, 4)],
        |config| config.listen.client_max = 2,
    )
    .await;
    let addr = pooler.local_addr();

    let a = TestClient::connect(addr, "app", "orders").await.unwrap();
    let mut b = TestClient::connect(addr, "app", "orders").await.unwrap();

    assert_refused_on_accept(addr).await;
    assert_eq!(pooler.context().clients.count(), 2);

    // A departure frees a slot for the next client
    a.terminate().await;
    eventually("slot released", || pooler.context().clients.count() == 1).await;

    let mut c = TestClient::connect(addr, "app", "orders").await.unwrap();
    c.query("SELECT 1").await.unwrap();
    b.query("SELECT 1").await.unwrap();
    assert_eq!(pooler.context().clients.count(), 2);

    b.terminate().await;
    c.terminate().await;
    pooler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_registry_tracks_client_lifetime() {
    let backend = FakeBackend::start().await;
    let pooler = start_pooler(vec![route("app", "orders", &backend, PoolMode::Session, 2)]).await;
    let addr = pooler.local_addr();

    let client = TestClient::connect(addr, "app", "orders").await.unwrap();
    let handles = pooler.context().clients.snapshot();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].user(), Some("app"));
    assert_eq!(handles[0].database(), Some("orders"));

    drop(client);
    eventually("client removed", || pooler.context().clients.count() == 0).await;

    pooler.shutdown(Duration::from_secs(1)).await;
}
