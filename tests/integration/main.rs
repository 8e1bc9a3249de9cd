//! Integration test entry point
//!
//! Each test starts a pooler on an ephemeral port in front of one or more
//! in-process fake PostgreSQL backends, then talks to it with a minimal
//! protocol client.
//!
//! Run with: cargo test --test integration

mod admission;
mod lifecycle;
mod pooling;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use sluice::auth;
use sluice::config::{BackendConfig, Config, PoolConfig, PoolMode, RouteConfig};
use sluice::pool::PoolStats;
use sluice::protocol::messages::{
    authentication_ok, backend_key_data, parameter_status, parse_parameter_status,
    password_message, query, ready_for_query, terminate,
};
use sluice::protocol::{
    backend, frontend, AuthRequest, ErrorResponse, Message, MessageCodec, StartupCodec,
    StartupMessage, StartupRequest, TransactionStatus,
};
use sluice::route::RouteKey;
use sluice::{Pooler, PoolerHandle};

// ============================================================================
// Fake backend
// ============================================================================

#[derive(Default)]
struct BackendState {
    next_pid: AtomicI32,
    /// Answer logins with an ErrorResponse
    refuse: AtomicBool,
    /// Answer empty queries (health probes) with an ErrorResponse
    fail_probes: AtomicBool,
    disconnects: AtomicUsize,
    logins: Mutex<Vec<(String, String)>>,
    queries: Mutex<Vec<String>>,
}

/// A PostgreSQL look-alike that logs in anyone and answers every simple
/// query with `CommandComplete("<VERB> pid=<n>")`
pub struct FakeBackend {
    pub addr: SocketAddr,
    state: Arc<BackendState>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BackendState::default());

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_backend(stream, accept_state.clone()));
            }
        });

        Self { addr, state }
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn set_fail_probes(&self, fail: bool) {
        self.state.fail_probes.store(fail, Ordering::SeqCst);
    }

    /// (user, database) of every successful login
    pub fn logins(&self) -> Vec<(String, String)> {
        self.state.logins.lock().clone()
    }

    pub fn login_count(&self) -> usize {
        self.state.logins.lock().len()
    }

    pub fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.queries.lock().clone()
    }
}

async fn serve_backend(stream: TcpStream, state: Arc<BackendState>) {
    let mut startup = Framed::new(stream, StartupCodec);
    let Some(Ok(body)) = startup.next().await else {
        return;
    };
    let Ok(StartupRequest::Startup(login)) = StartupRequest::parse(&body) else {
        return;
    };
    let mut framed = startup.map_codec(|_| MessageCodec::new());

    if state.refuse.load(Ordering::SeqCst) {
        let refusal = ErrorResponse::fatal("28000", "connections refused");
        let _ = framed.send(refusal.encode()).await;
        return;
    }

    state
        .logins
        .lock()
        .push((login.user().to_string(), login.database().to_string()));
    let pid = state.next_pid.fetch_add(1, Ordering::SeqCst) + 1;

    let greeting = [
        authentication_ok(),
        parameter_status("server_version", "16.0"),
        parameter_status("client_encoding", "UTF8"),
        backend_key_data(pid, 42),
        ready_for_query(TransactionStatus::Idle),
    ];
    for msg in greeting {
        if framed.feed(msg).await.is_err() {
            return;
        }
    }
    if SinkExt::<Message>::flush(&mut framed).await.is_err() {
        return;
    }

    let mut status = TransactionStatus::Idle;
    while let Some(Ok(msg)) = framed.next().await {
        match msg.tag {
            frontend::QUERY => {
                let sql = cstr(&msg.payload);
                state.queries.lock().push(sql.clone());

                let reply = if sql.trim().is_empty() {
                    if state.fail_probes.load(Ordering::SeqCst) {
                        ErrorResponse::new("XX000", "probe failed").encode()
                    } else {
                        Message::new(backend::EMPTY_QUERY_RESPONSE, Bytes::new())
                    }
                } else {
                    let verb = sql.split_whitespace().next().unwrap_or_default().to_uppercase();
                    match verb.as_str() {
                        "BEGIN" => status = TransactionStatus::InTransaction,
                        "COMMIT" | "ROLLBACK" => status = TransactionStatus::Idle,
                        "SLEEP" => {
                            let ms = sql
                                .split_whitespace()
                                .nth(1)
                                .and_then(|m| m.parse().ok())
                                .unwrap_or(0);
                            tokio::time::sleep(Duration::from_millis(ms)).await;
                        }
                        _ => {}
                    }
                    command_complete(&format!("{} pid={}", verb, pid))
                };

                if framed.feed(reply).await.is_err()
                    || framed.send(ready_for_query(status)).await.is_err()
                {
                    break;
                }
            }
            frontend::SYNC => {
                if framed.send(ready_for_query(status)).await.is_err() {
                    break;
                }
            }
            frontend::TERMINATE => break,
            _ => {}
        }
    }
    state.disconnects.fetch_add(1, Ordering::SeqCst);
}

fn command_complete(tag: &str) -> Message {
    let mut payload = tag.as_bytes().to_vec();
    payload.push(0);
    Message::new(backend::COMMAND_COMPLETE, payload)
}

fn cstr(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

// ============================================================================
// Test client
// ============================================================================

/// Minimal frontend speaking the simple query protocol
pub struct TestClient {
    framed: Framed<TcpStream, MessageCodec>,
    pub params: Vec<(String, String)>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, user: &str, database: &str) -> Result<Self, ErrorResponse> {
        Self::connect_with_password(addr, user, database, None).await
    }

    pub async fn connect_with_password(
        addr: SocketAddr,
        user: &str,
        database: &str,
        password: Option<&str>,
    ) -> Result<Self, ErrorResponse> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, MessageCodec::new());
        framed
            .send(&StartupMessage::new(user, database).encode()[..])
            .await
            .unwrap();

        let mut params = Vec::new();
        loop {
            let msg = match framed.next().await {
                Some(Ok(msg)) => msg,
                _ => return Err(ErrorResponse::fatal("08006", "connection closed during login")),
            };
            match msg.tag {
                backend::AUTHENTICATION => match AuthRequest::parse(&msg.payload) {
                    Some(AuthRequest::Ok) => {}
                    Some(AuthRequest::CleartextPassword) => {
                        framed
                            .send(password_message(password.unwrap_or_default()))
                            .await
                            .unwrap();
                    }
                    other => panic!("unexpected authentication request {:?}", other),
                },
                backend::PARAMETER_STATUS => {
                    params.extend(parse_parameter_status(&msg.payload));
                }
                backend::BACKEND_KEY_DATA => {}
                backend::ERROR_RESPONSE => {
                    return Err(ErrorResponse::parse(&msg.payload).unwrap());
                }
                backend::READY_FOR_QUERY => return Ok(Self { framed, params }),
                other => panic!("unexpected message '{}' during login", other as char),
            }
        }
    }

    /// Run a simple query; returns the CommandComplete tags
    pub async fn query(&mut self, sql: &str) -> Result<Vec<String>, ErrorResponse> {
        self.framed.send(query(sql)).await.unwrap();

        let mut tags = Vec::new();
        let mut error = None;
        loop {
            let msg = match self.framed.next().await {
                Some(Ok(msg)) => msg,
                _ => {
                    return Err(error
                        .unwrap_or_else(|| ErrorResponse::fatal("08006", "connection closed")))
                }
            };
            match msg.tag {
                backend::COMMAND_COMPLETE => tags.push(cstr(&msg.payload)),
                backend::ERROR_RESPONSE => error = ErrorResponse::parse(&msg.payload),
                backend::READY_FOR_QUERY => break,
                _ => {}
            }
        }
        match error {
            Some(e) => Err(e),
            None => Ok(tags),
        }
    }

    /// Backend process id that served `sql`
    pub async fn pid(&mut self, sql: &str) -> i32 {
        let tags = self.query(sql).await.unwrap();
        tags.last()
            .and_then(|t| t.rsplit("pid=").next())
            .and_then(|p| p.parse().ok())
            .unwrap_or_else(|| panic!("no pid in {:?}", tags))
    }

    pub async fn terminate(mut self) {
        let _ = self.framed.send(terminate()).await;
    }

    /// Wait for the pooler to close the connection
    pub async fn expect_closed(mut self) {
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(Ok(_)) = self.framed.next().await {}
        })
        .await;
        assert!(closed.is_ok(), "connection was not closed by the pooler");
    }
}

// ============================================================================
// Pooler helpers
// ============================================================================

pub fn route(user: &str, database: &str, backend: &FakeBackend, mode: PoolMode, max_size: usize) -> RouteConfig {
    RouteConfig {
        user: user.to_string(),
        database: database.to_string(),
        backend: BackendConfig {
            host: "127.0.0.1".to_string(),
            port: backend.addr.port(),
            ..BackendConfig::default()
        },
        pool: PoolConfig {
            mode,
            max_size,
            ..PoolConfig::default()
        },
    }
}

pub async fn start_pooler(routes: Vec<RouteConfig>) -> PoolerHandle {
    start_pooler_with(routes, |_| {}).await
}

pub async fn start_pooler_with(routes: Vec<RouteConfig>, tweak: impl FnOnce(&mut Config)) -> PoolerHandle {
    let mut config = Config {
        routes,
        ..Config::default()
    };
    config.listen.port = 0;
    config.periodic.interval_ms = 60_000;
    tweak(&mut config);
    config.validate().unwrap();

    let authenticator = Arc::from(auth::from_config(&config.auth));
    Pooler::start(config, authenticator).await.unwrap()
}

pub fn pool_stats(pooler: &PoolerHandle, user: &str, database: &str) -> PoolStats {
    pooler
        .context()
        .routes
        .get(&RouteKey::new(user, database))
        .map(|route| route.pool.stats())
        .unwrap_or_else(|| panic!("no route for {}@{}", user, database))
}

/// Poll `condition` until it holds, failing after two seconds
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}
