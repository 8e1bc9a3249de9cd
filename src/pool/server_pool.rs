use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::ClientId;
use crate::config::{PoolConfig, PoolMode};
use crate::metrics::metrics;

use super::server::{BackendTarget, ConnectionError, ServerConnection};
use super::state::{Checkout, Grant, Holder, PoolPolicy, PoolState, PoolStats, ServerId, WaiterId};

/// Errors surfaced by acquire
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Server connection failed: {0}")]
    ServerConnectFailed(#[source] ConnectionError),

    #[error("Timed out after {0:?} waiting for a server")]
    AcquireTimeout(Duration),

    #[error("Pool is closed")]
    Closed,
}

/// What to do with a server on release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Back to idle (or straight to the oldest waiter)
    Reuse,
    /// Close it and free its slot
    Discard,
}

/// Bounded pool of backend servers for one route
///
/// Acquirers beyond `max_size` wait in arrival order. Servers are lent out as
/// [`PooledServer`] guards; a guard dropped without release discards the
/// server so no capacity is ever leaked.
pub struct ServerPool {
    /// Route label used in logs and metrics
    name: String,
    target: BackendTarget,
    config: PoolConfig,
    state: Mutex<PoolState<ServerConnection>>,
    /// ParameterStatus set of the first server that logged in
    startup_params: RwLock<Option<Arc<Vec<(String, String)>>>>,
}

impl ServerPool {
    pub fn new(name: impl Into<String>, target: BackendTarget, config: PoolConfig) -> Self {
        let policy = PoolPolicy::from(&config);
        Self {
            name: name.into(),
            target,
            config,
            state: Mutex::new(PoolState::new(policy)),
            startup_params: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn mode(&self) -> PoolMode {
        self.config.mode
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    /// Parameters the backend reported at login, replayed to clients
    pub fn startup_params(&self) -> Option<Arc<Vec<(String, String)>>> {
        self.startup_params.read().clone()
    }

    /// Acquire a server for a client
    pub async fn acquire(self: &Arc<Self>, client: ClientId) -> Result<PooledServer, PoolError> {
        self.acquire_for(Holder::Client(client)).await
    }

    async fn acquire_for(self: &Arc<Self>, holder: Holder) -> Result<PooledServer, PoolError> {
        let started = Instant::now();
        let mut expired = Vec::new();
        let checkout = self.with_state(|s| s.checkout(holder, started, &mut expired));
        self.close_discarded(expired, "expired");

        let (server, path) = match checkout {
            Checkout::Server { id, conn } => {
                debug!(route = %self.name, server = %id, holder = %holder, "Reusing idle server");
                (PooledServer::new(self.clone(), id, holder, conn), "idle")
            }
            Checkout::Connect { id } => {
                let slot = ConnectSlot::new(self.clone(), id);
                (self.connect_into(slot, holder).await?, "connect")
            }
            Checkout::Wait { waiter, rx } => {
                debug!(route = %self.name, holder = %holder, "Pool saturated, waiting for a server");
                let guard = WaitGuard::new(self.clone(), waiter, rx);
                (self.wait(guard, holder).await?, "wait")
            }
            Checkout::Closed => return Err(PoolError::Closed),
        };

        metrics().record_acquire(&self.name, path, started.elapsed().as_secs_f64());
        Ok(server)
    }

    async fn wait(self: &Arc<Self>, mut guard: WaitGuard, holder: Holder) -> Result<PooledServer, PoolError> {
        let grant = match self.config.acquire_timeout() {
            Some(limit) => match tokio::time::timeout(limit, guard.recv()).await {
                Ok(grant) => grant,
                Err(_) => {
                    warn!(route = %self.name, holder = %holder, timeout = ?limit, "Acquire timed out");
                    metrics().record_acquire_timeout(&self.name);
                    return Err(PoolError::AcquireTimeout(limit));
                }
            },
            None => guard.recv().await,
        };

        match grant {
            Some(Grant::Server { id, conn }) => {
                debug!(route = %self.name, server = %id, holder = %holder, "Server handed over by release");
                Ok(PooledServer::new(self.clone(), id, holder, conn))
            }
            Some(Grant::Connect { id }) => {
                let slot = ConnectSlot::new(self.clone(), id);
                self.connect_into(slot, holder).await
            }
            None => Err(PoolError::Closed),
        }
    }

    /// Open a backend connection for a reserved slot
    async fn connect(&self, slot: &ConnectSlot) -> Result<ServerConnection, PoolError> {
        let limit = self.config.connect_timeout();
        let result = tokio::time::timeout(limit, ServerConnection::connect(&self.target)).await;
        let conn = match result {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(route = %self.name, server = %slot.id, error = %e, "Backend connect failed");
                metrics().record_server_connect(&self.name, "error");
                return Err(PoolError::ServerConnectFailed(e));
            }
            Err(_) => {
                warn!(route = %self.name, server = %slot.id, timeout = ?limit, "Backend connect timed out");
                metrics().record_server_connect(&self.name, "timeout");
                return Err(PoolError::ServerConnectFailed(ConnectionError::Timeout(limit)));
            }
        };

        metrics().record_server_connect(&self.name, "ok");
        let mut params = self.startup_params.write();
        if params.is_none() {
            *params = Some(Arc::new(conn.params().to_vec()));
        }
        Ok(conn)
    }

    async fn connect_into(self: &Arc<Self>, slot: ConnectSlot, holder: Holder) -> Result<PooledServer, PoolError> {
        let conn = self.connect(&slot).await?;
        let id = slot.disarm();
        if !self.with_state(|s| s.connected(id, holder, Instant::now())) {
            close_server(conn);
            return Err(PoolError::Closed);
        }
        info!(route = %self.name, server = %id, holder = %holder, addr = %self.target.addr(), "Server connected");
        Ok(PooledServer::new(self.clone(), id, holder, conn))
    }

    /// Open servers until `min_size` is met. Returns how many were created.
    pub async fn prefill(self: &Arc<Self>) -> usize {
        let mut created = 0;
        loop {
            let reserved = self.with_state(|s| {
                if s.deficit() == 0 || s.has_waiters() {
                    None
                } else {
                    s.reserve_connect(Instant::now())
                }
            });
            let Some(id) = reserved else {
                break;
            };

            let slot = ConnectSlot::new(self.clone(), id);
            let conn = match self.connect(&slot).await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let id = slot.disarm();
            if let Some(rejected) = self.with_state(|s| s.connected_idle(id, conn, Instant::now())) {
                close_server(rejected);
                break;
            }
            created += 1;
        }
        if created > 0 {
            debug!(route = %self.name, created, "Prefilled pool");
        }
        created
    }

    /// Close idle servers past their idle timeout, lifetime or request limit
    pub fn evict_expired(&self) -> usize {
        let evicted = self.with_state(|s| s.evict_expired(Instant::now()));
        let n = evicted.len();
        self.close_discarded(evicted, "expired");
        n
    }

    /// Probe idle servers untouched for `min_idle`; failures are discarded.
    /// Returns (healthy, failed).
    pub async fn probe_idle(self: &Arc<Self>, min_idle: Duration, timeout: Duration) -> (usize, usize) {
        let batch = self.with_state(|s| s.checkout_for_probe(Instant::now(), min_idle));
        let mut guards: Vec<PooledServer> = batch
            .into_iter()
            .map(|(id, conn)| PooledServer::new(self.clone(), id, Holder::Maintainer, conn))
            .collect();

        let (mut healthy, mut failed) = (0, 0);
        for mut server in guards.drain(..) {
            let result = tokio::time::timeout(timeout, server.probe()).await;
            match result {
                Ok(Ok(())) => {
                    metrics().record_health_check(&self.name, "success");
                    healthy += 1;
                    server.release_probed();
                }
                Ok(Err(e)) => {
                    warn!(route = %self.name, server = %server.id(), error = %e, "Idle server failed probe");
                    metrics().record_health_check(&self.name, "failure");
                    failed += 1;
                    server.release_with_reason(ReleaseMode::Discard, "failed_probe");
                }
                Err(_) => {
                    warn!(route = %self.name, server = %server.id(), timeout = ?timeout, "Idle server probe timed out");
                    metrics().record_health_check(&self.name, "failure");
                    failed += 1;
                    server.release_with_reason(ReleaseMode::Discard, "failed_probe");
                }
            }
        }
        (healthy, failed)
    }

    /// Refuse new acquires, fail waiters and close idle servers. Servers
    /// still lent out are closed when they come back.
    pub fn close(&self) {
        let idle = self.with_state(|s| s.close());
        if !idle.is_empty() {
            info!(route = %self.name, servers = idle.len(), "Closing pool");
        }
        for conn in idle {
            close_server(conn);
        }
    }

    fn release(&self, id: ServerId, conn: ServerConnection, mode: ReleaseMode, reason: &str) {
        match mode {
            ReleaseMode::Reuse => {
                if let Some(worn) = self.with_state(|s| s.checkin(id, conn, Instant::now())) {
                    debug!(route = %self.name, server = %id, "Server reached its limits, closing");
                    self.close_discarded(vec![worn], "worn_out");
                }
            }
            ReleaseMode::Discard => {
                self.with_state(|s| s.discard(id));
                debug!(route = %self.name, server = %id, reason, "Discarding server");
                self.close_discarded(vec![conn], reason);
            }
        }
    }

    fn release_probed(&self, id: ServerId, conn: ServerConnection) {
        if let Some(conn) = self.with_state(|s| s.checkin_probed(id, conn, Instant::now())) {
            self.close_discarded(vec![conn], "worn_out");
        }
    }

    fn cancel_wait(&self, waiter: WaiterId, rx: &mut oneshot::Receiver<Grant<ServerConnection>>) {
        // A grant may already sit in the channel; it must go back to the pool
        let leftover = self.with_state(|s| {
            if s.cancel_waiter(waiter) {
                None
            } else {
                rx.close();
                rx.try_recv().ok()
            }
        });
        match leftover {
            Some(Grant::Server { id, conn }) => self.release(id, conn, ReleaseMode::Reuse, "cancelled"),
            Some(Grant::Connect { id }) => self.with_state(|s| s.abort_connect(id)),
            None => {}
        }
    }

    fn close_discarded(&self, conns: Vec<ServerConnection>, reason: &str) {
        for conn in conns {
            metrics().record_server_discard(&self.name, reason);
            close_server(conn);
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut PoolState<ServerConnection>) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        debug_assert!(state.check_invariants().is_ok(), "{:?}", state.check_invariants());
        result
    }
}

/// Send Terminate in the background when a runtime is available
fn close_server(conn: ServerConnection) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(conn.terminate());
    }
}

/// A reserved connecting slot; freed again unless disarmed
struct ConnectSlot {
    pool: Arc<ServerPool>,
    id: ServerId,
    armed: bool,
}

impl ConnectSlot {
    fn new(pool: Arc<ServerPool>, id: ServerId) -> Self {
        Self { pool, id, armed: true }
    }

    fn disarm(mut self) -> ServerId {
        self.armed = false;
        self.id
    }
}

impl Drop for ConnectSlot {
    fn drop(&mut self) {
        if self.armed {
            self.pool.with_state(|s| s.abort_connect(self.id));
        }
    }
}

/// A queued acquire; leaves the queue (or returns a raced grant) when dropped
struct WaitGuard {
    pool: Arc<ServerPool>,
    waiter: WaiterId,
    rx: oneshot::Receiver<Grant<ServerConnection>>,
    done: bool,
}

impl WaitGuard {
    fn new(pool: Arc<ServerPool>, waiter: WaiterId, rx: oneshot::Receiver<Grant<ServerConnection>>) -> Self {
        Self {
            pool,
            waiter,
            rx,
            done: false,
        }
    }

    /// None when the pool closed while waiting
    async fn recv(&mut self) -> Option<Grant<ServerConnection>> {
        let grant = (&mut self.rx).await.ok();
        self.done = true;
        grant
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if !self.done {
            self.pool.cancel_wait(self.waiter, &mut self.rx);
        }
    }
}

/// A server lent out of a pool
///
/// Dereferences to the [`ServerConnection`]. Dropping the guard without
/// calling [`PooledServer::release`] discards the server.
pub struct PooledServer {
    pool: Arc<ServerPool>,
    id: ServerId,
    holder: Holder,
    conn: Option<ServerConnection>,
}

impl PooledServer {
    fn new(pool: Arc<ServerPool>, id: ServerId, holder: Holder, conn: ServerConnection) -> Self {
        Self {
            pool,
            id,
            holder,
            conn: Some(conn),
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn holder(&self) -> Holder {
        self.holder
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    /// Hand the server back
    pub fn release(self, mode: ReleaseMode) {
        let reason = match mode {
            ReleaseMode::Reuse => "released",
            ReleaseMode::Discard => "unclean",
        };
        self.release_with_reason(mode, reason);
    }

    fn release_with_reason(mut self, mode: ReleaseMode, reason: &str) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(self.id, conn, mode, reason);
        }
    }

    fn release_probed(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release_probed(self.id, conn);
        }
    }
}

impl Deref for PooledServer {
    type Target = ServerConnection;

    fn deref(&self) -> &ServerConnection {
        self.conn.as_ref().expect("server connection is present until release")
    }
}

impl DerefMut for PooledServer {
    fn deref_mut(&mut self) -> &mut ServerConnection {
        self.conn.as_mut().expect("server connection is present until release")
    }
}

impl Drop for PooledServer {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(route = %self.pool.name, server = %self.id, "Server dropped without release, discarding");
            self.pool.release(self.id, conn, ReleaseMode::Discard, "dropped");
        }
    }
}
