//! Registry of live clients
//!
//! Membership only: used for admission counting, introspection and forced
//! shutdown. Never consulted on the proxy path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ClientHandle, ClientId};

/// Outcome of an admission attempt
pub enum Admission {
    Accepted(Registration),
    /// `client_max` reached; nothing was registered
    Rejected,
}

pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientHandle>>,
    count: AtomicUsize,
    next_id: AtomicU64,
    /// Parent of every client's cancellation token
    shutdown: CancellationToken,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            count: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a new client if fewer than `client_max` are live
    pub fn admit(self: &Arc<Self>, peer: SocketAddr, client_max: usize) -> Admission {
        let reserved = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < client_max).then_some(n + 1)
            });
        if reserved.is_err() {
            return Admission::Rejected;
        }

        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(ClientHandle::new(id, peer, self.shutdown.child_token()));
        self.clients.insert(id, handle.clone());
        debug!(client_id = %id, peer = %peer, "Client registered");

        Admission::Accepted(Registration {
            registry: self.clone(),
            handle,
        })
    }

    /// Number of live clients
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<ClientHandle>> {
        self.clients.get(&id).map(|r| r.value().clone())
    }

    /// Snapshot of all live clients
    pub fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.iter().map(|r| r.value().clone()).collect()
    }

    /// Force-close every live client
    pub fn close_all(&self) {
        self.shutdown.cancel();
    }

    fn remove(&self, id: ClientId) {
        if self.clients.remove(&id).is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
            debug!(client_id = %id, "Client unregistered");
        }
    }
}

/// Registry membership of one client; removed when dropped
pub struct Registration {
    registry: Arc<ClientRegistry>,
    handle: Arc<ClientHandle>,
}

impl Registration {
    pub fn handle(&self) -> &Arc<ClientHandle> {
        &self.handle
    }

    pub fn id(&self) -> ClientId {
        self.handle.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.handle.id);
    }
}
