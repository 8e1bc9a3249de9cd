mod registry;

pub use registry::{Admission, ClientRegistry, Registration};

use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Unique, monotonically increasing client identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Lifecycle of a client connection as seen by introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Authenticating,
    Routed,
    Proxying,
    Closing,
}

/// Shared view of one live client
///
/// The Router task owns the transport; this handle only carries what the
/// registry and shutdown need.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: ClientId,
    pub peer: SocketAddr,
    pub connected_at: Instant,
    state: Mutex<ClientState>,
    /// (user, database) negotiated at startup
    startup: OnceLock<(String, String)>,
    /// Cancelled to force-close this client
    cancel: CancellationToken,
}

impl ClientHandle {
    pub(crate) fn new(id: ClientId, peer: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            id,
            peer,
            connected_at: Instant::now(),
            state: Mutex::new(ClientState::Connecting),
            startup: OnceLock::new(),
            cancel,
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }

    /// Record the negotiated user and database (first call wins)
    pub fn set_startup(&self, user: &str, database: &str) {
        let _ = self.startup.set((user.to_string(), database.to_string()));
    }

    pub fn user(&self) -> Option<&str> {
        self.startup.get().map(|(u, _)| u.as_str())
    }

    pub fn database(&self) -> Option<&str> {
        self.startup.get().map(|(_, d)| d.as_str())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Force-close: the Router task ends at its next suspension point
    pub fn close(&self) {
        self.cancel.cancel();
    }
}
