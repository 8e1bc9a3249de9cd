use crate::client::ClientState;

/// Per-client protocol state
///
/// ```text
/// Connecting -> Authenticating -> RouteResolved -> ServerAcquired -> Proxying -> Released -> Closed
/// ```
/// `Error` is reachable from every state before `Closed`. Login may also end
/// in `Closed` directly (cancel request, rejected credentials, client gone
/// while waiting for a server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Connecting,
    Authenticating,
    RouteResolved,
    /// Session mode: server attached. Transaction mode: pool reachable,
    /// servers are attached per transaction while proxying.
    ServerAcquired,
    Proxying,
    Released,
    Closed,
    Error,
}

impl RouterState {
    pub fn can_transition_to(self, next: RouterState) -> bool {
        use RouterState::*;
        match (self, next) {
            (Closed, _) => false,
            (Error, Closed) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Connecting, Authenticating)
            | (Connecting, Closed)
            | (Authenticating, RouteResolved)
            | (Authenticating, Closed)
            | (RouteResolved, Closed)
            | (RouteResolved, ServerAcquired)
            | (ServerAcquired, Proxying)
            | (Proxying, Released)
            | (Released, Closed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == RouterState::Closed
    }

    /// Coarse state published on the client's registry handle
    pub fn client_state(self) -> ClientState {
        match self {
            RouterState::Connecting => ClientState::Connecting,
            RouterState::Authenticating => ClientState::Authenticating,
            RouterState::RouteResolved | RouterState::ServerAcquired => ClientState::Routed,
            RouterState::Proxying => ClientState::Proxying,
            RouterState::Released | RouterState::Closed | RouterState::Error => ClientState::Closing,
        }
    }
}
