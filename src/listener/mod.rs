//! Listen socket, accept loop and global admission control

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::client::Admission;
use crate::config::ListenConfig;
use crate::metrics::metrics;
use crate::pooler::PoolerContext;
use crate::router::Router;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to resolve listen address {addr}: {reason}")]
    Resolve { addr: String, reason: String },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Resolve and bind the listen address. Failure here is fatal to startup.
    pub async fn bind(config: &ListenConfig) -> Result<Self, ListenerError> {
        let addr_str = config.addr();
        let addr = lookup_host(&addr_str)
            .await
            .map_err(|e| ListenerError::Resolve {
                addr: addr_str.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| ListenerError::Resolve {
                addr: addr_str.clone(),
                reason: "no addresses".into(),
            })?;

        let bind = |addr: SocketAddr| -> std::io::Result<TcpListener> {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            socket.bind(addr)?;
            socket.listen(config.backlog)
        };
        let listener = bind(addr).map_err(|source| ListenerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?;

        info!(addr = %local_addr, backlog = config.backlog, "Listening");
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept clients until `shutdown` fires. Each admitted client gets its
    /// own Router task, tracked by `tracker`.
    pub async fn run(self, ctx: Arc<PoolerContext>, tracker: TaskTracker, shutdown: CancellationToken) {
        let listen = &ctx.config.listen;
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(addr = %self.local_addr, "Listener stopped");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let registration = match ctx.clients.admit(peer, listen.client_max) {
                Admission::Accepted(registration) => registration,
                Admission::Rejected => {
                    warn!(peer = %peer, client_max = listen.client_max, "Client limit reached, closing connection");
                    metrics().record_client_rejected();
                    drop(stream);
                    continue;
                }
            };

            if let Err(e) = configure_stream(&stream, listen) {
                warn!(peer = %peer, error = %e, "Failed to set socket options");
            }

            let client_id = registration.id();
            info!(client_id = %client_id, peer = %peer, "New connection");
            metrics().record_client_accepted();

            let router = Router::new(ctx.clone(), registration);
            tracker.spawn(async move {
                if let Err(e) = router.run(stream).await {
                    debug!(client_id = %client_id, error = %e, "Router finished with error");
                }
            });
        }
    }
}

/// TCP_NODELAY and keepalive on an accepted client socket
fn configure_stream(stream: &TcpStream, config: &ListenConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.nodelay)?;
    if config.keepalive_secs > 0 {
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(config.keepalive_secs));
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}
