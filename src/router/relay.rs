use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::client::ClientId;
use crate::config::PoolMode;
use crate::metrics::metrics;
use crate::pool::{ConnectionError, PooledServer, ReleaseMode};
use crate::protocol::packet::MESSAGE_HEADER_SIZE;
use crate::protocol::{backend, frontend, sqlstate, ErrorResponse, Message, MessageCodec, TransactionStatus};
use crate::route::Route;

use super::{pool_error_response, RouterError};

enum Event {
    Client(Option<io::Result<Message>>),
    Server(Result<Message, ConnectionError>),
    IdleTimeout(Duration),
}

/// Message relay between one client and its route's servers
pub(super) struct Relay<'a, S> {
    client: &'a mut Framed<S, MessageCodec>,
    route: &'a Arc<Route>,
    client_id: ClientId,
    server: Option<PooledServer>,
    /// Client requests (Query, Sync, FunctionCall) not yet answered by ReadyForQuery
    in_flight: usize,
    /// Client messages read while waiting for a server
    pending: VecDeque<Message>,
}

impl<'a, S> Relay<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(super) fn new(
        client: &'a mut Framed<S, MessageCodec>,
        route: &'a Arc<Route>,
        client_id: ClientId,
        server: Option<PooledServer>,
    ) -> Self {
        Self {
            client,
            route,
            client_id,
            server,
            in_flight: 0,
            pending: VecDeque::new(),
        }
    }

    pub(super) fn extend_pending(&mut self, msgs: VecDeque<Message>) {
        self.pending.extend(msgs);
    }

    /// Relay until the client leaves. A held server goes back to the pool
    /// only after a clean end; any error drops (discards) it.
    pub(super) async fn run(mut self) -> Result<(), RouterError> {
        self.pump().await?;
        self.finish().await;
        Ok(())
    }

    async fn pump(&mut self) -> Result<(), RouterError> {
        loop {
            let event = match self.pending.pop_front() {
                Some(msg) => Event::Client(Some(Ok(msg))),
                None => self.next_event().await,
            };

            match event {
                Event::Client(None) => {
                    debug!(client_id = %self.client_id, "Client disconnected");
                    return Ok(());
                }
                Event::Client(Some(Err(e))) => return Err(RouterError::Client(e)),
                Event::Client(Some(Ok(msg))) => {
                    if msg.tag == frontend::TERMINATE {
                        debug!(client_id = %self.client_id, "Client sent Terminate");
                        return Ok(());
                    }
                    if !self.forward_to_server(msg).await? {
                        return Ok(());
                    }
                }
                Event::Server(Ok(msg)) => self.forward_to_client(msg).await?,
                Event::Server(Err(e)) => {
                    warn!(client_id = %self.client_id, route = %self.route.key, error = %e, "Server connection lost");
                    let notice = ErrorResponse::fatal(sqlstate::CONNECTION_FAILURE, "server connection lost");
                    let _ = self.client.send(notice.encode()).await;
                    return Err(RouterError::Server(e));
                }
                Event::IdleTimeout(limit) => {
                    warn!(client_id = %self.client_id, route = %self.route.key, timeout = ?limit, "Proxy idle timeout");
                    let notice = ErrorResponse::fatal(
                        sqlstate::IDLE_SESSION_TIMEOUT,
                        "terminating connection due to idle timeout",
                    );
                    let _ = self.client.send(notice.encode()).await;
                    return Err(RouterError::IdleTimeout(limit));
                }
            }
        }
    }

    async fn next_event(&mut self) -> Event {
        let Some(server) = self.server.as_mut() else {
            return Event::Client(self.client.next().await);
        };
        let limit = self.route.pool.config().proxy_idle_timeout();

        tokio::select! {
            msg = self.client.next() => Event::Client(msg),
            msg = server.recv() => Event::Server(msg),
            _ = idle_deadline(limit) => Event::IdleTimeout(limit.unwrap_or_default()),
        }
    }

    /// Returns false when the client left while waiting for a server
    async fn forward_to_server(&mut self, msg: Message) -> Result<bool, RouterError> {
        if self.server.is_none() {
            match acquire_server(self.client, self.route, self.client_id, &mut self.pending).await? {
                Some(server) => self.server = Some(server),
                None => return Ok(false),
            }
        }
        let Some(server) = self.server.as_mut() else {
            return Ok(false);
        };

        if matches!(msg.tag, frontend::QUERY | frontend::SYNC | frontend::FUNCTION_CALL) {
            self.in_flight += 1;
        }
        server.send(msg).await?;
        Ok(true)
    }

    async fn forward_to_client(&mut self, msg: Message) -> Result<(), RouterError> {
        let boundary = msg.tag == backend::READY_FOR_QUERY;
        if boundary {
            self.in_flight = self.in_flight.saturating_sub(1);
        }

        if msg.tag == backend::DATA_ROW {
            self.client.feed(msg).await?;
        } else {
            self.client.send(msg).await?;
        }

        if boundary && self.in_flight == 0 && self.route.pool.mode() == PoolMode::Transaction {
            if let Some(server) = self.server.take() {
                if server.transaction_status() == TransactionStatus::Idle {
                    debug!(client_id = %self.client_id, server = %server.id(), "Transaction finished, releasing server");
                    metrics().record_transaction(self.route.pool.name());
                    server.release(ReleaseMode::Reuse);
                } else {
                    self.server = Some(server);
                }
            }
        }
        Ok(())
    }

    /// Hand the server back after the client ended cleanly
    async fn finish(&mut self) {
        let Some(mut server) = self.server.take() else {
            return;
        };

        if self.in_flight > 0 || server.transaction_status() != TransactionStatus::Idle {
            debug!(
                client_id = %self.client_id,
                server = %server.id(),
                in_flight = self.in_flight,
                status = ?server.transaction_status(),
                "Client left mid-transaction, discarding server"
            );
            server.release(ReleaseMode::Discard);
            return;
        }

        let pool = self.route.pool.clone();
        if pool.mode() == PoolMode::Session {
            if let Some(sql) = pool.config().reset_query.as_deref() {
                let limit = pool.config().connect_timeout();
                match tokio::time::timeout(limit, server.reset(sql)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(server = %server.id(), error = %e, "Reset query failed, discarding server");
                        server.release(ReleaseMode::Discard);
                        return;
                    }
                    Err(_) => {
                        warn!(server = %server.id(), timeout = ?limit, "Reset query timed out, discarding server");
                        server.release(ReleaseMode::Discard);
                        return;
                    }
                }
            }
        }
        server.release(ReleaseMode::Reuse);
    }
}

/// Client bytes queued while waiting for a server before reads pause
pub(super) const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Acquire a server while still watching the client: messages that arrive
/// meanwhile are queued, and a client that disconnects abandons the wait.
/// Past [`MAX_PENDING_BYTES`] the client is no longer read, so TCP flow
/// control holds it back until a server is granted or the acquire fails.
pub(super) async fn acquire_server<S>(
    client: &mut Framed<S, MessageCodec>,
    route: &Arc<Route>,
    client_id: ClientId,
    pending: &mut VecDeque<Message>,
) -> Result<Option<PooledServer>, RouterError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let acquire = route.pool.acquire(client_id);
    tokio::pin!(acquire);
    let mut queued: usize = pending.iter().map(wire_len).sum();

    loop {
        tokio::select! {
            result = &mut acquire => {
                return match result {
                    Ok(server) => Ok(Some(server)),
                    Err(e) => {
                        warn!(client_id = %client_id, route = %route.key, error = %e, "Failed to acquire server");
                        let _ = client.send(pool_error_response(&e).encode()).await;
                        Err(RouterError::Pool(e))
                    }
                };
            }
            msg = client.next(), if queued < MAX_PENDING_BYTES => match msg {
                Some(Ok(msg)) => {
                    queued += wire_len(&msg);
                    if queued >= MAX_PENDING_BYTES {
                        debug!(client_id = %client_id, queued, "Pausing client reads until a server is granted");
                    }
                    pending.push_back(msg);
                }
                Some(Err(e)) => return Err(RouterError::Client(e)),
                None => {
                    debug!(client_id = %client_id, "Client disconnected while waiting for a server");
                    return Ok(None);
                }
            },
        }
    }
}

fn wire_len(msg: &Message) -> usize {
    MESSAGE_HEADER_SIZE + msg.payload.len()
}

async fn idle_deadline(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}
