//! Per-client protocol: startup, authentication, route resolution, server
//! attach and relay. One [`Router`] runs per accepted client.

mod relay;
mod state;

pub use state::RouterState;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::auth::{AuthDecision, Credentials};
use crate::client::{ClientId, Registration};
use crate::config::PoolMode;
use crate::metrics::metrics;
use crate::pool::{ConnectionError, PoolError, PooledServer, ReleaseMode};
use crate::pooler::PoolerContext;
use crate::protocol::messages::{
    authentication_cleartext_password, authentication_ok, backend_key_data, parameter_status,
    parse_password_message, ready_for_query,
};
use crate::protocol::{
    frontend, sqlstate, ErrorResponse, Message, MessageCodec, StartupCodec, StartupError, StartupMessage,
    StartupRequest, TransactionStatus,
};
use crate::route::{Route, RouteError};

use relay::{acquire_server, Relay};

/// Router errors
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Client IO error: {0}")]
    Client(#[from] std::io::Error),

    #[error("Server error: {0}")]
    Server(#[from] ConnectionError),

    #[error("Invalid startup: {0}")]
    Startup(#[from] StartupError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Login not completed within {0:?}")]
    LoginTimeout(Duration),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("No traffic for {0:?} while holding a server")]
    IdleTimeout(Duration),

    #[error("Client closed by shutdown")]
    Shutdown,
}

/// ErrorResponse sent to a client whose acquire failed
pub(crate) fn pool_error_response(err: &PoolError) -> ErrorResponse {
    match err {
        PoolError::ServerConnectFailed(e) => ErrorResponse::fatal(
            sqlstate::CONNECTION_FAILURE,
            format!("server connection failed: {}", e),
        ),
        PoolError::AcquireTimeout(_) => ErrorResponse::fatal(
            sqlstate::TOO_MANY_CONNECTIONS,
            "timed out waiting for a server connection",
        ),
        PoolError::Closed => ErrorResponse::fatal(sqlstate::ADMIN_SHUTDOWN, "pooler is shutting down"),
    }
}

/// Drives one client from startup to close
pub struct Router {
    ctx: Arc<PoolerContext>,
    registration: Registration,
    state: RouterState,
}

impl Router {
    pub fn new(ctx: Arc<PoolerContext>, registration: Registration) -> Self {
        Self {
            ctx,
            registration,
            state: RouterState::Connecting,
        }
    }

    pub fn id(&self) -> ClientId {
        self.registration.id()
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    /// Serve the client until it leaves, fails, or is force-closed
    pub async fn run<S>(mut self, stream: S) -> Result<(), RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let cancel = self.registration.handle().cancel_token().clone();
        let result = tokio::select! {
            result = self.serve(stream) => result,
            _ = cancel.cancelled() => Err(RouterError::Shutdown),
        };

        match &result {
            Ok(()) => {
                self.transition(RouterState::Closed);
                info!(client_id = %self.id(), "Client closed");
            }
            Err(e) => {
                self.transition(RouterState::Error);
                self.transition(RouterState::Closed);
                warn!(client_id = %self.id(), error = %e, "Client closed with error");
            }
        }
        metrics().record_client_closed();
        result
    }

    async fn serve<S>(&mut self, stream: S) -> Result<(), RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let login_timeout = self.ctx.config.listen.login_timeout();
        let login_deadline = Instant::now() + login_timeout;
        let mut startup = Framed::new(stream, StartupCodec);

        let message = match tokio::time::timeout_at(login_deadline, read_startup(&mut startup)).await {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => {
                self.transition(RouterState::Closed);
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(RouterError::LoginTimeout(login_timeout)),
        };

        let user = message.user().to_string();
        let database = message.database().to_string();
        self.registration.handle().set_startup(&user, &database);
        debug!(client_id = %self.id(), user = %user, database = %database, "Startup received");

        let mut login = startup.map_codec(|_| MessageCodec::login());

        self.transition(RouterState::Authenticating);
        let authenticated = tokio::time::timeout_at(
            login_deadline,
            self.authenticate(&mut login, &user, &database),
        )
        .await;
        match authenticated {
            Ok(Ok(())) => {}
            Ok(Err(RouterError::AuthFailed(reason))) => {
                info!(client_id = %self.id(), user = %user, reason = %reason, "Authentication rejected");
                self.transition(RouterState::Closed);
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(RouterError::LoginTimeout(login_timeout)),
        }
        let mut client = login.map_codec(|_| MessageCodec::new());

        let route = match self.ctx.routes.resolve(&user, &database) {
            Ok(route) => route,
            Err(e) => {
                warn!(client_id = %self.id(), error = %e, "Route not found");
                let refusal = ErrorResponse::fatal(sqlstate::INVALID_CATALOG_NAME, e.to_string());
                let _ = client.send(refusal.encode()).await;
                return Err(e.into());
            }
        };
        self.transition(RouterState::RouteResolved);

        let mut pending = VecDeque::new();
        let server = match self.attach(&mut client, &route, &mut pending).await? {
            Some(server) => server,
            None => return Ok(()),
        };
        self.transition(RouterState::ServerAcquired);

        self.greet(&mut client, &route, server.as_ref()).await?;
        info!(
            client_id = %self.id(),
            user = %user,
            database = %database,
            route = %route.key,
            mode = ?route.pool.mode(),
            "Client authenticated"
        );

        self.transition(RouterState::Proxying);
        let mut relay = Relay::new(&mut client, &route, self.id(), server);
        relay.extend_pending(pending);
        relay.run().await?;

        self.transition(RouterState::Released);
        Ok(())
    }

    async fn authenticate<S>(
        &self,
        client: &mut Framed<S, MessageCodec>,
        user: &str,
        database: &str,
    ) -> Result<(), RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let auth = &self.ctx.auth;
        let mut credentials = Credentials::default();

        if auth.needs_password() {
            client.send(authentication_cleartext_password()).await?;
            let msg = client
                .next()
                .await
                .ok_or_else(|| RouterError::Protocol("client disconnected during authentication".into()))??;
            if msg.tag != frontend::PASSWORD {
                return Err(RouterError::Protocol(format!(
                    "expected password message, got '{}'",
                    msg.tag as char
                )));
            }
            credentials.password = parse_password_message(&msg.payload);
        }

        match auth.authenticate(user, database, &credentials) {
            AuthDecision::Accept => Ok(()),
            AuthDecision::Reject(reason) => {
                let refusal = ErrorResponse::fatal(sqlstate::INVALID_PASSWORD, reason.clone());
                let _ = client.send(refusal.encode()).await;
                Err(RouterError::AuthFailed(reason))
            }
        }
    }

    /// Session mode keeps a server for the whole connection. Transaction mode
    /// only borrows one when the route has no cached startup parameters yet.
    /// None means the client left while waiting.
    async fn attach<S>(
        &self,
        client: &mut Framed<S, MessageCodec>,
        route: &Arc<Route>,
        pending: &mut VecDeque<Message>,
    ) -> Result<Option<Option<PooledServer>>, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let needs_server =
            route.pool.mode() == PoolMode::Session || route.pool.startup_params().is_none();
        if !needs_server {
            return Ok(Some(None));
        }

        let Some(server) = acquire_server(client, route, self.id(), pending).await? else {
            return Ok(None);
        };
        if route.pool.mode() == PoolMode::Session {
            return Ok(Some(Some(server)));
        }
        server.release(ReleaseMode::Reuse);
        Ok(Some(None))
    }

    /// AuthenticationOk, ParameterStatus set, BackendKeyData, ReadyForQuery
    async fn greet<S>(
        &self,
        client: &mut Framed<S, MessageCodec>,
        route: &Arc<Route>,
        server: Option<&PooledServer>,
    ) -> Result<(), RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        client.feed(authentication_ok()).await?;

        let params = match server {
            Some(server) => server.params().to_vec(),
            None => route
                .pool
                .startup_params()
                .map(|p| p.as_ref().clone())
                .unwrap_or_default(),
        };
        for (name, value) in &params {
            client.feed(parameter_status(name, value)).await?;
        }

        client
            .feed(backend_key_data(rand::random::<i32>(), rand::random::<i32>()))
            .await?;
        client.send(ready_for_query(TransactionStatus::Idle)).await?;
        Ok(())
    }

    fn transition(&mut self, next: RouterState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid router transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(client_id = %self.id(), from = ?self.state, to = ?next, "Router state");
        self.state = next;
        self.registration.handle().set_state(next.client_state());
    }
}

/// Read the startup packet, answering SSL/GSS negotiation with 'N'.
/// Returns None for a cancel request.
async fn read_startup<S>(framed: &mut Framed<S, StartupCodec>) -> Result<Option<StartupMessage>, RouterError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let body = framed
            .next()
            .await
            .ok_or_else(|| RouterError::Protocol("client disconnected before startup".into()))??;

        let request = match StartupRequest::parse(&body) {
            Ok(request) => request,
            Err(e) => {
                let code = match e {
                    StartupError::UnsupportedVersion { .. } => sqlstate::FEATURE_NOT_SUPPORTED,
                    _ => sqlstate::PROTOCOL_VIOLATION,
                };
                let mut buf = BytesMut::new();
                ErrorResponse::fatal(code, e.to_string()).encode().encode(&mut buf);
                let _ = framed.send(&buf[..]).await;
                return Err(e.into());
            }
        };

        match request {
            StartupRequest::Startup(message) => return Ok(Some(message)),
            StartupRequest::SslRequest | StartupRequest::GssEncRequest => {
                debug!("Declining transport encryption");
                framed.send(&b"N"[..]).await?;
            }
            StartupRequest::Cancel { process_id, .. } => {
                debug!(process_id, "Cancel request ignored");
                return Ok(None);
            }
        }
    }
}
