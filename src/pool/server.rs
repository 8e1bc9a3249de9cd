use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

use crate::protocol::messages::{
    md5_password, parse_backend_key_data, parse_parameter_status, parse_ready_for_query,
    password_message, query, terminate,
};
use crate::protocol::{backend, AuthRequest, ErrorResponse, Message, MessageCodec, StartupMessage, TransactionStatus};

/// Where a route's servers connect, with client identity already resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl BackendTarget {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An authenticated connection to a backend server
pub struct ServerConnection {
    framed: Framed<TcpStream, MessageCodec>,
    /// ParameterStatus values reported during startup
    params: Vec<(String, String)>,
    /// BackendKeyData (process id, secret key)
    key_data: Option<(i32, i32)>,
    /// Status from the latest ReadyForQuery
    tx_status: TransactionStatus,
}

impl ServerConnection {
    /// Connect and log in; returns once the backend reports ReadyForQuery
    pub async fn connect(target: &BackendTarget) -> Result<Self, ConnectionError> {
        let addr = target.addr();
        debug!(addr = %addr, user = %target.user, database = %target.database, "Connecting to backend");

        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            error!(addr = %addr, error = %e, "Failed to connect to backend");
            ConnectionError::Connect(e.to_string())
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let mut framed = Framed::new(stream, MessageCodec::new());
        let startup = StartupMessage::new(&target.user, &target.database).encode();
        framed
            .send(&startup[..])
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let mut params = Vec::new();
        let mut key_data = None;

        loop {
            let msg = framed
                .next()
                .await
                .ok_or(ConnectionError::Disconnected)?
                .map_err(|e| ConnectionError::Io(e.to_string()))?;

            match msg.tag {
                backend::AUTHENTICATION => {
                    let request = AuthRequest::parse(&msg.payload)
                        .ok_or_else(|| ConnectionError::Protocol("Malformed authentication request".into()))?;
                    let reply = match request {
                        AuthRequest::Ok => continue,
                        AuthRequest::CleartextPassword => password_message(required_password(target)?),
                        AuthRequest::Md5Password { salt } => {
                            let hashed = md5_password(&target.user, required_password(target)?, salt);
                            password_message(&hashed)
                        }
                        AuthRequest::Sasl { mechanisms } => {
                            return Err(ConnectionError::Auth(format!(
                                "SASL authentication ({}) is not supported",
                                mechanisms.join(", ")
                            )));
                        }
                        AuthRequest::Other(code) => {
                            return Err(ConnectionError::Auth(format!(
                                "Unsupported authentication request {}",
                                code
                            )));
                        }
                    };
                    framed
                        .send(reply)
                        .await
                        .map_err(|e| ConnectionError::Io(e.to_string()))?;
                }
                backend::PARAMETER_STATUS => {
                    if let Some(param) = parse_parameter_status(&msg.payload) {
                        params.push(param);
                    }
                }
                backend::BACKEND_KEY_DATA => {
                    key_data = parse_backend_key_data(&msg.payload);
                }
                backend::NOTICE_RESPONSE => {}
                backend::ERROR_RESPONSE => {
                    let err = ErrorResponse::parse(&msg.payload)
                        .unwrap_or_else(|| ErrorResponse::fatal("XX000", "malformed error response"));
                    error!(addr = %addr, code = %err.code, message = %err.message, "Backend rejected login");
                    return Err(ConnectionError::Backend(err));
                }
                backend::READY_FOR_QUERY => {
                    let tx_status = parse_ready_for_query(&msg.payload).unwrap_or_default();
                    debug!(addr = %addr, params = params.len(), "Backend login complete");
                    return Ok(Self {
                        framed,
                        params,
                        key_data,
                        tx_status,
                    });
                }
                other => {
                    return Err(ConnectionError::Protocol(format!(
                        "Unexpected message '{}' during login",
                        other as char
                    )));
                }
            }
        }
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn key_data(&self) -> Option<(i32, i32)> {
        self.key_data
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// Send a message to the backend
    pub async fn send(&mut self, msg: Message) -> Result<(), ConnectionError> {
        self.framed
            .send(msg)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))
    }

    /// Receive a message from the backend, tracking transaction status
    pub async fn recv(&mut self) -> Result<Message, ConnectionError> {
        match self.framed.next().await {
            Some(Ok(msg)) => {
                if msg.tag == backend::READY_FOR_QUERY {
                    if let Some(status) = parse_ready_for_query(&msg.payload) {
                        self.tx_status = status;
                    }
                }
                Ok(msg)
            }
            Some(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            None => Err(ConnectionError::Disconnected),
        }
    }

    /// Liveness check: an empty query must come back with ReadyForQuery
    pub async fn probe(&mut self) -> Result<(), ConnectionError> {
        self.execute("").await
    }

    /// Run a reset statement (e.g. DISCARD ALL) before the server is reused
    pub async fn reset(&mut self, sql: &str) -> Result<(), ConnectionError> {
        self.execute(sql).await?;
        if self.tx_status != TransactionStatus::Idle {
            return Err(ConnectionError::Protocol(format!(
                "Server not idle after reset ({:?})",
                self.tx_status
            )));
        }
        Ok(())
    }

    /// Simple query, draining every response up to ReadyForQuery
    async fn execute(&mut self, sql: &str) -> Result<(), ConnectionError> {
        self.send(query(sql)).await?;
        let mut failure = None;
        loop {
            let msg = self.recv().await?;
            match msg.tag {
                backend::ERROR_RESPONSE => {
                    failure = ErrorResponse::parse(&msg.payload);
                }
                backend::READY_FOR_QUERY => break,
                _ => {}
            }
        }
        match failure {
            Some(err) => Err(ConnectionError::Backend(err)),
            None => Ok(()),
        }
    }

    /// Polite close: send Terminate, ignoring failures
    pub async fn terminate(mut self) {
        if let Err(e) = self.send(terminate()).await {
            warn!(error = %e, "Failed to send Terminate to backend");
        }
    }
}

fn required_password(target: &BackendTarget) -> Result<&str, ConnectionError> {
    target
        .password
        .as_deref()
        .ok_or_else(|| ConnectionError::Auth("Backend requested a password but none is configured".into()))
}

/// Backend connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Backend error: {0}")]
    Backend(ErrorResponse),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection disconnected")]
    Disconnected,
}
