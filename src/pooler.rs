//! Process-level wiring: builds the shared context, starts the listener,
//! maintainer and metrics endpoint, and tears them down in order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::auth::Authenticator;
use crate::client::ClientRegistry;
use crate::config::Config;
use crate::listener::{Listener, ListenerError};
use crate::metrics::start_metrics_server;
use crate::periodic::Maintainer;
use crate::route::RouteTable;

#[derive(Debug, Error)]
pub enum PoolerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// State shared by the listener, every router and the maintainer
pub struct PoolerContext {
    pub config: Config,
    pub routes: Arc<RouteTable>,
    pub clients: Arc<ClientRegistry>,
    pub auth: Arc<dyn Authenticator>,
}

impl PoolerContext {
    pub fn new(config: Config, auth: Arc<dyn Authenticator>) -> Self {
        let routes = Arc::new(RouteTable::new(&config.routes));
        Self {
            config,
            routes,
            clients: Arc::new(ClientRegistry::new()),
            auth,
        }
    }
}

pub struct Pooler;

impl Pooler {
    /// Route table first, then listener; the pooler is online once this returns
    pub async fn start(config: Config, auth: Arc<dyn Authenticator>) -> Result<PoolerHandle, PoolerError> {
        let ctx = Arc::new(PoolerContext::new(config, auth));
        let listener = Listener::bind(&ctx.config.listen).await?;
        let local_addr = listener.local_addr();

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let maintainer_token = CancellationToken::new();
        let maintainer = Maintainer::new(ctx.config.periodic.clone(), ctx.routes.clone())
            .spawn(maintainer_token.clone());

        let metrics_task = ctx.config.metrics.listen.clone().map(|addr| {
            tokio::spawn(async move {
                if let Err(e) = start_metrics_server(&addr).await {
                    error!(addr = %addr, error = %e, "Metrics server failed");
                }
            })
        });

        let accept_task = tokio::spawn(listener.run(ctx.clone(), tracker.clone(), shutdown.clone()));
        info!(addr = %local_addr, routes = ctx.config.routes.len(), "Pooler online");

        Ok(PoolerHandle {
            ctx,
            local_addr,
            shutdown,
            tracker,
            accept_task,
            maintainer_token,
            maintainer,
            metrics_task,
        })
    }
}

/// Running pooler
pub struct PoolerHandle {
    ctx: Arc<PoolerContext>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
    maintainer_token: CancellationToken,
    maintainer: JoinHandle<()>,
    metrics_task: Option<JoinHandle<()>>,
}

impl PoolerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<PoolerContext> {
        &self.ctx
    }

    /// Stop accepting, let clients drain for up to `grace`, force-close the
    /// rest, stop the maintainer, then close every pool.
    pub async fn shutdown(self, grace: Duration) {
        info!(grace = ?grace, "Shutting down");
        self.shutdown.cancel();
        if let Err(e) = self.accept_task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }

        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(clients = self.ctx.clients.count(), "Grace period elapsed, closing remaining clients");
            self.ctx.clients.close_all();
            self.tracker.wait().await;
        }

        self.maintainer_token.cancel();
        if let Err(e) = self.maintainer.await {
            warn!(error = %e, "Maintainer ended abnormally");
        }
        if let Some(task) = self.metrics_task {
            task.abort();
        }

        self.ctx.routes.close_all();
        info!("Shutdown complete");
    }
}
