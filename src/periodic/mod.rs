//! Periodic pool maintenance
//!
//! One background task ticks on a fixed interval. Each tick first evicts
//! expired idle servers on every route, which never waits on a backend, and
//! then hands health checks and prefill to one task per route. A route whose
//! task from an earlier tick is still running is skipped, so a backend that
//! hangs until its connect timeout only delays its own route. Routes created
//! mid-sweep are picked up on the next tick.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::PeriodicConfig;
use crate::metrics::metrics;
use crate::route::{Route, RouteKey, RouteTable};

/// Per-route outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub probed_ok: usize,
    pub probed_failed: usize,
    pub created: usize,
}

pub struct Maintainer {
    config: PeriodicConfig,
    routes: Arc<RouteTable>,
    tasks: TaskTracker,
    /// Routes with a replenish task running
    busy: Arc<DashSet<RouteKey>>,
    cancel: CancellationToken,
}

impl Maintainer {
    pub fn new(config: PeriodicConfig, routes: Arc<RouteTable>) -> Self {
        Self {
            config,
            routes,
            tasks: TaskTracker::new(),
            busy: Arc::new(DashSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    /// Run until `shutdown` fires, then stop every route task
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_ms = self.config.interval_ms, health_check = self.config.health_check, "Maintainer started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }

            self.stop().await;
            info!("Maintainer stopped");
        })
    }

    /// Evict on every route, then start a replenish task for each route that
    /// has none running. Returns the number of tasks started.
    pub fn sweep(&self) -> usize {
        let routes: Vec<_> = self
            .routes
            .snapshot()
            .into_iter()
            .filter(|route| !route.pool.is_closed())
            .map(|route| {
                let evicted = route.pool.evict_expired();
                (route, evicted)
            })
            .collect();

        let mut started = 0;
        for (route, evicted) in routes {
            if let Some(task) = self.replenish(route, evicted) {
                self.tasks.spawn(task);
                started += 1;
            }
        }
        started
    }

    /// Cancel running route tasks and wait for them to finish
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Number of routes with a replenish task running
    pub fn busy_routes(&self) -> usize {
        self.busy.len()
    }

    fn replenish(&self, route: Arc<Route>, evicted: usize) -> Option<impl std::future::Future<Output = ()>> {
        let guard = BusyGuard::claim(&self.busy, &route.key)?;
        let cancel = self.cancel.child_token();
        let health_check = self.config.health_check;
        let min_idle = self.interval();
        let check_timeout = Duration::from_millis(self.config.check_timeout_ms);

        Some(async move {
            let _guard = guard;
            let pool = &route.pool;
            let mut report = SweepReport {
                evicted,
                ..SweepReport::default()
            };

            let finished = tokio::select! {
                _ = cancel.cancelled() => false,
                _ = async {
                    if health_check {
                        let (ok, failed) = pool.probe_idle(min_idle, check_timeout).await;
                        report.probed_ok = ok;
                        report.probed_failed = failed;
                    }
                    report.created = pool.prefill().await;
                } => true,
            };
            if !finished {
                debug!(route = %route.key, "Pool sweep cancelled");
                return;
            }

            let stats = pool.stats();
            metrics().set_pool_stats(pool.name(), &stats);
            debug!(
                route = %route.key,
                idle = stats.idle,
                active = stats.active,
                connecting = stats.connecting,
                waiting = stats.waiting,
                evicted = report.evicted,
                probed_ok = report.probed_ok,
                probed_failed = report.probed_failed,
                created = report.created,
                "Pool sweep"
            );
        })
    }
}

/// Marks a route busy until dropped
struct BusyGuard {
    busy: Arc<DashSet<RouteKey>>,
    key: RouteKey,
}

impl BusyGuard {
    fn claim(busy: &Arc<DashSet<RouteKey>>, key: &RouteKey) -> Option<Self> {
        if !busy.insert(key.clone()) {
            return None;
        }
        Some(Self {
            busy: busy.clone(),
            key: key.clone(),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.remove(&self.key);
    }
}
