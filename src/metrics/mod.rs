//! Prometheus metrics for the pooler
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::OnceLock;

use crate::pool::PoolStats;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Pooler metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Client metrics
    /// Total client connections admitted
    pub clients_accepted: IntCounter,
    /// Client connections closed on accept because client_max was reached
    pub clients_rejected: IntCounter,
    /// Current live clients
    pub clients_active: IntGauge,
    /// Total client connections closed
    pub clients_closed: IntCounter,

    // Server metrics
    /// Backend connect attempts by result
    pub server_connects_total: IntCounterVec,
    /// Servers closed instead of returned to idle, by reason
    pub server_discards_total: IntCounterVec,

    // Pool metrics
    /// Acquires by the path that satisfied them (idle, connect, wait)
    pub pool_acquires_total: IntCounterVec,
    /// Acquires that gave up waiting
    pub pool_acquire_timeouts_total: IntCounterVec,
    /// Time from acquire request to server in hand (seconds)
    pub pool_acquire_duration_seconds: HistogramVec,
    /// Servers per partition
    pub pool_servers: IntGaugeVec,
    /// Queued acquirers
    pub pool_waiters: IntGaugeVec,
    /// Transactions completed in transaction mode
    pub transactions_total: IntCounterVec,

    // Maintainer metrics
    /// Idle-server probe results
    pub health_check_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        // Client metrics
        let clients_accepted = IntCounter::new(
            "sluice_clients_accepted_total",
            "Total number of client connections admitted",
        )
        .unwrap();

        let clients_rejected = IntCounter::new(
            "sluice_clients_rejected_total",
            "Total number of client connections rejected at client_max",
        )
        .unwrap();

        let clients_active = IntGauge::new(
            "sluice_clients_active",
            "Current number of live client connections",
        )
        .unwrap();

        let clients_closed = IntCounter::new(
            "sluice_clients_closed_total",
            "Total number of client connections closed",
        )
        .unwrap();

        // Server metrics
        let server_connects_total = IntCounterVec::new(
            Opts::new(
                "sluice_server_connects_total",
                "Total number of backend connect attempts",
            ),
            &["route", "result"], // ok, error, timeout
        )
        .unwrap();

        let server_discards_total = IntCounterVec::new(
            Opts::new(
                "sluice_server_discards_total",
                "Total number of servers closed instead of reused",
            ),
            &["route", "reason"], // expired, unclean, failed_probe, worn_out
        )
        .unwrap();

        // Pool metrics
        let pool_acquires_total = IntCounterVec::new(
            Opts::new("sluice_pool_acquires_total", "Total number of server acquires"),
            &["route", "path"], // idle, connect, wait
        )
        .unwrap();

        let pool_acquire_timeouts_total = IntCounterVec::new(
            Opts::new(
                "sluice_pool_acquire_timeouts_total",
                "Total number of acquires that timed out waiting",
            ),
            &["route"],
        )
        .unwrap();

        let pool_acquire_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "sluice_pool_acquire_duration_seconds",
                "Time to obtain a server in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                10.0,
            ]),
            &["route"],
        )
        .unwrap();

        let pool_servers = IntGaugeVec::new(
            Opts::new("sluice_pool_servers", "Current number of servers by partition"),
            &["route", "partition"], // idle, active, connecting
        )
        .unwrap();

        let pool_waiters = IntGaugeVec::new(
            Opts::new("sluice_pool_waiters", "Current number of queued acquirers"),
            &["route"],
        )
        .unwrap();

        let transactions_total = IntCounterVec::new(
            Opts::new(
                "sluice_transactions_total",
                "Total number of transactions completed in transaction mode",
            ),
            &["route"],
        )
        .unwrap();

        // Maintainer metrics
        let health_check_total = IntCounterVec::new(
            Opts::new(
                "sluice_health_check_total",
                "Total number of idle server probes by result",
            ),
            &["route", "result"], // success, failure
        )
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(clients_accepted.clone()))
            .unwrap();
        registry
            .register(Box::new(clients_rejected.clone()))
            .unwrap();
        registry
            .register(Box::new(clients_active.clone()))
            .unwrap();
        registry
            .register(Box::new(clients_closed.clone()))
            .unwrap();
        registry
            .register(Box::new(server_connects_total.clone()))
            .unwrap();
        registry
            .register(Box::new(server_discards_total.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_acquires_total.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_acquire_timeouts_total.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_acquire_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_servers.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_waiters.clone()))
            .unwrap();
        registry
            .register(Box::new(transactions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(health_check_total.clone()))
            .unwrap();

        Self {
            registry,
            clients_accepted,
            clients_rejected,
            clients_active,
            clients_closed,
            server_connects_total,
            server_discards_total,
            pool_acquires_total,
            pool_acquire_timeouts_total,
            pool_acquire_duration_seconds,
            pool_servers,
            pool_waiters,
            transactions_total,
            health_check_total,
        }
    }

    /// Record an admitted client
    pub fn record_client_accepted(&self) {
        self.clients_accepted.inc();
        self.clients_active.inc();
    }

    /// Record a client turned away at client_max
    pub fn record_client_rejected(&self) {
        self.clients_rejected.inc();
    }

    /// Record a client closed
    pub fn record_client_closed(&self) {
        self.clients_active.dec();
        self.clients_closed.inc();
    }

    /// Record a backend connect attempt
    pub fn record_server_connect(&self, route: &str, result: &str) {
        self.server_connects_total
            .with_label_values(&[route, result])
            .inc();
    }

    /// Record a server closed instead of reused
    pub fn record_server_discard(&self, route: &str, reason: &str) {
        self.server_discards_total
            .with_label_values(&[route, reason])
            .inc();
    }

    /// Record a completed acquire
    pub fn record_acquire(&self, route: &str, path: &str, duration_secs: f64) {
        self.pool_acquires_total
            .with_label_values(&[route, path])
            .inc();
        self.pool_acquire_duration_seconds
            .with_label_values(&[route])
            .observe(duration_secs);
    }

    /// Record an acquire that timed out
    pub fn record_acquire_timeout(&self, route: &str) {
        self.pool_acquire_timeouts_total
            .with_label_values(&[route])
            .inc();
    }

    /// Record a transaction boundary in transaction mode
    pub fn record_transaction(&self, route: &str) {
        self.transactions_total.with_label_values(&[route]).inc();
    }

    /// Record an idle server probe result
    pub fn record_health_check(&self, route: &str, result: &str) {
        self.health_check_total
            .with_label_values(&[route, result])
            .inc();
    }

    /// Publish a pool's partition sizes
    pub fn set_pool_stats(&self, route: &str, stats: &PoolStats) {
        self.pool_servers
            .with_label_values(&[route, "idle"])
            .set(stats.idle as i64);
        self.pool_servers
            .with_label_values(&[route, "active"])
            .set(stats.active as i64);
        self.pool_servers
            .with_label_values(&[route, "connecting"])
            .set(stats.connecting as i64);
        self.pool_waiters
            .with_label_values(&[route])
            .set(stats.waiting as i64);
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let (status, content_type, body) = match req.uri().path() {
            "/metrics" => (
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                metrics().gather(),
            ),
            "/health" => (StatusCode::OK, "text/plain", "OK".to_string()),
            _ => (StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
        };
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static(content_type),
        );
        Ok(response)
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
