use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Wildcard accepted in route `user` / `database`
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    /// Periodic maintainer configuration
    #[serde(default)]
    pub periodic: PeriodicConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Route rules, matched most specific first
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Config {
    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.client_max == 0 {
            return Err(ConfigError::Invalid("listen.client_max must be > 0".into()));
        }
        if self.periodic.interval_ms == 0 {
            return Err(ConfigError::Invalid("periodic.interval_ms must be > 0".into()));
        }
        if self.auth.mode == AuthMode::Password && self.auth.users.is_empty() {
            return Err(ConfigError::Invalid(
                "auth.mode = \"password\" requires at least one [[auth.users]] entry".into(),
            ));
        }
        if self.routes.is_empty() {
            return Err(ConfigError::Invalid("at least one [[routes]] entry is required".into()));
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            let name = format!("{}@{}", route.user, route.database);
            if !seen.insert((route.user.as_str(), route.database.as_str())) {
                return Err(ConfigError::Invalid(format!("duplicate route {}", name)));
            }
            if route.pool.max_size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "route {}: pool.max_size must be > 0",
                    name
                )));
            }
            if route.pool.min_size > route.pool.max_size {
                return Err(ConfigError::Invalid(format!(
                    "route {}: pool.min_size ({}) exceeds pool.max_size ({})",
                    name, route.pool.min_size, route.pool.max_size
                )));
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            periodic: PeriodicConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
            routes: vec![RouteConfig::default()],
        }
    }
}

// ============================================================================
// Listener Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
    /// Accept backlog passed to listen(2)
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum concurrent clients; further connections are closed on accept
    #[serde(default = "default_client_max")]
    pub client_max: usize,
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    /// TCP keepalive idle time in seconds (0 disables)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Time allowed for startup and authentication (milliseconds)
    #[serde(default = "default_login_timeout_ms")]
    pub login_timeout_ms: u64,
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    6432
}

fn default_backlog() -> u32 {
    128
}

fn default_client_max() -> usize {
    1000
}

fn default_nodelay() -> bool {
    true
}

fn default_keepalive_secs() -> u64 {
    7200
}

fn default_login_timeout_ms() -> u64 {
    10_000
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_listen_port(),
            backlog: default_backlog(),
            client_max: default_client_max(),
            nodelay: default_nodelay(),
            keepalive_secs: default_keepalive_secs(),
            login_timeout_ms: default_login_timeout_ms(),
        }
    }
}

impl ListenConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }
}

// ============================================================================
// Periodic Maintainer Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PeriodicConfig {
    /// Interval between sweeps (milliseconds)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Probe idle servers with an empty query
    #[serde(default)]
    pub health_check: bool,
    /// Timeout for each probe (milliseconds)
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_check_timeout_ms() -> u64 {
    3000
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            health_check: false,
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

// ============================================================================
// Metrics / Auth Configuration
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Address for the Prometheus endpoint, disabled when absent
    #[serde(default)]
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Trust,
    Password,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
}

// ============================================================================
// Route Configuration
// ============================================================================

/// One route rule: which clients it matches and where they go
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    #[serde(default = "default_wildcard")]
    pub user: String,
    #[serde(default = "default_wildcard")]
    pub database: String,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_wildcard() -> String {
    WILDCARD.to_string()
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            user: default_wildcard(),
            database: default_wildcard(),
            backend: BackendConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_host")]
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    /// Backend user; the client's user when absent
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Backend database; the client's database when absent
    #[serde(default)]
    pub database: Option<String>,
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    5432
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_backend_host(),
            port: default_backend_port(),
            user: None,
            password: None,
            database: None,
        }
    }
}

impl BackendConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// When a server goes back to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// Server stays with the client for the whole connection
    Session,
    /// Server returns to the pool after each transaction
    #[default]
    Transaction,
}

/// Which idle server acquire picks first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdleOrder {
    /// Most recently released first
    #[default]
    Lifo,
    /// Least recently released first
    Fifo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub mode: PoolMode,
    #[serde(default)]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Idle servers older than this are closed (0 disables)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Servers older than this are closed instead of reused (0 disables)
    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,
    /// Servers lent this many times are closed instead of reused (0 = unlimited)
    #[serde(default)]
    pub max_requests: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Longest wait for a saturated pool (0 waits indefinitely)
    #[serde(default)]
    pub acquire_timeout_ms: u64,
    /// Longest silence while a server is held (0 disables)
    #[serde(default)]
    pub proxy_idle_timeout_ms: u64,
    #[serde(default)]
    pub idle_order: IdleOrder,
    /// Query run before a session-mode server is reused, e.g. "DISCARD ALL"
    #[serde(default)]
    pub reset_query: Option<String>,
}

fn default_max_size() -> usize {
    20
}

fn default_idle_timeout_ms() -> u64 {
    600_000
}

fn default_max_lifetime_ms() -> u64 {
    3_600_000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mode: PoolMode::default(),
            min_size: 0,
            max_size: default_max_size(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_lifetime_ms: default_max_lifetime_ms(),
            max_requests: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            acquire_timeout_ms: 0,
            proxy_idle_timeout_ms: 0,
            idle_order: IdleOrder::default(),
            reset_query: None,
        }
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.idle_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        non_zero_ms(self.max_lifetime_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.acquire_timeout_ms)
    }

    pub fn proxy_idle_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.proxy_idle_timeout_ms)
    }
}
