mod table;

pub use table::RouteTable;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::config::RouteConfig;
use crate::pool::{BackendTarget, ServerPool};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no route for user \"{user}\" to database \"{database}\"")]
    NotFound { user: String, database: String },
}

/// Route identity: the client's (user, database)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub user: String,
    pub database: String,
}

impl RouteKey {
    pub fn new(user: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            database: database.into(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.database)
    }
}

/// A logical pooling unit: one backend target and its server pool
pub struct Route {
    pub key: RouteKey,
    /// The configuration rule that matched this key
    pub rule: RouteConfig,
    pub pool: Arc<ServerPool>,
}

impl Route {
    /// Build a route for `key` from the rule that matched it. Backend user
    /// and database fall back to the client's own.
    pub fn new(key: RouteKey, rule: RouteConfig) -> Self {
        let target = BackendTarget {
            host: rule.backend.host.clone(),
            port: rule.backend.port,
            user: rule.backend.user.clone().unwrap_or_else(|| key.user.clone()),
            password: rule.backend.password.clone(),
            database: rule
                .backend
                .database
                .clone()
                .unwrap_or_else(|| key.database.clone()),
        };
        let pool = Arc::new(ServerPool::new(key.to_string(), target, rule.pool.clone()));
        Self { key, rule, pool }
    }

    pub fn name(&self) -> String {
        self.key.to_string()
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("key", &self.key)
            .field("target", self.pool.target())
            .field("mode", &self.pool.mode())
            .finish()
    }
}
