use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::config::{RouteConfig, WILDCARD};

use super::{Route, RouteError, RouteKey};

/// Maps a client's (user, database) to its Route
///
/// Routes are created lazily from the configured rules on first resolution
/// and kept for the life of the process. Concurrent first resolutions of the
/// same key agree on a single Route.
pub struct RouteTable {
    /// Configured rules keyed by (user, database) pattern
    rules: HashMap<(String, String), RouteConfig>,
    routes: DashMap<RouteKey, Arc<Route>>,
}

impl RouteTable {
    pub fn new(rules: &[RouteConfig]) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|r| ((r.user.clone(), r.database.clone()), r.clone()))
                .collect(),
            routes: DashMap::new(),
        }
    }

    /// Find or create the Route for a client
    pub fn resolve(&self, user: &str, database: &str) -> Result<Arc<Route>, RouteError> {
        let key = RouteKey::new(user, database);
        if let Some(route) = self.routes.get(&key) {
            return Ok(route.value().clone());
        }

        let rule = self.find_rule(user, database).ok_or_else(|| RouteError::NotFound {
            user: user.to_string(),
            database: database.to_string(),
        })?;

        let route = self
            .routes
            .entry(key.clone())
            .or_insert_with(|| {
                let route = Route::new(key, rule.clone());
                info!(
                    route = %route.key,
                    backend = %route.pool.target().addr(),
                    mode = ?route.pool.mode(),
                    max_size = route.pool.config().max_size,
                    "Route created"
                );
                Arc::new(route)
            })
            .value()
            .clone();
        Ok(route)
    }

    /// Most specific rule first: exact, user only, database only, default
    fn find_rule(&self, user: &str, database: &str) -> Option<&RouteConfig> {
        [
            (user, database),
            (user, WILDCARD),
            (WILDCARD, database),
            (WILDCARD, WILDCARD),
        ]
        .into_iter()
        .find_map(|(u, d)| self.rules.get(&(u.to_string(), d.to_string())))
    }

    pub fn get(&self, key: &RouteKey) -> Option<Arc<Route>> {
        self.routes.get(key).map(|r| r.value().clone())
    }

    /// Current routes; no map lock is held once this returns
    pub fn snapshot(&self) -> Vec<Arc<Route>> {
        self.routes.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Close every route's pool
    pub fn close_all(&self) {
        for route in self.snapshot() {
            route.pool.close();
        }
    }
}
