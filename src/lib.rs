//! sluice: a PostgreSQL connection pooler
//!
//! Clients are mapped to routes by (user, database). Each route owns a
//! bounded pool of backend servers that are lent to one client at a time,
//! per session or per transaction.

pub mod auth;
pub mod client;
pub mod config;
pub mod listener;
pub mod metrics;
pub mod periodic;
pub mod pool;
pub mod pooler;
pub mod protocol;
pub mod route;
pub mod router;

pub use pooler::{Pooler, PoolerContext, PoolerError, PoolerHandle};
