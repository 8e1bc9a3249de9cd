//! Per-route server pools
//!
//! [`state`] holds the partition bookkeeping; [`ServerPool`] drives it from
//! async code and owns the backend connections.

mod server;
mod server_pool;
pub mod state;

pub use server::{BackendTarget, ConnectionError, ServerConnection};
pub use server_pool::{PoolError, PooledServer, ReleaseMode, ServerPool};
pub use state::{Holder, Partition, PoolStats, ServerId};
