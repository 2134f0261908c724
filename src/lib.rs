// connpool - Per-address TCP connection pool for distributed storage clients

pub mod config;
pub mod pool;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, PoolConfig};
pub use pool::{AddressPool, ConnectionManager, ConnectionMeta, PooledConnection, SessionTag};
pub use utils::error::{ConnPoolError, Result};
