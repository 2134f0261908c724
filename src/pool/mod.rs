pub mod address;
pub mod connection;
pub mod manager;
pub mod metrics;
pub mod stats;

pub use address::AddressPool;
pub use connection::{
    configure_stream, dial, CloseReason, ConnectionMeta, PooledConnection, SessionTag,
};
pub use manager::{canonical_address, ConnectionManager};
pub use metrics::PoolMetrics;
pub use stats::{AddressPoolStats, CounterSnapshot, PoolStats};
