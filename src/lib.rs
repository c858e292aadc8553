// meshpool - Client-side connection pool for service-mesh RPC

pub mod balance;
pub mod chain;
pub mod config;
pub mod pool;
pub mod registry;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use pool::{CallContext, Connection, ConnectionManager, ConnectionManagerBuilder};
pub use utils::error::{PoolError, Result};
