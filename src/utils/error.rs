use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Service not found: proto={protocol}, domain={domain}, service={service}, method={method}")]
    ServiceNotFound {
        protocol: String,
        domain: String,
        service: String,
        method: String,
    },

    #[error("Method not found: service={service}, method={method}")]
    MethodNotFound { service: String, method: String },

    #[error("No pool for app_name={0}")]
    PoolNotFound(String),

    #[error("Unknown load balancing strategy: {0}")]
    StrategyNotFound(String),

    #[error("No free connection: {0}")]
    NoFreeConnection(String),

    #[error("Service chain error: {0}")]
    ServiceChain(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, PoolError>;
