use thiserror::Error;

/// Error kinds surfaced across the facade/RPC boundary.
///
/// Each variant carries a human-readable message; an external RPC
/// binder is expected to serialize `{kind: <variant name>, message}`.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("connection already exists: {0}")]
    ConnectionAlreadyExists(String),

    #[error("unsupported connector type: {0}")]
    UnsupportedConnectorType(String),

    #[error("connection is disabled: {0}")]
    ConnectionDisabled(String),

    #[error("driver connect failed for {connection}: {source}")]
    DriverConnectFailed {
        connection: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("driver operation failed: {0}")]
    DriverOperationFailed(String),

    #[error("tag not registered: {0}")]
    TagNotRegistered(String),

    #[error("tag value is not numeric: {0}")]
    TagNotNumeric(String),

    #[error("value {value} below lower bound {bound} for tag {tag}")]
    BelowLowerBound { tag: String, value: f64, bound: f64 },

    #[error("value {value} above upper bound {bound} for tag {tag}")]
    AboveUpperBound { tag: String, value: f64, bound: f64 },

    #[error("scan job not found: {0}")]
    JobNotFound(String),

    #[error("scan job already exists: {0}")]
    JobAlreadyExists(String),

    #[error("harvester job not found: {0}")]
    HarvesterJobNotFound(String),

    #[error("history harvester job already exists: {0}")]
    HarvesterJobAlreadyExists(String),

    #[error("invalid job interval: {0}s")]
    InvalidInterval(u64),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("bus publish error: {0}")]
    Bus(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type AgentResult<T> = Result<T, AgentError>;
