use crate::Endpoint;

/// Errors produced by the tide transports.
///
/// These never cross a transport boundary as a `Result`: the send paths turn
/// them into the cause of an `Error`/`TimeOut`/`Unreachable` outcome, and the
/// bind path records them behind `is_on_bind_error()`.
#[derive(Debug, thiserror::Error)]
pub enum TideTransportError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {endpoint} timed out after {millis} ms")]
    ConnectTimeout { endpoint: Endpoint, millis: u64 },

    #[error("{endpoint} is unreachable: {source}")]
    Unreachable {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("could not resolve {endpoint}")]
    Resolve { endpoint: Endpoint },

    #[error("write to {endpoint} failed: {source}")]
    Write {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("encode failed: {0}")]
    Encode(#[from] crate::codec::CodecError),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("transport is not running")]
    NotRunning,

    #[error("transport shut down before delivery completed")]
    Shutdown,

    #[error("in-flight send dropped by purge")]
    Purged,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
