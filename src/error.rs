use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpeedError {
    /// Bad cookie, wrong message type or truncated bytes
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("no offer received within {0:?}")]
    DiscoveryTimeout(Duration),

    #[error("connect to {addr} failed: {source}")]
    ConnectFailure {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connection closed after {received} of {expected} bytes")]
    IncompleteTransfer { received: u64, expected: u64 },

    /// Well-formed request for zero bytes
    #[error("request for zero bytes")]
    EmptyRequest,

    #[error("no segments received within {0:?}")]
    NoResponse(Duration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SpeedError>;
