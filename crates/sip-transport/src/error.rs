use std::net::SocketAddr;

use thiserror::Error;

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the transport layer
#[derive(Error, Debug)]
pub enum Error {
    /// Socket level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport was closed
    #[error("Transport closed")]
    TransportClosed,

    /// No peer is reachable at the destination (connection-oriented transports)
    #[error("Destination unreachable: {0}")]
    Unreachable(SocketAddr),

    /// The message could not be encoded or was too large to send
    #[error("Encoding error: {0}")]
    Encode(String),

    /// The requested transport type or operation is not available
    #[error("Unsupported: {0}")]
    Unsupported(String),
}
