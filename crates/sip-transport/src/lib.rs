//! SIP transport layer for the sipstack engine
//!
//! This crate provides the [`Transport`] trait consumed by the transaction
//! layer, a UDP implementation and an in-memory network for tests and
//! embedding.

pub mod error;
pub mod transport;

pub use error::{Error, Result};
pub use transport::memory::{MemoryNetwork, MemoryTransport};
pub use transport::udp::UdpTransport;
pub use transport::{Transport, TransportEvent, TransportType};

/// Bind a UDP transport to the specified address
pub async fn bind_udp(
    addr: std::net::SocketAddr,
) -> Result<(UdpTransport, tokio::sync::mpsc::Receiver<TransportEvent>)> {
    UdpTransport::bind(addr, None).await
}

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        bind_udp, Error, MemoryNetwork, MemoryTransport, Result, Transport, TransportEvent,
        TransportType, UdpTransport,
    };
}
