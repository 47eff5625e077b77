//! Transport abstraction.
//!
//! A transport sends encoded SIP messages to a socket address and reports
//! inbound traffic as [`TransportEvent`]s on an `mpsc` channel handed out
//! when the transport is bound.

pub mod memory;
pub mod udp;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sipstack_sip_core::Message;

use crate::error::{Error, Result};

/// Transport protocol of a listening point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    Udp,
    Tcp,
    Tls,
}

impl TransportType {
    /// Reliable transports disable retransmission timers (RFC 3261 Section 17).
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportType::Udp)
    }

    /// Token used in the Via sent-protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Udp => "UDP",
            TransportType::Tcp => "TCP",
            TransportType::Tls => "TLS",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportType::Udp),
            "TCP" => Ok(TransportType::Tcp),
            "TLS" => Ok(TransportType::Tls),
            other => Err(Error::Unsupported(format!("transport {}", other))),
        }
    }
}

/// Events emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A complete SIP message arrived.
    MessageReceived {
        message: Message,
        source: SocketAddr,
        destination: SocketAddr,
    },
    /// Receive-side failure (including unparseable datagrams).
    Error { error: String },
    /// The transport stopped receiving.
    Closed,
}

/// A SIP transport.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Encodes and sends a message.
    async fn send_message(&self, message: Message, destination: SocketAddr) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn transport_type(&self) -> TransportType;

    fn is_reliable(&self) -> bool {
        self.transport_type().is_reliable()
    }
}
