//! In-process transport.
//!
//! A [`MemoryNetwork`] connects any number of [`MemoryTransport`]s by socket
//! address. Every send goes through the real encoder and parser, so the
//! receiving side sees exactly what a socket peer would. Unreliable
//! transports silently drop traffic for unknown addresses; reliable ones
//! fail with [`Error::Unreachable`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use sipstack_sip_core::{parse_message, Message};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent, TransportType};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
const FIRST_EPHEMERAL_PORT: u16 = 40_000;

/// Shared registry of in-memory endpoints.
#[derive(Clone)]
pub struct MemoryNetwork {
    endpoints: Arc<DashMap<SocketAddr, mpsc::Sender<TransportEvent>>>,
    next_port: Arc<AtomicU16>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            endpoints: Arc::new(DashMap::new()),
            next_port: Arc::new(AtomicU16::new(FIRST_EPHEMERAL_PORT)),
        }
    }

    /// Registers an endpoint. Port 0 picks a free port.
    pub fn bind(
        &self,
        addr: SocketAddr,
        transport_type: TransportType,
    ) -> Result<(MemoryTransport, mpsc::Receiver<TransportEvent>)> {
        let mut addr = addr;
        if addr.port() == 0 {
            addr.set_port(self.next_port.fetch_add(1, Ordering::Relaxed));
        }

        let (events_tx, events_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        match self.endpoints.entry(addr) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("{} already bound", addr),
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(events_tx.clone());
            }
        }
        debug!("Memory {} transport bound to {}", transport_type, addr);

        let transport = MemoryTransport {
            inner: Arc::new(MemoryTransportInner {
                network: self.clone(),
                local_addr: addr,
                transport_type,
                closed: AtomicBool::new(false),
                events_tx,
            }),
        };
        Ok((transport, events_rx))
    }

    /// Number of bound endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryTransportInner>,
}

struct MemoryTransportInner {
    network: MemoryNetwork,
    local_addr: SocketAddr,
    transport_type: TransportType,
    closed: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr)
    }

    async fn send_message(&self, message: Message, destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        let peer = self
            .inner
            .network
            .endpoints
            .get(&destination)
            .map(|entry| entry.value().clone());
        let Some(peer) = peer else {
            if self.is_reliable() {
                return Err(Error::Unreachable(destination));
            }
            trace!("Dropping datagram to unbound address {}", destination);
            return Ok(());
        };

        let bytes = message.to_bytes();
        let event = match parse_message(&bytes) {
            Ok(message) => TransportEvent::MessageReceived {
                message,
                source: self.inner.local_addr,
                destination,
            },
            Err(e) => {
                warn!("Peer {} cannot parse message: {}", destination, e);
                TransportEvent::Error {
                    error: format!("Error parsing SIP message: {}", e),
                }
            }
        };

        trace!("Delivering {} bytes {} -> {}", bytes.len(), self.inner.local_addr, destination);
        if peer.send(event).await.is_err() && self.is_reliable() {
            return Err(Error::Unreachable(destination));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.network.endpoints.remove(&self.inner.local_addr);
            let _ = self.inner.events_tx.send(TransportEvent::Closed).await;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn transport_type(&self) -> TransportType {
        self.inner.transport_type
    }
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryTransport({}, {})",
            self.inner.transport_type, self.inner.local_addr
        )
    }
}
