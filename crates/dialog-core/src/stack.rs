//! # SIP stack
//!
//! [`SipStack`] owns the configuration shared by all providers and creates
//! listening points. Each [`ListeningPoint`] wraps one transport; each
//! [`SipProvider`] is bound to one listening point and reads its events.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sipstack_dialog_core::prelude::*;
//!
//! struct Logger;
//!
//! #[async_trait::async_trait]
//! impl SipListener for Logger {
//!     async fn on_event(&self, event: SipEvent) {
//!         println!("{}", event.kind());
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let stack = SipStack::new(StackConfig::default())?;
//! let point = stack
//!     .create_listening_point("127.0.0.1:5060".parse().unwrap(), TransportType::Udp)
//!     .await?;
//! let provider = stack.create_provider(&point)?;
//! provider.set_listener(Arc::new(Logger))?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use sipstack_sip_transport::{Transport, TransportEvent, TransportType, UdpTransport};

use crate::config::StackConfig;
use crate::errors::{Error, Result};
use crate::provider::SipProvider;

/// A transport the stack listens on, waiting to be bound to a provider.
pub struct ListeningPoint {
    transport: Arc<dyn Transport>,
    local_addr: SocketAddr,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl ListeningPoint {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport.transport_type()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }
}

impl fmt::Debug for ListeningPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListeningPoint")
            .field("local_addr", &self.local_addr)
            .field("transport_type", &self.transport_type())
            .finish()
    }
}

/// Owns the configuration and every provider created from it.
pub struct SipStack {
    config: StackConfig,
    providers: Mutex<Vec<SipProvider>>,
}

impl SipStack {
    /// Validates `config` and creates an empty stack.
    pub fn new(config: StackConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            providers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Binds a socket for `transport_type`. Only UDP sockets are built in;
    /// other transports are plugged in with [`attach_transport`](Self::attach_transport).
    pub async fn create_listening_point(
        &self,
        addr: SocketAddr,
        transport_type: TransportType,
    ) -> Result<ListeningPoint> {
        match transport_type {
            TransportType::Udp => {
                let (transport, events) = UdpTransport::bind(addr, None).await?;
                self.attach_transport(Arc::new(transport), events)
            }
            other => Err(Error::Transport(sipstack_sip_transport::Error::Unsupported(
                format!("{} listening points", other),
            ))),
        }
    }

    /// Wraps an already bound transport and its event stream.
    pub fn attach_transport(
        &self,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Result<ListeningPoint> {
        let local_addr = transport.local_addr()?;
        info!(%local_addr, transport = %transport.transport_type(), "Listening point ready");
        Ok(ListeningPoint {
            transport,
            local_addr,
            events: Mutex::new(Some(events)),
        })
    }

    /// Creates the provider for `point` and starts reading its transport.
    /// A listening point serves a single provider.
    pub fn create_provider(&self, point: &ListeningPoint) -> Result<SipProvider> {
        let events = point.events.lock().take().ok_or_else(|| {
            Error::Configuration(format!(
                "listening point {} already has a provider",
                point.local_addr
            ))
        })?;
        let provider = SipProvider::new(self.config.clone(), point.transport.clone())?;
        provider.spawn_transport_reader(events);
        self.providers.lock().push(provider.clone());
        Ok(provider)
    }

    pub fn providers(&self) -> Vec<SipProvider> {
        self.providers.lock().clone()
    }

    /// Closes every provider's transport.
    pub async fn shutdown(&self) {
        let providers = std::mem::take(&mut *self.providers.lock());
        for provider in providers {
            if let Err(e) = provider.close().await {
                warn!(local_addr = %provider.local_addr(), error = %e, "Failed to close transport");
            }
        }
    }
}

impl fmt::Debug for SipStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SipStack")
            .field("providers", &self.providers.lock().len())
            .finish()
    }
}
