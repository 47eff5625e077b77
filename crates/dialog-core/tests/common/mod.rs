//! Shared fixtures for the dialog-core integration tests.
//!
//! Every test runs on a [`MemoryNetwork`] with a paused tokio clock, so
//! RFC 3261 timers fire deterministically and instantly. An [`Engine`] is a
//! full stack + provider with a recording listener; a [`Peer`] is a bare
//! transport the test drives by hand to play the remote side.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use sipstack_dialog_core::prelude::*;
use sipstack_sip_core::builder::{generate_branch, RequestBuilder, ResponseBuilder};
use sipstack_sip_core::{Address, Message, Method, Request, Response, StatusCode, Via};
use sipstack_sip_transport::{MemoryNetwork, MemoryTransport, Transport, TransportEvent};

/// Longest a test waits for anything. Paused time makes this free.
const WAIT: Duration = Duration::from_secs(300);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sipstack_dialog_core=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Test configuration: no automatic 100 Trying so peers see exactly what
/// the TU sends.
pub fn quiet_config() -> StackConfig {
    StackConfig::default().with_auto_100_trying(false)
}

/// Forwards every event into a channel.
pub struct RecordingListener {
    tx: mpsc::UnboundedSender<SipEvent>,
    extended: bool,
}

impl RecordingListener {
    pub fn new(tx: mpsc::UnboundedSender<SipEvent>, extended: bool) -> Self {
        Self { tx, extended }
    }
}

#[async_trait]
impl SipListener for RecordingListener {
    async fn on_event(&self, event: SipEvent) {
        let _ = self.tx.send(event);
    }

    fn handles_dialog_timeout(&self) -> bool {
        self.extended
    }
}

pub struct Engine {
    pub stack: SipStack,
    pub provider: SipProvider,
    pub events: mpsc::UnboundedReceiver<SipEvent>,
    pub addr: SocketAddr,
}

impl Engine {
    pub fn start(network: &MemoryNetwork, at: &str, config: StackConfig) -> Self {
        Self::start_with(network, at, config, false)
    }

    /// `extended` listeners receive [`SipEvent::DialogTimeout`].
    pub fn start_with(network: &MemoryNetwork, at: &str, config: StackConfig, extended: bool) -> Self {
        let (transport, transport_events) = network.bind(addr(at), TransportType::Udp).unwrap();
        let stack = SipStack::new(config).unwrap();
        let point = stack
            .attach_transport(Arc::new(transport), transport_events)
            .unwrap();
        let provider = stack.create_provider(&point).unwrap();
        let (tx, events) = mpsc::unbounded_channel();
        provider
            .set_listener(Arc::new(RecordingListener::new(tx, extended)))
            .unwrap();
        let addr = provider.local_addr();
        Self {
            stack,
            provider,
            events,
            addr,
        }
    }

    pub fn uri(&self, user: &str) -> String {
        format!("sip:{}@{}", user, self.addr)
    }

    /// Next event of any kind.
    pub async fn next_event(&mut self) -> SipEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    /// Next event matching `pred`, skipping the rest.
    pub async fn wait_for(&mut self, pred: impl Fn(&SipEvent) -> bool) -> SipEvent {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }

    pub async fn next_request(&mut self, method: Method) -> RequestEvent {
        match self
            .wait_for(|e| matches!(e, SipEvent::Request(r) if r.request.method == method))
            .await
        {
            SipEvent::Request(event) => event,
            _ => unreachable!(),
        }
    }

    pub async fn next_response(&mut self) -> ResponseEvent {
        match self.wait_for(|e| matches!(e, SipEvent::Response(_))).await {
            SipEvent::Response(event) => event,
            _ => unreachable!(),
        }
    }

    /// Everything already queued, without waiting.
    pub fn drain(&mut self) -> Vec<SipEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// INVITE (or any other out-of-dialog request) from this engine to `to`.
    pub fn request(&self, method: Method, to: SocketAddr, call_id: &str) -> Request {
        RequestBuilder::new(method, &format!("sip:bob@{}", to))
            .unwrap()
            .from_address(
                format!("<{}>", self.uri("alice"))
                    .parse::<Address>()
                    .unwrap()
                    .with_tag(sipstack_sip_core::builder::generate_tag()),
            )
            .to_address(format!("<sip:bob@{}>", to).parse().unwrap())
            .call_id(call_id)
            .cseq(1)
            .max_forwards(70)
            .contact(self.provider.local_contact())
            .build()
    }
}

/// One side of a call as the peer sees it.
#[derive(Debug, Clone)]
pub struct Leg {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: Option<String>,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl Leg {
    pub fn new(local: SocketAddr, remote: SocketAddr, call_id: &str, from_tag: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            from_tag: from_tag.to_string(),
            to_tag: None,
            local,
            remote,
        }
    }

    pub fn with_to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    /// A request sent by the peer with an explicit branch, so tests control
    /// what counts as a retransmission.
    pub fn request(&self, method: Method, cseq: u32, branch: &str) -> Request {
        let mut to: Address = format!("<sip:bob@{}>", self.remote).parse().unwrap();
        if let Some(tag) = &self.to_tag {
            to = to.with_tag(tag.clone());
        }
        RequestBuilder::new(method, &format!("sip:bob@{}", self.remote))
            .unwrap()
            .via(Via::new("UDP", self.local.ip().to_string(), Some(self.local.port())).with_branch(branch))
            .from_address(
                format!("<sip:carol@{}>", self.local)
                    .parse::<Address>()
                    .unwrap()
                    .with_tag(self.from_tag.clone()),
            )
            .to_address(to)
            .call_id(&self.call_id)
            .cseq(cseq)
            .max_forwards(70)
            .contact(format!("<sip:carol@{}>", self.local).parse().unwrap())
            .build()
    }
}

/// A hand-driven remote endpoint.
pub struct Peer {
    pub transport: MemoryTransport,
    pub rx: mpsc::Receiver<TransportEvent>,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn bind(network: &MemoryNetwork, at: &str) -> Self {
        let (transport, rx) = network.bind(addr(at), TransportType::Udp).unwrap();
        Self {
            transport,
            rx,
            addr: addr(at),
        }
    }

    pub fn leg(&self, engine: &Engine, call_id: &str) -> Leg {
        Leg::new(self.addr, engine.addr, call_id, &sipstack_sip_core::builder::generate_tag())
    }

    pub async fn send(&self, message: impl Into<Message>, to: SocketAddr) {
        self.transport.send_message(message.into(), to).await.unwrap();
    }

    /// Next message, waiting up to `within`.
    pub async fn recv_within(&mut self, within: Duration) -> Option<Message> {
        loop {
            match tokio::time::timeout(within, self.rx.recv()).await {
                Ok(Some(TransportEvent::MessageReceived { message, .. })) => return Some(message),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    pub async fn recv(&mut self) -> Message {
        self.recv_within(WAIT).await.expect("peer received nothing")
    }

    pub async fn recv_request(&mut self) -> Request {
        match self.recv().await {
            Message::Request(request) => request,
            Message::Response(response) => panic!("expected a request, got {}", response.status),
        }
    }

    pub async fn recv_response(&mut self) -> Response {
        match self.recv().await {
            Message::Response(response) => response,
            Message::Request(request) => panic!("expected a response, got {}", request.method),
        }
    }

    /// Everything already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            if let TransportEvent::MessageReceived { message, .. } = event {
                messages.push(message);
            }
        }
        messages
    }

    /// Answers `request` with `status` to `to`, adding `to_tag` and this
    /// peer's Contact.
    pub async fn respond(
        &self,
        request: &Request,
        status: StatusCode,
        to_tag: Option<&str>,
        to: SocketAddr,
    ) -> Response {
        let mut builder = ResponseBuilder::from_request(request, status)
            .contact(format!("<sip:bob@{}>", self.addr).parse().unwrap());
        if let Some(tag) = to_tag {
            builder = builder.to_tag(tag);
        }
        let response = builder.build();
        self.send(response.clone(), to).await;
        response
    }
}

pub fn branch() -> String {
    generate_branch()
}
