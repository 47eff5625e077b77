//! # Provider
//!
//! A [`SipProvider`] binds one transport to one listener and owns every table
//! the engine needs: transactions by key, dialogs by id and by tag triple,
//! in-progress requests for merge detection, and forked INVITEs.
//!
//! Three kinds of tasks touch a provider:
//!
//! - the transport reader calls [`SipProvider::process_message`] for every
//!   inbound message ([`dispatch`])
//! - transaction runners post [`TransactionEvent`]s, which the provider event
//!   task turns into [`SipEvent`]s after running the dialog layer
//! - the listener dispatcher awaits [`SipListener::on_event`] one event at a
//!   time, so the TU sees events in order and may call back into the provider
//!
//! All outbound TU events go through the provider event task, which keeps
//! dialog events ordered relative to the transaction events that caused
//! them.

pub(crate) mod dialog_layer;
pub(crate) mod dispatch;

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use sipstack_sip_core::builder::generate_branch;
use sipstack_sip_core::{
    Address, HeaderAccess, HeaderName, Message, Method, Request, Response, Uri, Via,
};
use sipstack_sip_transport::{Transport, TransportEvent, TransportType};

use crate::config::StackConfig;
use crate::dialog::{Dialog, DialogId, DialogKey};
use crate::errors::{Error, Result};
use crate::events::{RequestEvent, ResponseEvent, SipEvent, SipListener, TimeoutEvent};
use crate::transaction::utils::{resolve_request_destination, resolve_response_destination};
use crate::transaction::{
    ClientTransaction, ServerTransaction, SipTransaction, TimerSettings, TransactionEvent,
    TransactionKey, TransactionState,
};

use dialog_layer::{ForkContext, ForkKey};

/// What the provider event task processes.
#[derive(Debug)]
pub(crate) enum ProviderEvent {
    Transaction(TransactionEvent),
    /// Ready-made event for the listener
    Deliver(SipEvent),
}

/// Identity of an initial request for merge and loop detection
/// (RFC 3261 Section 8.2.2.2).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeKey {
    pub call_id: String,
    pub from_tag: String,
    pub cseq: u32,
    pub method: Method,
}

impl MergeKey {
    /// `None` for requests that are not subject to merge detection.
    pub fn from_request(request: &Request) -> Option<Self> {
        if request.to_tag().is_some() || matches!(request.method, Method::Ack | Method::Cancel) {
            return None;
        }
        Some(Self {
            call_id: request.call_id()?.to_string(),
            from_tag: request.from_tag()?,
            cseq: request.cseq().ok()?.seq,
            method: request.method.clone(),
        })
    }
}

/// An INVITE this side answered with 2xx. Kept while its dialog lives so
/// retransmissions and merged copies are recognised after the server
/// transaction has ended.
#[derive(Debug, Clone)]
pub(crate) struct AnsweredInvite {
    pub dialog: DialogId,
    pub merge_key: Option<MergeKey>,
}

pub(crate) struct ProviderInner {
    pub(crate) config: StackConfig,
    pub(crate) transport: Arc<dyn Transport>,
    local_addr: SocketAddr,
    pub(crate) transactions: DashMap<TransactionKey, SipTransaction>,
    pub(crate) merge_table: DashMap<MergeKey, TransactionKey>,
    pub(crate) answered_invites: DashMap<TransactionKey, AnsweredInvite>,
    pub(crate) dialogs: DashMap<DialogId, Dialog>,
    pub(crate) dialog_keys: DashMap<DialogKey, DialogId>,
    pub(crate) forks: DashMap<ForkKey, ForkContext>,
    pub(crate) events_tx: mpsc::UnboundedSender<ProviderEvent>,
    dispatch_tx: mpsc::UnboundedSender<SipEvent>,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<SipEvent>>>,
}

impl ProviderInner {
    pub(crate) fn timer_settings(&self) -> TimerSettings {
        TimerSettings::new(&self.config, self.transport.is_reliable())
    }

    /// Queues an event for the listener behind any pending transaction events.
    pub(crate) fn deliver(&self, event: SipEvent) {
        if self.events_tx.send(ProviderEvent::Deliver(event)).is_err() {
            trace!("Provider event task gone, dropping event");
        }
    }

    fn dispatch(&self, event: SipEvent) {
        trace!(kind = event.kind(), "Dispatching event to listener");
        if self.dispatch_tx.send(event).is_err() {
            trace!("Listener dispatcher gone, dropping event");
        }
    }

    pub(crate) fn local_via(&self) -> Via {
        let mut via = Via::new(
            self.transport.transport_type().as_str(),
            self.local_addr.ip().to_string(),
            Some(self.local_addr.port()),
        )
        .with_branch(generate_branch());
        via.set_rport(None);
        via
    }

    pub(crate) fn local_contact(&self) -> Address {
        let mut uri = Uri::sip(host_for_uri(self.local_addr)).with_port(self.local_addr.port());
        match self.transport.transport_type() {
            TransportType::Udp => {}
            other => uri
                .params
                .set("transport", Some(other.as_str().to_ascii_lowercase())),
        }
        Address::new(uri)
    }

    /// Transaction under `key` unless it has terminated.
    pub(crate) fn live_transaction(&self, key: &TransactionKey) -> Option<SipTransaction> {
        self.transactions
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(|tx| tx.state() != TransactionState::Terminated)
    }

    /// Registers a transaction. Fails while another live transaction owns
    /// the same key; a terminated one is replaced.
    pub(crate) fn insert_transaction(&self, transaction: SipTransaction) -> Result<()> {
        match self.transactions.entry(transaction.key().clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().state() != TransactionState::Terminated {
                    return Err(Error::unavailable(format!(
                        "transaction {} already exists",
                        transaction.key()
                    )));
                }
                entry.insert(transaction);
            }
            Entry::Vacant(entry) => {
                entry.insert(transaction);
            }
        }
        Ok(())
    }

    pub(crate) fn register_merge_key(&self, transaction: &ServerTransaction) {
        if let Some(merge_key) = MergeKey::from_request(transaction.request()) {
            self.merge_table.insert(merge_key, transaction.key().clone());
        }
    }

    /// True when `request` matches an in-progress server transaction, or an
    /// INVITE answered with 2xx, that arrived over a different path.
    pub(crate) fn is_merged_request(&self, request: &Request, key: &TransactionKey) -> bool {
        let Some(merge_key) = MergeKey::from_request(request) else {
            return false;
        };
        let Some(existing) = self.merge_table.get(&merge_key).map(|e| e.value().clone()) else {
            return false;
        };
        &existing != key
            && (self.live_transaction(&existing).is_some()
                || self.answered_invites.contains_key(&existing))
    }

    fn remove_transaction(&self, transaction: &SipTransaction) {
        let key = transaction.key();
        self.transactions
            .remove_if(key, |_, existing| existing.ptr_eq(transaction));

        // An answered INVITE keeps its merge entry until its dialog ends.
        if !self.answered_invites.contains_key(key) {
            if let Some(merge_key) = MergeKey::from_request(transaction.request()) {
                self.merge_table
                    .remove_if(&merge_key, |_, existing| existing == key);
            }
        }
        if let SipTransaction::Client(tx) = transaction {
            if tx.is_invite() {
                if let Some(fork_key) = ForkKey::from_request(tx.request()) {
                    self.forks.remove_if(&fork_key, |_, fork| {
                        !fork.confirmed && &fork.transaction == key
                    });
                }
            }
        }
        debug!(id = %key, remaining = self.transactions.len(), "Removed transaction");
    }

    pub(crate) fn dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.get(id).map(|entry| entry.value().clone())
    }

    pub(crate) fn find_dialog(&self, key: &DialogKey) -> Option<Dialog> {
        let id = *self.dialog_keys.get(key)?.value();
        self.dialog(&id)
    }

    pub(crate) fn remove_dialog(&self, dialog: &Dialog) {
        let id = dialog.id();
        self.dialogs.remove_if(&id, |_, existing| existing.ptr_eq(dialog));
        self.dialog_keys
            .remove_if(&dialog.key(), |_, existing| *existing == id);
        debug!(dialog = %id, remaining = self.dialogs.len(), "Removed dialog");
    }

    fn on_provider_event(self: &Arc<Self>, event: ProviderEvent) {
        match event {
            ProviderEvent::Deliver(event) => self.dispatch(event),
            ProviderEvent::Transaction(event) => self.on_transaction_event(event),
        }
    }

    fn on_transaction_event(self: &Arc<Self>, event: TransactionEvent) {
        match event {
            TransactionEvent::Request {
                transaction,
                request,
                source,
                dialog,
            } => self.dispatch(SipEvent::Request(RequestEvent {
                request,
                source,
                server_transaction: Some(transaction),
                dialog,
            })),
            TransactionEvent::Response {
                transaction,
                response,
                source,
                dialog,
            } => self.dispatch(SipEvent::Response(ResponseEvent {
                response,
                source,
                client_transaction: Some(transaction),
                dialog,
            })),
            TransactionEvent::Timeout { transaction, timer } => {
                self.dispatch(SipEvent::Timeout(TimeoutEvent {
                    transaction: transaction.clone(),
                    timer,
                }));
                dialog_layer::on_transaction_timeout(self, &transaction);
            }
            TransactionEvent::TransportError {
                transaction,
                destination,
                error,
            } => {
                dialog_layer::on_transaction_timeout(self, &transaction);
                self.dispatch(SipEvent::TransportError {
                    transaction: Some(transaction),
                    destination,
                    error,
                });
            }
            TransactionEvent::Terminated { transaction } => {
                self.remove_transaction(&transaction);
                self.dispatch(SipEvent::TransactionTerminated { transaction });
            }
        }
    }
}

fn host_for_uri(addr: SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => v4.ip().to_string(),
        SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
    }
}

/// Entry point for the transaction user.
///
/// Created by [`SipStack::create_provider`](crate::stack::SipStack::create_provider).
/// Cloning is cheap; all clones share the same tables.
#[derive(Clone)]
pub struct SipProvider {
    inner: Arc<ProviderInner>,
}

impl SipProvider {
    pub(crate) fn new(config: StackConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let local_addr = transport.local_addr()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ProviderInner {
            config,
            transport,
            local_addr,
            transactions: DashMap::new(),
            merge_table: DashMap::new(),
            answered_invites: DashMap::new(),
            dialogs: DashMap::new(),
            dialog_keys: DashMap::new(),
            forks: DashMap::new(),
            events_tx,
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
        });
        tokio::spawn(run_provider_events(Arc::downgrade(&inner), events_rx));
        info!(%local_addr, "SIP provider created");

        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn transport_type(&self) -> TransportType {
        self.inner.transport.transport_type()
    }

    pub fn config(&self) -> &StackConfig {
        &self.inner.config
    }

    /// Registers the provider's only listener and starts delivering events.
    /// Events raised before this call are queued.
    pub fn set_listener(&self, listener: Arc<dyn SipListener>) -> Result<()> {
        let receiver = self
            .inner
            .dispatch_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Configuration("provider already has a listener".into()))?;
        tokio::spawn(run_listener(receiver, listener));
        Ok(())
    }

    /// Feeds one inbound message through the engine. Called by the transport
    /// reader; useful directly when integrating a custom transport.
    pub async fn process_message(&self, message: Message, source: SocketAddr) {
        dispatch::process_message(&self.inner, message, source).await;
    }

    /// A fresh Via for this provider's transport, with a new branch and `rport`.
    pub fn local_via(&self) -> Via {
        self.inner.local_via()
    }

    pub fn local_contact(&self) -> Address {
        self.inner.local_contact()
    }

    /// Creates a client transaction for `request`; nothing is sent until
    /// [`ClientTransaction::send_request`].
    ///
    /// A request without a Via gets this provider's; a Via without an
    /// RFC 3261 branch gets a new branch. ACK is rejected: ACKs for 2xx go
    /// through [`Dialog::send_ack`], ACKs for failures are sent by the
    /// INVITE transaction itself.
    pub async fn new_client_transaction(&self, mut request: Request) -> Result<ClientTransaction> {
        if request.method == Method::Ack {
            return Err(Error::invalid_state(
                "ACK is not sent through a client transaction",
            ));
        }
        if !request.headers.contains(&HeaderName::Via) {
            request
                .headers
                .insert_front(HeaderName::Via, self.inner.local_via().to_string());
        } else {
            let mut via = request.top_via()?;
            if !via.has_rfc3261_branch() {
                via.set_branch(generate_branch());
                request.set_top_via(&via);
            }
        }
        request.validate()?;

        let destination = resolve_request_destination(&request).await?;
        ClientTransaction::new(request, destination, Arc::downgrade(&self.inner))
    }

    /// Creates the server transaction for a request delivered without one
    /// (automatic transaction creation disabled).
    pub fn new_server_transaction(&self, event: &RequestEvent) -> Result<ServerTransaction> {
        if event.server_transaction.is_some() {
            return Err(Error::unavailable("request already has a server transaction"));
        }
        if event.request.method == Method::Ack {
            return Err(Error::invalid_state("ACK does not create a server transaction"));
        }
        let transaction =
            ServerTransaction::create(&self.inner, event.request.clone(), event.source, false)?;
        if let Some(dialog) = &event.dialog {
            transaction.set_dialog_id(dialog.id());
        }
        Ok(transaction)
    }

    /// Creates a dialog for a dialog-forming transaction ahead of the
    /// exchange that would create it automatically. A client transaction
    /// needs a tagged response first; a server transaction uses its own
    /// To tag.
    pub fn get_new_dialog(&self, transaction: &SipTransaction) -> Result<Dialog> {
        dialog_layer::get_new_dialog(&self.inner, transaction)
    }

    /// Sends a request without a transaction: no retransmission, no state.
    pub async fn send_request_stateless(&self, request: Request) -> Result<()> {
        let destination = resolve_request_destination(&request).await?;
        self.inner
            .transport
            .send_message(request.into(), destination)
            .await?;
        Ok(())
    }

    /// Sends a response to the address named by its top Via.
    pub async fn send_response_stateless(&self, response: Response) -> Result<()> {
        let destination = resolve_response_destination(&response).await?;
        self.inner
            .transport
            .send_message(response.into(), destination)
            .await?;
        Ok(())
    }

    pub fn dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.inner.dialog(id)
    }

    pub fn find_dialog(&self, key: &DialogKey) -> Option<Dialog> {
        self.inner.find_dialog(key)
    }

    pub fn find_transaction(&self, key: &TransactionKey) -> Result<SipTransaction> {
        self.inner
            .transactions
            .get(key)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::TransactionNotFound(key.to_string()))
    }

    /// The INVITE server transaction a CANCEL refers to.
    pub fn find_cancelled_transaction(&self, cancel: &Request) -> Option<ServerTransaction> {
        let key = TransactionKey::from_request(cancel, true)
            .ok()?
            .with_method(Method::Invite);
        self.inner
            .live_transaction(&key)
            .and_then(|tx| tx.as_server().cloned())
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.transactions.len()
    }

    pub fn dialog_count(&self) -> usize {
        self.inner.dialogs.len()
    }

    /// Closes the underlying transport. Transactions and dialogs run down on
    /// their own timers.
    pub async fn close(&self) -> Result<()> {
        self.inner.transport.close().await?;
        Ok(())
    }

    pub(crate) fn spawn_transport_reader(&self, mut events: mpsc::Receiver<TransportEvent>) {
        let provider = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = provider.upgrade() else {
                    break;
                };
                match event {
                    TransportEvent::MessageReceived {
                        message, source, ..
                    } => dispatch::process_message(&inner, message, source).await,
                    TransportEvent::Error { error } => {
                        warn!(%error, "Transport reported an error");
                    }
                    TransportEvent::Closed => {
                        info!(local_addr = %inner.local_addr, "Transport closed");
                        break;
                    }
                }
            }
            debug!("Transport reader ended");
        });
    }
}

impl std::fmt::Debug for SipProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SipProvider")
            .field("local_addr", &self.inner.local_addr)
            .field("transactions", &self.inner.transactions.len())
            .field("dialogs", &self.inner.dialogs.len())
            .finish()
    }
}

async fn run_provider_events(
    provider: Weak<ProviderInner>,
    mut events: mpsc::UnboundedReceiver<ProviderEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = provider.upgrade() else {
            break;
        };
        inner.on_provider_event(event);
    }
    debug!("Provider event task ended");
}

async fn run_listener(
    mut events: mpsc::UnboundedReceiver<SipEvent>,
    listener: Arc<dyn SipListener>,
) {
    let extended = listener.handles_dialog_timeout();
    while let Some(event) = events.recv().await {
        let event = match event {
            SipEvent::DialogTimeout { dialog, reason } if !extended => {
                SipEvent::DialogTerminated { dialog, reason }
            }
            other => other,
        };
        listener.on_event(event).await;
    }
    debug!("Listener dispatcher ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipstack_sip_core::builder::RequestBuilder;

    fn request(to_tag: Option<&str>, method: Method) -> Request {
        let mut to: Address = "<sip:bob@biloxi.com>".parse().unwrap();
        if let Some(tag) = to_tag {
            to.set_tag(tag);
        }
        RequestBuilder::new(method, "sip:bob@biloxi.com")
            .unwrap()
            .via(Via::new("UDP", "10.0.0.1", Some(5060)).with_branch("z9hG4bKmerge"))
            .from_address("<sip:alice@atlanta.com>;tag=a1".parse().unwrap())
            .to_address(to)
            .call_id("merge-call")
            .cseq(7)
            .build()
    }

    #[test]
    fn test_merge_key_for_initial_requests_only() {
        let key = MergeKey::from_request(&request(None, Method::Invite)).unwrap();
        assert_eq!(key.call_id, "merge-call");
        assert_eq!(key.from_tag, "a1");
        assert_eq!(key.cseq, 7);
        assert_eq!(key.method, Method::Invite);

        assert!(MergeKey::from_request(&request(Some("b1"), Method::Invite)).is_none());
        assert!(MergeKey::from_request(&request(None, Method::Cancel)).is_none());
    }

    #[test]
    fn test_host_for_uri_brackets_ipv6() {
        assert_eq!(host_for_uri("10.0.0.1:5060".parse().unwrap()), "10.0.0.1");
        assert_eq!(host_for_uri("[::1]:5060".parse().unwrap()), "[::1]");
    }
}
