//! Dialog implementation for RFC 3261 SIP dialogs
//!
//! A [`Dialog`] is a cheap handle over shared, lock-protected state. The
//! provider keeps one handle per dialog in its tables; the TU gets clones
//! through events. Requests built here follow RFC 3261 Section 12.2.1.1:
//! the remote target becomes the Request-URI unless the route set starts
//! with a strict router.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use sipstack_sip_core::{Address, CSeq, HeaderAccess, HeaderName, Method, Request, Uri};

use super::dialog_id::{DialogId, DialogKey};
use super::dialog_state::DialogState;
use crate::config::DialogCleanupPolicy;
use crate::errors::{Error, Result};
use crate::provider::{dialog_layer, ProviderInner};
use crate::transaction::utils::resolve_request_destination;
use crate::transaction::{ClientTransaction, TransactionKey};

/// Requests that update the remote target and therefore carry a Contact.
fn is_target_refresh(method: &Method) -> bool {
    matches!(
        method,
        Method::Invite | Method::Update | Method::Subscribe | Method::Notify | Method::Refer
    )
}

/// Requests a dialog may send before it is confirmed.
fn allowed_in_early(method: &Method) -> bool {
    matches!(method, Method::Prack | Method::Update | Method::Info)
}

/// Mutable dialog state, guarded by the dialog's lock.
pub(crate) struct DialogData {
    pub state: DialogState,
    pub call_id: String,
    /// Our name-addr including our tag
    pub local_address: Address,
    /// The peer's name-addr including its tag
    pub remote_address: Address,
    pub local_tag: String,
    pub remote_tag: String,
    pub local_cseq: u32,
    /// Highest CSeq seen from the peer; `None` until the first request
    pub remote_cseq: Option<u32>,
    pub remote_target: Uri,
    pub route_set: Vec<Address>,
    pub is_server: bool,
    pub initial_transaction: Option<TransactionKey>,
    pub terminate_on_bye: bool,
    /// INVITE CSeq numbers that received a 2xx
    pub confirmed_invites: HashSet<u32>,
    /// ACK sent for each INVITE CSeq
    pub acks: HashMap<u32, Request>,
    /// UAS: CSeq of the INVITE whose 2xx still waits for its ACK
    pub pending_ack: Option<u32>,
    /// UAS: server keys of INVITEs answered with 2xx, indexed by the provider
    pub answered_invites: Vec<TransactionKey>,
    /// UAS: task retransmitting the 2xx until the ACK arrives
    pub retransmission: Option<JoinHandle<()>>,
    /// INVITE that created the dialog
    pub invite: Option<Request>,
    pub application_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl DialogData {
    pub fn key(&self) -> DialogKey {
        DialogKey::new(&self.call_id, &self.local_tag, &self.remote_tag)
    }
}

/// A SIP dialog as defined in RFC 3261
#[derive(Clone)]
pub struct Dialog {
    inner: Arc<DialogInner>,
}

struct DialogInner {
    id: DialogId,
    data: Mutex<DialogData>,
    provider: Weak<ProviderInner>,
}

impl Dialog {
    pub(crate) fn new(data: DialogData, provider: Weak<ProviderInner>) -> Self {
        Self {
            inner: Arc::new(DialogInner {
                id: DialogId::new(),
                data: Mutex::new(data),
                provider,
            }),
        }
    }

    pub fn id(&self) -> DialogId {
        self.inner.id
    }

    pub fn state(&self) -> DialogState {
        self.inner.data.lock().state
    }

    pub fn key(&self) -> DialogKey {
        self.inner.data.lock().key()
    }

    pub fn call_id(&self) -> String {
        self.inner.data.lock().call_id.clone()
    }

    pub fn local_tag(&self) -> String {
        self.inner.data.lock().local_tag.clone()
    }

    pub fn remote_tag(&self) -> String {
        self.inner.data.lock().remote_tag.clone()
    }

    pub fn local_address(&self) -> Address {
        self.inner.data.lock().local_address.clone()
    }

    pub fn remote_address(&self) -> Address {
        self.inner.data.lock().remote_address.clone()
    }

    /// CSeq number of the last request this side sent in the dialog.
    pub fn local_seq_number(&self) -> u32 {
        self.inner.data.lock().local_cseq
    }

    pub fn remote_seq_number(&self) -> Option<u32> {
        self.inner.data.lock().remote_cseq
    }

    pub fn remote_target(&self) -> Uri {
        self.inner.data.lock().remote_target.clone()
    }

    pub fn route_set(&self) -> Vec<Address> {
        self.inner.data.lock().route_set.clone()
    }

    /// True when this side answered the dialog-forming request.
    pub fn is_server(&self) -> bool {
        self.inner.data.lock().is_server
    }

    /// Key of the transaction that created the dialog.
    pub fn initial_transaction(&self) -> Option<TransactionKey> {
        self.inner.data.lock().initial_transaction.clone()
    }

    /// The INVITE that created the dialog. Dropped once ACKed under
    /// [`DialogCleanupPolicy::Aggressive`].
    pub fn invite(&self) -> Option<Request> {
        self.inner.data.lock().invite.clone()
    }

    pub fn terminate_on_bye(&self) -> bool {
        self.inner.data.lock().terminate_on_bye
    }

    /// Whether a successful BYE ends the dialog. Defaults to
    /// `StackConfig::terminate_dialog_on_bye`.
    pub fn set_terminate_on_bye(&self, terminate: bool) {
        self.inner.data.lock().terminate_on_bye = terminate;
    }

    pub fn application_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.data.lock().application_data.clone()
    }

    pub fn set_application_data(&self, data: Arc<dyn Any + Send + Sync>) {
        self.inner.data.lock().application_data = Some(data);
    }

    /// Builds an in-dialog request with the next local CSeq.
    ///
    /// ACK and CANCEL are rejected: use [`create_ack`](Self::create_ack) and
    /// [`ClientTransaction::create_cancel`]. Only PRACK, UPDATE and INFO may
    /// be sent before the dialog is confirmed.
    pub fn create_request(&self, method: Method) -> Result<Request> {
        if matches!(method, Method::Ack | Method::Cancel) {
            return Err(Error::invalid_state(format!(
                "{} is not created through create_request",
                method
            )));
        }
        let provider = self.provider()?;

        let mut data = self.inner.data.lock();
        match data.state {
            DialogState::Terminated => {
                return Err(Error::invalid_state(format!("dialog {} is terminated", self.id())))
            }
            DialogState::Early if !allowed_in_early(&method) => {
                return Err(Error::invalid_state(format!(
                    "{} requires a confirmed dialog",
                    method
                )))
            }
            _ => {}
        }

        data.local_cseq += 1;
        let seq = data.local_cseq;
        let mut request = build_request(&provider, &data, method.clone(), seq);
        if is_target_refresh(&method) {
            request
                .headers
                .push(HeaderName::Contact, provider.local_contact().to_string());
        }
        debug!(dialog = %self.id(), %method, seq, "Created in-dialog request");
        Ok(request)
    }

    /// Binds `transaction` to this dialog and sends its request.
    pub async fn send_request(&self, transaction: &ClientTransaction) -> Result<()> {
        {
            let data = self.inner.data.lock();
            if data.state == DialogState::Terminated {
                return Err(Error::invalid_state(format!("dialog {} is terminated", self.id())));
            }
            if transaction.request().call_id() != Some(data.call_id.as_str()) {
                return Err(Error::invalid_state("request does not belong to this dialog"));
            }
        }
        transaction.set_dialog_id(self.id());
        transaction.send_request().await
    }

    /// Builds the ACK for the 2xx answering the INVITE with CSeq `cseq`.
    pub fn create_ack(&self, cseq: u32) -> Result<Request> {
        let provider = self.provider()?;
        let data = self.inner.data.lock();
        if data.state != DialogState::Confirmed {
            return Err(Error::invalid_state(format!(
                "cannot ACK in dialog state {}",
                data.state
            )));
        }
        if !data.confirmed_invites.contains(&cseq) {
            return Err(Error::invalid_state(format!(
                "no 2xx received for INVITE with CSeq {}",
                cseq
            )));
        }
        Ok(build_request(&provider, &data, Method::Ack, cseq))
    }

    /// Sends an ACK built by [`create_ack`](Self::create_ack). Each INVITE is
    /// ACKed once; later 2xx retransmissions are answered with the stored ACK.
    pub async fn send_ack(&self, ack: Request) -> Result<()> {
        if ack.method != Method::Ack {
            return Err(Error::invalid_state(format!("{} is not an ACK", ack.method)));
        }
        let seq = ack.cseq()?.seq;
        let provider = self.provider()?;

        {
            let mut data = self.inner.data.lock();
            if data.state == DialogState::Terminated {
                return Err(Error::invalid_state(format!("dialog {} is terminated", self.id())));
            }
            if data.acks.contains_key(&seq) {
                return Err(Error::invalid_state(format!(
                    "ACK already sent for INVITE with CSeq {}",
                    seq
                )));
            }
            data.acks.insert(seq, ack.clone());
            if provider.config.cleanup_policy == DialogCleanupPolicy::Aggressive {
                data.invite = None;
            }
        }

        let sent = async {
            let destination = resolve_request_destination(&ack).await?;
            provider.transport.send_message(ack.into(), destination).await?;
            Ok::<_, Error>(())
        }
        .await;

        match sent {
            Ok(()) => {
                debug!(dialog = %self.id(), seq, "ACK sent");
                Ok(())
            }
            Err(e) => {
                self.inner.data.lock().acks.remove(&seq);
                Err(e)
            }
        }
    }

    /// Terminates the dialog and removes it from the provider.
    pub fn delete(&self) {
        match self.inner.provider.upgrade() {
            Some(provider) => dialog_layer::terminate_dialog(
                &provider,
                self,
                "deleted by application",
                dialog_layer::Termination::Terminated,
            ),
            None => {
                self.mark_terminated();
            }
        }
    }

    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&mut DialogData) -> R) -> R {
        f(&mut self.inner.data.lock())
    }

    /// Moves the dialog to Terminated. False when it already was.
    pub(crate) fn mark_terminated(&self) -> bool {
        let mut data = self.inner.data.lock();
        if data.state == DialogState::Terminated {
            return false;
        }
        data.state = DialogState::Terminated;
        data.pending_ack = None;
        if let Some(task) = data.retransmission.take() {
            task.abort();
        }
        info!(dialog = %self.id(), key = %data.key(), "Dialog terminated");
        true
    }

    pub fn ptr_eq(&self, other: &Dialog) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn provider(&self) -> Result<Arc<ProviderInner>> {
        self.inner
            .provider
            .upgrade()
            .ok_or_else(|| Error::invalid_state("provider has shut down"))
    }
}

/// Builds the common part of an in-dialog request.
fn build_request(provider: &ProviderInner, data: &DialogData, method: Method, seq: u32) -> Request {
    let (uri, routes) = request_target(&data.remote_target, &data.route_set);

    let mut request = Request::new(method.clone(), uri);
    request
        .headers
        .push(HeaderName::Via, provider.local_via().to_string());
    request
        .headers
        .push(HeaderName::MaxForwards, provider.config.max_forwards.to_string());
    for route in routes {
        request.headers.push(HeaderName::Route, route.to_string());
    }
    request
        .headers
        .push(HeaderName::From, data.local_address.to_string());
    request
        .headers
        .push(HeaderName::To, data.remote_address.to_string());
    request.headers.push(HeaderName::CallId, data.call_id.clone());
    request
        .headers
        .push(HeaderName::CSeq, CSeq::new(seq, method).to_string());
    if let Some(user_agent) = &provider.config.user_agent {
        request.headers.push(HeaderName::UserAgent, user_agent.clone());
    }
    request
}

/// Request-URI and Route headers for a request to `remote_target` through
/// `route_set` (RFC 3261 Section 12.2.1.1).
pub(crate) fn request_target(remote_target: &Uri, route_set: &[Address]) -> (Uri, Vec<Address>) {
    match route_set.first() {
        None => (remote_target.clone(), Vec::new()),
        Some(first) if first.uri.is_loose_route() => (remote_target.clone(), route_set.to_vec()),
        Some(first) => {
            // Strict router: it becomes the Request-URI, the remote target
            // goes last in the Route set.
            let mut uri = first.uri.clone();
            uri.headers = None;
            let mut routes = route_set[1..].to_vec();
            routes.push(Address::new(remote_target.clone()));
            (uri, routes)
        }
    }
}

impl fmt::Debug for Dialog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.data.lock();
        f.debug_struct("Dialog")
            .field("id", &self.inner.id)
            .field("state", &data.state)
            .field("key", &data.key())
            .field("local_cseq", &data.local_cseq)
            .field("remote_cseq", &data.remote_cseq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_request_target_without_routes() {
        let target: Uri = "sip:bob@192.0.2.4:5070".parse().unwrap();
        let (uri, routes) = request_target(&target, &[]);
        assert_eq!(uri, target);
        assert!(routes.is_empty());
    }

    #[test]
    fn test_request_target_loose_routing() {
        let target: Uri = "sip:bob@192.0.2.4".parse().unwrap();
        let route_set = vec![addr("<sip:p1.example.com;lr>"), addr("<sip:p2.example.com;lr>")];
        let (uri, routes) = request_target(&target, &route_set);
        assert_eq!(uri, target);
        assert_eq!(routes, route_set);
    }

    #[test]
    fn test_request_target_strict_routing() {
        let target: Uri = "sip:bob@192.0.2.4".parse().unwrap();
        let route_set = vec![addr("<sip:p1.example.com>"), addr("<sip:p2.example.com;lr>")];
        let (uri, routes) = request_target(&target, &route_set);
        assert_eq!(uri.host, "p1.example.com");
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].uri.host, "p2.example.com");
        assert_eq!(routes[1].uri, target);
    }

    #[test]
    fn test_method_classes() {
        assert!(is_target_refresh(&Method::Invite));
        assert!(!is_target_refresh(&Method::Bye));
        assert!(allowed_in_early(&Method::Prack));
        assert!(!allowed_in_early(&Method::Bye));
    }
}
