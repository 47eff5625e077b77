//! Client transactions (RFC 3261 Section 17.1).
//!
//! INVITE: Calling → Proceeding → Completed → Terminated, driven by Timers
//! A, B and D. A 2xx ends the transaction at once; the ACK for it belongs to
//! the dialog. A 300-699 response is ACKed by the transaction itself.
//!
//! Non-INVITE: Trying → Proceeding → Completed → Terminated, driven by Timers
//! E, F and K.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use sipstack_sip_core::{Message, Request, Response};

use crate::dialog::{Dialog, DialogId};
use crate::errors::{Error, Result};
use crate::provider::{dialog_layer, ProviderInner};
use crate::transaction::runner::{
    run_transaction_loop, Command, TransactionContext, TransactionLogic,
};
use crate::transaction::timer::{TimerSet, TimerSettings, TimerType};
use crate::transaction::utils;
use crate::transaction::{
    AtomicTransactionState, SipTransaction, TransactionEvent, TransactionKey, TransactionKind,
    TransactionState,
};

/// Handle to a client transaction.
///
/// Created by [`SipProvider::new_client_transaction`](crate::provider::SipProvider::new_client_transaction);
/// nothing is sent until [`send_request`](Self::send_request).
#[derive(Clone)]
pub struct ClientTransaction {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    key: TransactionKey,
    kind: TransactionKind,
    request: Request,
    destination: SocketAddr,
    state: Arc<AtomicTransactionState>,
    commands: mpsc::UnboundedSender<Command>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    dialog_id: Mutex<Option<DialogId>>,
    last_response: Mutex<Option<Response>>,
    provider: Weak<ProviderInner>,
}

impl ClientTransaction {
    pub(crate) fn new(
        request: Request,
        destination: SocketAddr,
        provider: Weak<ProviderInner>,
    ) -> Result<Self> {
        let key = TransactionKey::from_request(&request, false)?;
        let kind = TransactionKind::new(request.method.is_invite(), false);
        let (commands, pending) = mpsc::unbounded_channel();
        debug!(id = %key, %destination, "Created client transaction");

        Ok(Self {
            inner: Arc::new(ClientInner {
                key,
                kind,
                request,
                destination,
                state: Arc::new(AtomicTransactionState::new(kind.initial_state())),
                commands,
                pending: Mutex::new(Some(pending)),
                dialog_id: Mutex::new(None),
                last_response: Mutex::new(None),
                provider,
            }),
        })
    }

    pub fn key(&self) -> &TransactionKey {
        &self.inner.key
    }

    pub fn kind(&self) -> TransactionKind {
        self.inner.kind
    }

    pub fn is_invite(&self) -> bool {
        self.inner.kind.is_invite()
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn destination(&self) -> SocketAddr {
        self.inner.destination
    }

    pub fn state(&self) -> TransactionState {
        self.inner.state.get()
    }

    /// Dialog this transaction belongs to, if any.
    pub fn dialog_id(&self) -> Option<DialogId> {
        *self.inner.dialog_id.lock()
    }

    pub fn last_response(&self) -> Option<Response> {
        self.inner.last_response.lock().clone()
    }

    pub(crate) fn set_dialog_id(&self, id: DialogId) {
        *self.inner.dialog_id.lock() = Some(id);
    }

    pub(crate) fn bind_dialog_if_unset(&self, id: DialogId) {
        self.inner.dialog_id.lock().get_or_insert(id);
    }

    fn set_last_response(&self, response: Response) {
        *self.inner.last_response.lock() = Some(response);
    }

    /// Sends the request and starts the state machine. Fails with
    /// [`Error::TransactionUnavailable`] when called a second time.
    pub async fn send_request(&self) -> Result<()> {
        let commands = self.inner.pending.lock().take().ok_or_else(|| {
            Error::unavailable(format!("request of {} was already sent", self.inner.key))
        })?;
        let provider = self
            .inner
            .provider
            .upgrade()
            .ok_or_else(|| Error::unavailable("provider has shut down"))?;

        provider.insert_transaction(SipTransaction::Client(self.clone()))?;
        if self.is_invite() {
            dialog_layer::register_fork(&provider, self);
        }

        let settings = provider.timer_settings();
        let ctx = TransactionContext {
            key: self.inner.key.clone(),
            kind: self.inner.kind,
            state: self.inner.state.clone(),
            transport: provider.transport.clone(),
            remote: self.inner.destination,
            events: provider.events_tx.clone(),
            transaction: SipTransaction::Client(self.clone()),
        };
        drop(provider);

        let logic = ClientLogic {
            transaction: self.clone(),
            settings,
            interval: settings.t1,
            ack: None,
        };
        tokio::spawn(run_transaction_loop(
            logic,
            ctx,
            commands,
            self.inner.commands.clone(),
        ));

        let (reply, result) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Start { reply })
            .map_err(|_| Error::unavailable("transaction has terminated"))?;
        result
            .await
            .map_err(|_| Error::unavailable("transaction has terminated"))?
    }

    /// Builds a CANCEL for this INVITE, to be sent through its own client
    /// transaction. Only valid while Calling or Proceeding.
    pub fn create_cancel(&self) -> Result<Request> {
        if !self.is_invite() {
            return Err(Error::invalid_state("only INVITE transactions can be cancelled"));
        }
        match self.state() {
            TransactionState::Calling | TransactionState::Proceeding => {
                utils::create_cancel(&self.inner.request)
            }
            state => Err(Error::invalid_state(format!(
                "cannot cancel INVITE in state {:?}",
                state
            ))),
        }
    }

    pub(crate) fn feed(&self, message: Message, source: SocketAddr, dialog: Option<Dialog>) {
        if self
            .inner
            .commands
            .send(Command::Message {
                message,
                source,
                dialog,
            })
            .is_err()
        {
            trace!(id = %self.inner.key, "Transaction gone, dropping message");
        }
    }

    pub(crate) fn ptr_eq(&self, other: &ClientTransaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ClientTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransaction")
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .field("destination", &self.inner.destination)
            .finish()
    }
}

struct ClientLogic {
    transaction: ClientTransaction,
    settings: TimerSettings,
    /// Current Timer A/E interval
    interval: Duration,
    /// ACK sent for a 300-699 response, re-sent on retransmissions
    ack: Option<Request>,
}

impl ClientLogic {
    fn deliver(
        &self,
        ctx: &TransactionContext,
        response: Response,
        source: SocketAddr,
        dialog: Option<Dialog>,
    ) {
        self.transaction.set_last_response(response.clone());
        ctx.emit(TransactionEvent::Response {
            transaction: self.transaction.clone(),
            response,
            source,
            dialog,
        });
    }

    async fn process_invite_response(
        &mut self,
        ctx: &TransactionContext,
        response: Response,
        source: SocketAddr,
        dialog: Option<Dialog>,
    ) -> Result<Option<TransactionState>> {
        let status = response.status;
        match ctx.state.get() {
            TransactionState::Calling | TransactionState::Proceeding => {
                if status.is_provisional() {
                    self.deliver(ctx, response, source, dialog);
                    Ok(Some(TransactionState::Proceeding))
                } else if status.is_success() {
                    self.deliver(ctx, response, source, dialog);
                    Ok(Some(TransactionState::Terminated))
                } else {
                    let ack = utils::create_ack_for_failure(self.transaction.request(), &response)?;
                    self.ack = Some(ack.clone());
                    self.deliver(ctx, response, source, dialog);
                    ctx.send(ack.into()).await?;
                    Ok(Some(TransactionState::Completed))
                }
            }
            TransactionState::Completed if status.is_final() && !status.is_success() => {
                if let Some(ack) = &self.ack {
                    trace!(id = %ctx.key, %status, "Final response retransmitted, re-sending ACK");
                    ctx.send(ack.clone().into()).await?;
                }
                Ok(None)
            }
            state => {
                trace!(id = %ctx.key, %status, ?state, "Absorbing response");
                Ok(None)
            }
        }
    }

    fn process_non_invite_response(
        &mut self,
        ctx: &TransactionContext,
        response: Response,
        source: SocketAddr,
        dialog: Option<Dialog>,
    ) -> Result<Option<TransactionState>> {
        let status = response.status;
        match ctx.state.get() {
            TransactionState::Trying | TransactionState::Proceeding => {
                self.deliver(ctx, response, source, dialog);
                if status.is_provisional() {
                    Ok(Some(TransactionState::Proceeding))
                } else {
                    Ok(Some(TransactionState::Completed))
                }
            }
            state => {
                trace!(id = %ctx.key, %status, ?state, "Absorbing response");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl TransactionLogic for ClientLogic {
    async fn start(
        &mut self,
        ctx: &TransactionContext,
        _timers: &mut TimerSet,
    ) -> Result<Option<TransactionState>> {
        if ctx.state.get() != TransactionState::Initial {
            return Err(Error::unavailable(format!("{} already started", ctx.key)));
        }
        ctx.send(self.transaction.request().clone().into()).await?;
        debug!(id = %ctx.key, destination = %ctx.remote, "Request sent");

        if ctx.kind.is_invite() {
            Ok(Some(TransactionState::Calling))
        } else {
            Ok(Some(TransactionState::Trying))
        }
    }

    async fn process_message(
        &mut self,
        ctx: &TransactionContext,
        _timers: &mut TimerSet,
        message: Message,
        source: SocketAddr,
        dialog: Option<Dialog>,
    ) -> Result<Option<TransactionState>> {
        let Message::Response(response) = message else {
            trace!(id = %ctx.key, "Client transaction ignoring request");
            return Ok(None);
        };

        if ctx.kind.is_invite() {
            self.process_invite_response(ctx, response, source, dialog)
                .await
        } else {
            self.process_non_invite_response(ctx, response, source, dialog)
        }
    }

    async fn handle_timer(
        &mut self,
        ctx: &TransactionContext,
        timers: &mut TimerSet,
        timer: TimerType,
    ) -> Result<Option<TransactionState>> {
        let state = ctx.state.get();
        match timer {
            TimerType::A if state == TransactionState::Calling => {
                ctx.send(self.transaction.request().clone().into()).await?;
                self.interval = self.settings.next_timer_a(self.interval);
                timers.start(TimerType::A, self.interval);
                Ok(None)
            }
            TimerType::E
                if matches!(state, TransactionState::Trying | TransactionState::Proceeding) =>
            {
                ctx.send(self.transaction.request().clone().into()).await?;
                self.interval = self
                    .settings
                    .next_timer_e(self.interval, state == TransactionState::Proceeding);
                timers.start(TimerType::E, self.interval);
                Ok(None)
            }
            TimerType::B | TimerType::F
                if matches!(
                    state,
                    TransactionState::Calling
                        | TransactionState::Trying
                        | TransactionState::Proceeding
                ) =>
            {
                ctx.emit_timeout(timer);
                Ok(Some(TransactionState::Terminated))
            }
            TimerType::D | TimerType::K => Ok(Some(TransactionState::Terminated)),
            _ => Ok(None),
        }
    }

    fn on_enter_state(
        &mut self,
        ctx: &TransactionContext,
        timers: &mut TimerSet,
        state: TransactionState,
    ) {
        match state {
            TransactionState::Calling => {
                self.interval = self.settings.t1;
                if !self.settings.reliable {
                    timers.start(TimerType::A, self.interval);
                }
                timers.start(TimerType::B, self.settings.timeout());
            }
            TransactionState::Trying => {
                self.interval = self.settings.t1;
                if !self.settings.reliable {
                    timers.start(TimerType::E, self.interval);
                }
                timers.start(TimerType::F, self.settings.timeout());
            }
            TransactionState::Proceeding if ctx.kind.is_invite() => {
                timers.cancel(TimerType::A);
            }
            TransactionState::Completed => {
                for timer in [TimerType::A, TimerType::B, TimerType::E, TimerType::F] {
                    timers.cancel(timer);
                }
                if ctx.kind.is_invite() {
                    timers.start(TimerType::D, self.settings.timer_d());
                } else {
                    timers.start(TimerType::K, self.settings.timer_k());
                }
            }
            _ => {}
        }
    }
}
