//! Server transactions (RFC 3261 Section 17.2).
//!
//! INVITE: Proceeding → Completed → Confirmed → Terminated, driven by Timers
//! G, H and I. A 2xx ends the transaction at once; its retransmission until
//! the ACK arrives is the dialog's job.
//!
//! Non-INVITE: Trying → Proceeding → Completed → Terminated, driven by
//! Timer J.
//!
//! Retransmitted requests never reach the TU again; they are answered with
//! the last response sent.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use sipstack_sip_core::builder::{generate_tag, ResponseBuilder};
use sipstack_sip_core::{HeaderAccess, Message, Method, Request, Response, StatusCode};

use crate::dialog::{Dialog, DialogId};
use crate::errors::{Error, Result};
use crate::provider::{dialog_layer, ProviderInner};
use crate::transaction::runner::{
    run_transaction_loop, Command, TransactionContext, TransactionLogic,
};
use crate::transaction::timer::{TimerSet, TimerSettings, TimerType, TRYING_TIMER_DELAY};
use crate::transaction::{
    AtomicTransactionState, SipTransaction, TransactionEvent, TransactionKey, TransactionKind,
    TransactionState,
};

/// Handle to a server transaction.
#[derive(Clone)]
pub struct ServerTransaction {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    key: TransactionKey,
    kind: TransactionKind,
    request: Request,
    source: SocketAddr,
    /// To tag added to responses when the request carried none
    local_tag: String,
    state: Arc<AtomicTransactionState>,
    commands: mpsc::UnboundedSender<Command>,
    dialog_id: Mutex<Option<DialogId>>,
    last_response: Mutex<Option<Response>>,
    provider: Weak<ProviderInner>,
}

impl ServerTransaction {
    /// Creates the transaction, registers it with the provider and starts
    /// its runner. With `deliver_request` the runner passes the first copy
    /// of the request it is fed to the TU.
    pub(crate) fn create(
        provider: &Arc<ProviderInner>,
        request: Request,
        source: SocketAddr,
        deliver_request: bool,
    ) -> Result<Self> {
        let key = TransactionKey::from_request(&request, true)?;
        let kind = TransactionKind::new(request.method.is_invite(), true);
        let (commands, receiver) = mpsc::unbounded_channel();
        let local_tag = request.to_tag().unwrap_or_else(generate_tag);

        let transaction = Self {
            inner: Arc::new(ServerInner {
                key: key.clone(),
                kind,
                request,
                source,
                local_tag,
                state: Arc::new(AtomicTransactionState::new(kind.initial_state())),
                commands: commands.clone(),
                dialog_id: Mutex::new(None),
                last_response: Mutex::new(None),
                provider: Arc::downgrade(provider),
            }),
        };
        provider.insert_transaction(SipTransaction::Server(transaction.clone()))?;
        provider.register_merge_key(&transaction);

        let settings = provider.timer_settings();
        let ctx = TransactionContext {
            key: key.clone(),
            kind,
            state: transaction.inner.state.clone(),
            transport: provider.transport.clone(),
            remote: source,
            events: provider.events_tx.clone(),
            transaction: SipTransaction::Server(transaction.clone()),
        };
        let logic = ServerLogic {
            transaction: transaction.clone(),
            settings,
            interval: settings.t1,
            deliver_request,
            auto_trying: provider.config.auto_100_trying,
        };
        tokio::spawn(run_transaction_loop(logic, ctx, receiver, commands));
        debug!(id = %key, %source, "Created server transaction");

        Ok(transaction)
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

    /// Address the request came from; responses go back there.
    pub fn source(&self) -> SocketAddr {
        self.inner.source
    }

    pub fn state(&self) -> TransactionState {
        self.inner.state.get()
    }

    /// To tag this transaction puts on its responses.
    pub fn local_tag(&self) -> &str {
        &self.inner.local_tag
    }

    pub fn dialog_id(&self) -> Option<DialogId> {
        *self.inner.dialog_id.lock()
    }

    pub fn last_response(&self) -> Option<Response> {
        self.inner.last_response.lock().clone()
    }

    pub(crate) fn set_dialog_id(&self, id: DialogId) {
        *self.inner.dialog_id.lock() = Some(id);
    }

    fn set_last_response(&self, response: Response) {
        *self.inner.last_response.lock() = Some(response);
    }

    /// Sends a response through the transaction.
    ///
    /// Responses other than 100 get the transaction's To tag when the request
    /// had none. Dialog-forming responses create or update the dialog before
    /// they hit the wire. Fails with [`Error::TransactionUnavailable`] after a
    /// final response was sent or the transaction terminated.
    pub async fn send_response(&self, mut response: Response) -> Result<()> {
        let state = self.state();
        if !matches!(state, TransactionState::Trying | TransactionState::Proceeding) {
            return Err(Error::unavailable(format!(
                "{} cannot send {} in state {:?}",
                self.inner.key, response.status, state
            )));
        }

        if response.status != StatusCode::TRYING
            && response.to_tag().is_none()
            && self.inner.request.to_tag().is_none()
        {
            response.set_to_tag(&self.inner.local_tag)?;
        }

        let provider = self.inner.provider.upgrade();
        let update = match &provider {
            Some(provider) => dialog_layer::on_server_response(provider, self, &response)?,
            None => None,
        };

        let (reply, result) = oneshot::channel();
        let outcome = match self.inner.commands.send(Command::Respond {
            response: response.clone(),
            reply,
        }) {
            Ok(()) => result
                .await
                .unwrap_or_else(|_| Err(Error::unavailable("transaction has terminated"))),
            Err(_) => Err(Error::unavailable("transaction has terminated")),
        };

        if let (Some(provider), Some(update)) = (&provider, update) {
            dialog_layer::after_server_response(provider, self, update, &response, outcome.is_ok());
        }
        outcome
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

    /// Ends the transaction without sending anything.
    pub fn terminate(&self) {
        let _ = self.inner.commands.send(Command::Terminate);
    }

    pub(crate) fn ptr_eq(&self, other: &ServerTransaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ServerTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTransaction")
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .field("source", &self.inner.source)
            .finish()
    }
}

struct ServerLogic {
    transaction: ServerTransaction,
    settings: TimerSettings,
    /// Current Timer G interval
    interval: Duration,
    /// First copy of the request still has to reach the TU
    deliver_request: bool,
    auto_trying: bool,
}

impl ServerLogic {
    async fn retransmit_last_response(&self, ctx: &TransactionContext) -> Result<()> {
        if let Some(response) = self.transaction.last_response() {
            debug!(id = %ctx.key, status = %response.status, "Request retransmitted, re-sending last response");
            ctx.send(response.into()).await?;
        } else {
            trace!(id = %ctx.key, "Request retransmitted before any response");
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionLogic for ServerLogic {
    async fn respond(
        &mut self,
        ctx: &TransactionContext,
        timers: &mut TimerSet,
        response: Response,
    ) -> Result<Option<TransactionState>> {
        let state = ctx.state.get();
        if !matches!(state, TransactionState::Trying | TransactionState::Proceeding) {
            return Err(Error::unavailable(format!(
                "{} cannot send {} in state {:?}",
                ctx.key, response.status, state
            )));
        }

        timers.cancel(TimerType::Trying);
        let status = response.status;
        ctx.send(response.clone().into()).await?;
        self.transaction.set_last_response(response);
        debug!(id = %ctx.key, %status, "Response sent");

        Ok(if status.is_provisional() {
            Some(TransactionState::Proceeding)
        } else if ctx.kind.is_invite() && status.is_success() {
            Some(TransactionState::Terminated)
        } else {
            Some(TransactionState::Completed)
        })
    }

    async fn process_message(
        &mut self,
        ctx: &TransactionContext,
        timers: &mut TimerSet,
        message: Message,
        source: SocketAddr,
        dialog: Option<Dialog>,
    ) -> Result<Option<TransactionState>> {
        let Message::Request(request) = message else {
            trace!(id = %ctx.key, "Server transaction ignoring response");
            return Ok(None);
        };
        let state = ctx.state.get();

        if request.method == Method::Ack {
            return Ok(match state {
                TransactionState::Completed if ctx.kind.is_invite() => {
                    debug!(id = %ctx.key, "ACK received");
                    Some(TransactionState::Confirmed)
                }
                _ => {
                    trace!(id = %ctx.key, ?state, "Absorbing ACK");
                    None
                }
            });
        }

        if self.deliver_request {
            self.deliver_request = false;
            if ctx.kind.is_invite() && self.auto_trying {
                timers.start(TimerType::Trying, TRYING_TIMER_DELAY);
            }
            ctx.emit(TransactionEvent::Request {
                transaction: self.transaction.clone(),
                request,
                source,
                dialog,
            });
            return Ok(None);
        }

        match state {
            TransactionState::Trying | TransactionState::Proceeding | TransactionState::Completed => {
                self.retransmit_last_response(ctx).await?;
            }
            _ => trace!(id = %ctx.key, ?state, "Absorbing retransmitted request"),
        }
        Ok(None)
    }

    async fn handle_timer(
        &mut self,
        ctx: &TransactionContext,
        timers: &mut TimerSet,
        timer: TimerType,
    ) -> Result<Option<TransactionState>> {
        let state = ctx.state.get();
        match timer {
            TimerType::Trying
                if state == TransactionState::Proceeding
                    && self.transaction.last_response().is_none() =>
            {
                let trying =
                    ResponseBuilder::from_request(self.transaction.request(), StatusCode::TRYING)
                        .build();
                ctx.send(trying.clone().into()).await?;
                self.transaction.set_last_response(trying);
                debug!(id = %ctx.key, "Sent automatic 100 Trying");
                Ok(None)
            }
            TimerType::G if state == TransactionState::Completed => {
                self.retransmit_last_response(ctx).await?;
                self.interval = self.settings.next_timer_g(self.interval);
                timers.start(TimerType::G, self.interval);
                Ok(None)
            }
            TimerType::H if state == TransactionState::Completed => {
                ctx.emit_timeout(timer);
                Ok(Some(TransactionState::Terminated))
            }
            TimerType::I if state == TransactionState::Confirmed => {
                Ok(Some(TransactionState::Terminated))
            }
            TimerType::J if state == TransactionState::Completed => {
                Ok(Some(TransactionState::Terminated))
            }
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
            TransactionState::Completed if ctx.kind.is_invite() => {
                self.interval = self.settings.t1;
                if !self.settings.reliable {
                    timers.start(TimerType::G, self.interval);
                }
                timers.start(TimerType::H, self.settings.timeout());
            }
            TransactionState::Completed => {
                timers.start(TimerType::J, self.settings.timer_j());
            }
            TransactionState::Confirmed => {
                timers.cancel(TimerType::G);
                timers.cancel(TimerType::H);
                timers.start(TimerType::I, self.settings.timer_i());
            }
            _ => {}
        }
    }
}
