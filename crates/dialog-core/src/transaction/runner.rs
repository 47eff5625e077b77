/// # Transaction Runner
///
/// The event loop shared by all four RFC 3261 transaction state machines.
/// Each transaction runs this loop on its own tokio task:
/// 1. receive a command (TU send, inbound message, timer firing)
/// 2. hand it to the transaction-specific [`TransactionLogic`]
/// 3. apply the state transition the logic asks for, after validating it
/// 4. let the logic start or stop timers for the new state
///
/// Transport failures reported by the logic are handled here once for all
/// transaction kinds: the TU gets a transport error event and the
/// transaction terminates. When the loop ends the provider is told so it can
/// drop the transaction from its tables.
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use sipstack_sip_core::{Message, Response};
use sipstack_sip_transport::Transport;

use crate::dialog::Dialog;
use crate::errors::{Error, Result};
use crate::provider::ProviderEvent;
use crate::transaction::timer::{TimerSet, TimerType};
use crate::transaction::{
    AtomicTransactionState, SipTransaction, TransactionEvent, TransactionKey, TransactionKind,
    TransactionState,
};

/// Commands processed by a transaction's runner task.
pub(crate) enum Command {
    /// Send the initial request (client)
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Send a response from the TU (server)
    Respond {
        response: Response,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Inbound request or response matched to this transaction
    Message {
        message: Message,
        source: SocketAddr,
        dialog: Option<Dialog>,
    },
    Timer {
        timer: TimerType,
        generation: u64,
    },
    Terminate,
}

/// Everything a [`TransactionLogic`] needs besides its own state.
pub(crate) struct TransactionContext {
    pub key: TransactionKey,
    pub kind: TransactionKind,
    pub state: Arc<AtomicTransactionState>,
    pub transport: Arc<dyn Transport>,
    /// Where requests (client) or responses (server) are sent
    pub remote: SocketAddr,
    pub events: mpsc::UnboundedSender<ProviderEvent>,
    pub transaction: SipTransaction,
}

impl TransactionContext {
    pub async fn send(&self, message: Message) -> Result<()> {
        self.transport.send_message(message, self.remote).await?;
        Ok(())
    }

    pub fn emit(&self, event: TransactionEvent) {
        if self.events.send(ProviderEvent::Transaction(event)).is_err() {
            trace!(id = %self.key, "Provider gone, dropping transaction event");
        }
    }

    pub fn emit_timeout(&self, timer: TimerType) {
        warn!(id = %self.key, %timer, "Transaction timed out");
        self.emit(TransactionEvent::Timeout {
            transaction: self.transaction.clone(),
            timer,
        });
    }
}

/// Transaction-specific behaviour driven by [`run_transaction_loop`].
///
/// Each handler returns the state to move to, if any. Returning
/// `Err(Error::Transport(_))` terminates the transaction.
#[async_trait]
pub(crate) trait TransactionLogic: Send + 'static {
    async fn start(
        &mut self,
        _ctx: &TransactionContext,
        _timers: &mut TimerSet,
    ) -> Result<Option<TransactionState>> {
        Err(Error::Internal("server transactions are started by the provider".into()))
    }

    async fn respond(
        &mut self,
        _ctx: &TransactionContext,
        _timers: &mut TimerSet,
        _response: Response,
    ) -> Result<Option<TransactionState>> {
        Err(Error::Internal("client transactions cannot send responses".into()))
    }

    async fn process_message(
        &mut self,
        ctx: &TransactionContext,
        timers: &mut TimerSet,
        message: Message,
        source: SocketAddr,
        dialog: Option<Dialog>,
    ) -> Result<Option<TransactionState>>;

    async fn handle_timer(
        &mut self,
        ctx: &TransactionContext,
        timers: &mut TimerSet,
        timer: TimerType,
    ) -> Result<Option<TransactionState>>;

    /// Starts and cancels timers on entry to `state`.
    fn on_enter_state(
        &mut self,
        ctx: &TransactionContext,
        timers: &mut TimerSet,
        state: TransactionState,
    );
}

/// Runs a transaction until it reaches Terminated.
pub(crate) async fn run_transaction_loop<L: TransactionLogic>(
    mut logic: L,
    ctx: TransactionContext,
    mut commands: mpsc::UnboundedReceiver<Command>,
    timer_commands: mpsc::UnboundedSender<Command>,
) {
    let mut timers = TimerSet::new(timer_commands);
    debug!(id = %ctx.key, state = ?ctx.state.get(), "Transaction loop starting");

    while let Some(command) = commands.recv().await {
        match command {
            Command::Start { reply } => {
                let outcome = logic.start(&ctx, &mut timers).await;
                let _ = reply.send(apply(&mut logic, &ctx, &mut timers, outcome));
            }
            Command::Respond { response, reply } => {
                let outcome = logic.respond(&ctx, &mut timers, response).await;
                let _ = reply.send(apply(&mut logic, &ctx, &mut timers, outcome));
            }
            Command::Message {
                message,
                source,
                dialog,
            } => {
                let outcome = logic
                    .process_message(&ctx, &mut timers, message, source, dialog)
                    .await;
                if let Err(e) = apply(&mut logic, &ctx, &mut timers, outcome) {
                    debug!(id = %ctx.key, error = %e, "Message processing failed");
                }
            }
            Command::Timer { timer, generation } => {
                if !timers.take_fired(timer, generation) {
                    trace!(id = %ctx.key, %timer, generation, "Ignoring superseded timer");
                    continue;
                }
                debug!(id = %ctx.key, %timer, state = ?ctx.state.get(), "Timer fired");
                let outcome = logic.handle_timer(&ctx, &mut timers, timer).await;
                if let Err(e) = apply(&mut logic, &ctx, &mut timers, outcome) {
                    debug!(id = %ctx.key, %timer, error = %e, "Timer handling failed");
                }
            }
            Command::Terminate => {
                transition(&mut logic, &ctx, &mut timers, TransactionState::Terminated);
            }
        }

        if ctx.state.get() == TransactionState::Terminated {
            break;
        }
    }

    timers.cancel_all();
    ctx.state.set(TransactionState::Terminated);
    debug!(id = %ctx.key, "Transaction loop ended");
    ctx.emit(TransactionEvent::Terminated {
        transaction: ctx.transaction.clone(),
    });
}

fn apply<L: TransactionLogic>(
    logic: &mut L,
    ctx: &TransactionContext,
    timers: &mut TimerSet,
    outcome: Result<Option<TransactionState>>,
) -> Result<()> {
    match outcome {
        Ok(Some(next)) => {
            transition(logic, ctx, timers, next);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(Error::Transport(error)) => {
            warn!(id = %ctx.key, destination = %ctx.remote, %error, "Transport error");
            ctx.emit(TransactionEvent::TransportError {
                transaction: ctx.transaction.clone(),
                destination: ctx.remote,
                error: error.to_string(),
            });
            transition(logic, ctx, timers, TransactionState::Terminated);
            Err(Error::Transport(error))
        }
        Err(e) => Err(e),
    }
}

fn transition<L: TransactionLogic>(
    logic: &mut L,
    ctx: &TransactionContext,
    timers: &mut TimerSet,
    next: TransactionState,
) {
    let current = ctx.state.get();
    if current == next {
        return;
    }
    if let Err(e) = AtomicTransactionState::validate_transition(ctx.kind, current, next) {
        warn!(id = %ctx.key, error = %e, "Rejected state transition");
        return;
    }

    ctx.state.set(next);
    debug!(id = %ctx.key, from = ?current, to = ?next, "State transition");
    if next == TransactionState::Terminated {
        timers.cancel_all();
    } else {
        logic.on_enter_state(ctx, timers, next);
    }
}
