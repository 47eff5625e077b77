//! Events delivered to the transaction user.
//!
//! Every provider has exactly one [`SipListener`]. Events arrive in order on a
//! dedicated task, so a listener may call back into the provider (send a
//! response, create a dialog request, ...) from inside [`SipListener::on_event`].

use std::net::SocketAddr;

use async_trait::async_trait;

use sipstack_sip_core::{Request, Response};

use crate::dialog::Dialog;
use crate::transaction::{ClientTransaction, ServerTransaction, SipTransaction, TimerType};

/// An incoming request.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub request: Request,
    pub source: SocketAddr,
    /// `None` for ACKs and when automatic transaction creation is disabled
    pub server_transaction: Option<ServerTransaction>,
    pub dialog: Option<Dialog>,
}

/// An incoming response.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub response: Response,
    pub source: SocketAddr,
    /// `None` for forked 2xx responses that arrive after the INVITE client
    /// transaction terminated
    pub client_transaction: Option<ClientTransaction>,
    pub dialog: Option<Dialog>,
}

/// A transaction timer expired without the expected message.
#[derive(Debug, Clone)]
pub struct TimeoutEvent {
    pub transaction: SipTransaction,
    /// B, F or H
    pub timer: TimerType,
}

/// Everything the stack reports to the transaction user
#[derive(Debug, Clone)]
pub enum SipEvent {
    Request(RequestEvent),
    Response(ResponseEvent),
    Timeout(TimeoutEvent),
    TransportError {
        transaction: Option<SipTransaction>,
        destination: SocketAddr,
        error: String,
    },
    DialogTerminated {
        dialog: Dialog,
        reason: String,
    },
    TransactionTerminated {
        transaction: SipTransaction,
    },
    /// A UAS dialog never received the ACK for its 2xx. Only listeners that
    /// return true from [`SipListener::handles_dialog_timeout`] see this;
    /// others get a [`SipEvent::DialogTerminated`] instead.
    DialogTimeout {
        dialog: Dialog,
        reason: String,
    },
}

impl SipEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SipEvent::Request(_) => "request",
            SipEvent::Response(_) => "response",
            SipEvent::Timeout(_) => "timeout",
            SipEvent::TransportError { .. } => "transport_error",
            SipEvent::DialogTerminated { .. } => "dialog_terminated",
            SipEvent::TransactionTerminated { .. } => "transaction_terminated",
            SipEvent::DialogTimeout { .. } => "dialog_timeout",
        }
    }
}

/// The transaction user.
#[async_trait]
pub trait SipListener: Send + Sync {
    async fn on_event(&self, event: SipEvent);

    /// Opt in to [`SipEvent::DialogTimeout`].
    fn handles_dialog_timeout(&self) -> bool {
        false
    }
}
