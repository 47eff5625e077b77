//! # Transaction layer
//!
//! RFC 3261 Section 17 client and server transactions. Each transaction runs
//! as its own tokio task (see [`runner`]) fed by an unbounded command channel:
//! inbound messages, timer firings and TU sends are all serialized through it,
//! so the state machine has a single writer and needs no lock.
//!
//! Handles ([`ClientTransaction`], [`ServerTransaction`]) are cheap clones that
//! read the current state atomically and post commands to the runner.
//!
//! ```text
//!  provider ──Message──▶ ┌────────┐ ──send──▶ transport
//!  TU ───Start/Respond─▶ │ runner │
//!  TimerSet ───Timer───▶ └────────┘ ──TransactionEvent──▶ provider task
//! ```

pub mod client;
pub mod key;
pub(crate) mod runner;
pub mod server;
pub mod state;
pub mod timer;
pub mod utils;

use std::net::SocketAddr;

use sipstack_sip_core::{Request, Response};

use crate::dialog::{Dialog, DialogId};

pub use client::ClientTransaction;
pub use key::TransactionKey;
pub use server::ServerTransaction;
pub use state::{AtomicTransactionState, TransactionKind, TransactionState};
pub use timer::{TimerSettings, TimerType};

/// Either side of a transaction
#[derive(Debug, Clone)]
pub enum SipTransaction {
    Client(ClientTransaction),
    Server(ServerTransaction),
}

impl SipTransaction {
    pub fn key(&self) -> &TransactionKey {
        match self {
            SipTransaction::Client(tx) => tx.key(),
            SipTransaction::Server(tx) => tx.key(),
        }
    }

    pub fn state(&self) -> TransactionState {
        match self {
            SipTransaction::Client(tx) => tx.state(),
            SipTransaction::Server(tx) => tx.state(),
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, SipTransaction::Server(_))
    }

    /// The request that created the transaction.
    pub fn request(&self) -> &Request {
        match self {
            SipTransaction::Client(tx) => tx.request(),
            SipTransaction::Server(tx) => tx.request(),
        }
    }

    pub fn dialog_id(&self) -> Option<DialogId> {
        match self {
            SipTransaction::Client(tx) => tx.dialog_id(),
            SipTransaction::Server(tx) => tx.dialog_id(),
        }
    }

    pub fn as_client(&self) -> Option<&ClientTransaction> {
        match self {
            SipTransaction::Client(tx) => Some(tx),
            SipTransaction::Server(_) => None,
        }
    }

    pub fn as_server(&self) -> Option<&ServerTransaction> {
        match self {
            SipTransaction::Server(tx) => Some(tx),
            SipTransaction::Client(_) => None,
        }
    }

    /// True when both handles refer to the same transaction instance.
    pub fn ptr_eq(&self, other: &SipTransaction) -> bool {
        match (self, other) {
            (SipTransaction::Client(a), SipTransaction::Client(b)) => a.ptr_eq(b),
            (SipTransaction::Server(a), SipTransaction::Server(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<ClientTransaction> for SipTransaction {
    fn from(tx: ClientTransaction) -> Self {
        SipTransaction::Client(tx)
    }
}

impl From<ServerTransaction> for SipTransaction {
    fn from(tx: ServerTransaction) -> Self {
        SipTransaction::Server(tx)
    }
}

/// What a transaction runner reports to its provider.
#[derive(Debug)]
pub(crate) enum TransactionEvent {
    /// First receipt of the request that created a server transaction
    Request {
        transaction: ServerTransaction,
        request: Request,
        source: SocketAddr,
        dialog: Option<Dialog>,
    },
    /// Response to pass up to the TU
    Response {
        transaction: ClientTransaction,
        response: Response,
        source: SocketAddr,
        dialog: Option<Dialog>,
    },
    Timeout {
        transaction: SipTransaction,
        timer: TimerType,
    },
    TransportError {
        transaction: SipTransaction,
        destination: SocketAddr,
        error: String,
    },
    Terminated {
        transaction: SipTransaction,
    },
}
