//! # sipstack dialog-core
//!
//! RFC 3261 transaction and dialog state-machine engine.
//!
//! ## Architecture Position
//!
//! ```text
//! transaction user (SipListener)
//!      ↓ ↑
//! provider / dispatch  ← matching, merge detection, stray messages
//!      ↓ ↑
//! dialog layer         ← Early → Confirmed → Terminated, forking, 2xx/ACK
//!      ↓ ↑
//! transaction layer    ← Timers A-K, retransmission, at-most-once delivery
//!      ↓ ↑
//! sip-transport (Network)
//! ```
//!
//! ## What This Crate Does
//!
//! - **Transactions**: client and server, INVITE and non-INVITE, each on its
//!   own task with generation-tagged timers
//! - **Dialogs**: creation from dialog-forming exchanges, CSeq sequencing,
//!   route sets, one dialog per fork of a forked INVITE
//! - **Reliability**: 2xx retransmission until ACK, ACK re-send for
//!   retransmitted 2xx, automatic `100 Trying`
//! - **Dispatch**: 481 for unknown dialogs and CANCELs, 482 for merged
//!   requests, 500 for stale CSeqs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sipstack_dialog_core::prelude::*;
//! use sipstack_sip_core::builder::ResponseBuilder;
//! use sipstack_sip_core::StatusCode;
//!
//! struct Answer;
//!
//! #[async_trait::async_trait]
//! impl SipListener for Answer {
//!     async fn on_event(&self, event: SipEvent) {
//!         if let SipEvent::Request(RequestEvent { request, server_transaction: Some(tx), .. }) = event {
//!             let ok = ResponseBuilder::from_request(&request, StatusCode::OK).build();
//!             let _ = tx.send_response(ok).await;
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let stack = SipStack::new(StackConfig::default())?;
//!     let point = stack
//!         .create_listening_point("0.0.0.0:5060".parse().unwrap(), TransportType::Udp)
//!         .await?;
//!     let provider = stack.create_provider(&point)?;
//!     provider.set_listener(Arc::new(Answer))?;
//!     tokio::signal::ctrl_c().await.ok();
//!     stack.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dialog;
pub mod errors;
pub mod events;
pub mod provider;
pub mod stack;
pub mod transaction;

pub use config::{DialogCleanupPolicy, StackConfig};
pub use dialog::{Dialog, DialogId, DialogKey, DialogState};
pub use errors::{Error, Result};
pub use events::{RequestEvent, ResponseEvent, SipEvent, SipListener, TimeoutEvent};
pub use provider::SipProvider;
pub use stack::{ListeningPoint, SipStack};
pub use transaction::{
    ClientTransaction, ServerTransaction, SipTransaction, TimerType, TransactionKey,
    TransactionState,
};

/// Re-exports for applications built on the stack
pub mod prelude {
    pub use crate::config::{DialogCleanupPolicy, StackConfig};
    pub use crate::dialog::{Dialog, DialogId, DialogKey, DialogState};
    pub use crate::errors::{Error, Result};
    pub use crate::events::{RequestEvent, ResponseEvent, SipEvent, SipListener, TimeoutEvent};
    pub use crate::provider::SipProvider;
    pub use crate::stack::{ListeningPoint, SipStack};
    pub use crate::transaction::{
        ClientTransaction, ServerTransaction, SipTransaction, TimerType, TransactionKey,
        TransactionState,
    };
    pub use sipstack_sip_transport::TransportType;
}
