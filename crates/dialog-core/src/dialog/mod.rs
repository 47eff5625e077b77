//! Core dialog types
//!
//! - [`DialogId`]: opaque UUID handle, stored by transactions as a
//!   non-owning link
//! - [`DialogKey`]: Call-ID plus local and remote tag, the wire identity
//! - [`Dialog`]: shared handle with state, CSeq sequencing and route set
//! - [`DialogState`]: Early, Confirmed, Terminated
//!
//! ## Dialog Lifecycle
//!
//! ```text
//!   (none) ──tagged 1xx──▶ Early ──2xx──▶ Confirmed ──BYE/delete──▶ Terminated
//!     └──────────────────2xx──────────────▲
//! ```
//!
//! Dialogs are created by the provider from dialog-forming exchanges, or
//! explicitly with [`SipProvider::get_new_dialog`](crate::provider::SipProvider::get_new_dialog).

pub mod dialog_id;
pub mod dialog_impl;
pub mod dialog_state;

pub use dialog_id::{DialogId, DialogKey};
pub use dialog_impl::Dialog;
pub use dialog_state::DialogState;
