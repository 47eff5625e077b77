//! Dialog lifecycle states
//!
//! ```text
//! Early ──2xx──▶ Confirmed ──BYE/delete/timeout──▶ Terminated
//!   └────────3xx-6xx, 481/408, delete────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    /// Created by a tagged provisional response
    Early,
    /// A 2xx was sent or received
    Confirmed,
    Terminated,
}

impl DialogState {
    pub fn is_active(&self) -> bool {
        matches!(self, DialogState::Early | DialogState::Confirmed)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated)
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogState::Early => write!(f, "Early"),
            DialogState::Confirmed => write!(f, "Confirmed"),
            DialogState::Terminated => write!(f, "Terminated"),
        }
    }
}
