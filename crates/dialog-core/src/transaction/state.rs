//! Transaction states and the transition rules of RFC 3261 Section 17.
//!
//! The current state lives in an [`AtomicTransactionState`] shared between a
//! transaction's runner task (the only writer) and its handles, which read it
//! without going through the command channel.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::errors::{Error, Result};

/// State of a SIP transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransactionState {
    /// Created, request not sent yet (client only)
    Initial = 0,
    /// INVITE client, request sent
    Calling = 1,
    /// Non-INVITE client request sent, or non-INVITE server request received
    Trying = 2,
    Proceeding = 3,
    Completed = 4,
    /// INVITE server, ACK received
    Confirmed = 5,
    Terminated = 6,
}

impl TransactionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionState::Initial,
            1 => TransactionState::Calling,
            2 => TransactionState::Trying,
            3 => TransactionState::Proceeding,
            4 => TransactionState::Completed,
            5 => TransactionState::Confirmed,
            _ => TransactionState::Terminated,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The four RFC 3261 transaction state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    InviteClient,
    NonInviteClient,
    InviteServer,
    NonInviteServer,
}

impl TransactionKind {
    pub fn new(is_invite: bool, is_server: bool) -> Self {
        match (is_invite, is_server) {
            (true, false) => TransactionKind::InviteClient,
            (false, false) => TransactionKind::NonInviteClient,
            (true, true) => TransactionKind::InviteServer,
            (false, true) => TransactionKind::NonInviteServer,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, TransactionKind::InviteServer | TransactionKind::NonInviteServer)
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, TransactionKind::InviteClient | TransactionKind::InviteServer)
    }

    /// State a freshly created transaction of this kind starts in.
    pub fn initial_state(&self) -> TransactionState {
        match self {
            TransactionKind::InviteClient | TransactionKind::NonInviteClient => {
                TransactionState::Initial
            }
            TransactionKind::InviteServer => TransactionState::Proceeding,
            TransactionKind::NonInviteServer => TransactionState::Trying,
        }
    }
}

/// Lock-free holder for the current [`TransactionState`].
#[derive(Debug)]
pub struct AtomicTransactionState {
    value: AtomicU8,
}

impl AtomicTransactionState {
    pub fn new(state: TransactionState) -> Self {
        Self {
            value: AtomicU8::new(state as u8),
        }
    }

    pub fn get(&self) -> TransactionState {
        TransactionState::from_u8(self.value.load(Ordering::Acquire))
    }

    pub fn set(&self, state: TransactionState) {
        self.value.store(state as u8, Ordering::Release);
    }

    /// Checks a transition against the state machine of `kind`.
    ///
    /// Any live state may move to Terminated (transport errors, Timer B/F/H).
    pub fn validate_transition(
        kind: TransactionKind,
        from: TransactionState,
        to: TransactionState,
    ) -> Result<()> {
        use TransactionState::*;

        if from == Terminated {
            return Err(Error::invalid_state(format!(
                "{:?} transaction is already terminated",
                kind
            )));
        }
        if to == Terminated {
            return Ok(());
        }

        let allowed = match kind {
            TransactionKind::InviteClient => matches!(
                (from, to),
                (Initial, Calling)
                    | (Calling, Proceeding)
                    | (Calling, Completed)
                    | (Proceeding, Completed)
            ),
            TransactionKind::NonInviteClient => matches!(
                (from, to),
                (Initial, Trying)
                    | (Trying, Proceeding)
                    | (Trying, Completed)
                    | (Proceeding, Completed)
            ),
            TransactionKind::InviteServer => matches!(
                (from, to),
                (Proceeding, Completed) | (Completed, Confirmed)
            ),
            TransactionKind::NonInviteServer => matches!(
                (from, to),
                (Trying, Proceeding) | (Trying, Completed) | (Proceeding, Completed)
            ),
        };

        if allowed {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "invalid {:?} transition {:?} -> {:?}",
                kind, from, to
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransactionState::*;

    #[test]
    fn test_atomic_state_roundtrip() {
        let state = AtomicTransactionState::new(Initial);
        assert_eq!(state.get(), Initial);
        state.set(Completed);
        assert_eq!(state.get(), Completed);
    }

    #[test]
    fn test_invite_client_transitions() {
        let kind = TransactionKind::InviteClient;
        assert!(AtomicTransactionState::validate_transition(kind, Initial, Calling).is_ok());
        assert!(AtomicTransactionState::validate_transition(kind, Calling, Proceeding).is_ok());
        assert!(AtomicTransactionState::validate_transition(kind, Proceeding, Terminated).is_ok());
        assert!(AtomicTransactionState::validate_transition(kind, Completed, Proceeding).is_err());
        assert!(AtomicTransactionState::validate_transition(kind, Calling, Trying).is_err());
    }

    #[test]
    fn test_server_transitions() {
        let invite = TransactionKind::InviteServer;
        assert_eq!(invite.initial_state(), Proceeding);
        assert!(AtomicTransactionState::validate_transition(invite, Completed, Confirmed).is_ok());
        assert!(AtomicTransactionState::validate_transition(invite, Proceeding, Confirmed).is_err());

        let non_invite = TransactionKind::NonInviteServer;
        assert_eq!(non_invite.initial_state(), Trying);
        assert!(AtomicTransactionState::validate_transition(non_invite, Completed, Confirmed).is_err());
    }

    #[test]
    fn test_terminated_is_final() {
        for kind in [
            TransactionKind::InviteClient,
            TransactionKind::NonInviteClient,
            TransactionKind::InviteServer,
            TransactionKind::NonInviteServer,
        ] {
            assert!(AtomicTransactionState::validate_transition(kind, Terminated, Completed).is_err());
        }
    }
}
