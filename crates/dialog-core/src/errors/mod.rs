//! Error types for dialog-core
//!
//! One error enum covers the transaction layer, the dialog layer and the
//! provider. Failures from the message model and from the transport are
//! wrapped so callers can propagate them with `?`.

use thiserror::Error;

/// Result type for dialog-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the transaction and dialog engine
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or incomplete SIP message
    #[error("SIP message error: {0}")]
    Parse(#[from] sipstack_sip_core::Error),

    /// Transport failed to send, or is closed
    #[error("Transport error: {0}")]
    Transport(#[from] sipstack_sip_transport::Error),

    /// Operation on a transaction that was already used or has terminated
    #[error("Transaction unavailable: {0}")]
    TransactionUnavailable(String),

    /// Operation not permitted in the current state (double ACK, send on a
    /// terminated dialog, ...)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Host name resolution did not finish in time
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Dialog not found: {0}")]
    DialogNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Invalid configuration or API misuse at setup time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A transaction was driven through an operation its side never performs
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    pub(crate) fn unavailable(msg: impl Into<String>) -> Self {
        Error::TransactionUnavailable(msg.into())
    }

    /// True when the failure came from the transport layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_and_display() {
        let err: Error = sipstack_sip_core::Error::MissingHeader("Via".into()).into();
        assert!(matches!(err, Error::Parse(_)));
        assert!(err.to_string().contains("Via"));

        let err: Error = sipstack_sip_transport::Error::TransportClosed.into();
        assert!(err.is_transport());

        assert_eq!(
            Error::invalid_state("ACK already sent").to_string(),
            "Invalid state: ACK already sent"
        );
    }
}
