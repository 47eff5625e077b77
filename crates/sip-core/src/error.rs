//! Error types for SIP message handling.

use thiserror::Error;

/// Result alias used throughout sip-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing, building or inspecting SIP messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The message could not be parsed.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A header value was syntactically invalid.
    #[error("Invalid {name} header: {reason}")]
    InvalidHeader { name: String, reason: String },

    /// A required header was absent.
    #[error("Missing required header: {0}")]
    MissingHeader(String),

    /// A URI could not be parsed.
    #[error("Invalid URI '{0}'")]
    InvalidUri(String),

    /// Unknown or malformed method token.
    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    /// Status code outside 100..=699.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// Header section was not valid UTF-8.
    #[error("Invalid UTF-8 in message: {0}")]
    Utf8(String),
}

impl Error {
    pub(crate) fn invalid_header(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidHeader {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::Utf8(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::ParseError(format!("invalid number: {}", err))
    }
}
