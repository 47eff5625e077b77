//! # sipstack-sip-core
//!
//! SIP message model for the sipstack engine: methods, status codes, URIs,
//! the header values the transaction and dialog layers interpret, a
//! `nom`-based parser and an encoder.
//!
//! Headers are stored as text and parsed on demand. Only Via, From/To,
//! Call-ID, CSeq, Contact, Route/Record-Route, Max-Forwards and
//! Content-Length get typed accessors; all other headers pass through
//! verbatim.

pub mod builder;
pub mod error;
pub mod message;
pub mod parser;
pub mod types;

pub use error::{Error, Result};
pub use message::{HeaderAccess, Message, Request, Response};
pub use parser::parse_message;
pub use types::{
    Address, CSeq, Header, HeaderName, Headers, Method, Param, Params, Scheme, StatusCode, Uri,
    Via, BRANCH_MAGIC_COOKIE,
};

/// Everything needed to build, parse and inspect messages.
pub mod prelude {
    pub use crate::builder::{
        generate_branch, generate_call_id, generate_tag, RequestBuilder, ResponseBuilder,
    };
    pub use crate::error::{Error, Result};
    pub use crate::message::{HeaderAccess, Message, Request, Response};
    pub use crate::parser::parse_message;
    pub use crate::types::{
        Address, CSeq, Header, HeaderName, Headers, Method, Param, Params, Scheme, StatusCode, Uri,
        Via, BRANCH_MAGIC_COOKIE,
    };
}
