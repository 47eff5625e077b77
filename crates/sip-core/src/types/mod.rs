//! Structured SIP values: methods, status codes, URIs, name-addr values,
//! Via entries, CSeq and the header container.

pub mod address;
pub mod cseq;
pub mod header;
pub mod method;
pub mod param;
pub mod status;
pub mod uri;
pub mod via;

pub use address::Address;
pub use cseq::CSeq;
pub use header::{Header, HeaderName, Headers};
pub use method::Method;
pub use param::{Param, Params};
pub use status::StatusCode;
pub use uri::{Scheme, Uri};
pub use via::{Via, BRANCH_MAGIC_COOKIE};
