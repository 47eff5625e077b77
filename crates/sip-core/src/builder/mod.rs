//! # Message builders
//!
//! Fluent builders for requests and responses, plus generators for the
//! identifiers RFC 3261 requires to be globally unique (branch, tag,
//! Call-ID).
//!
//! ```rust
//! use sipstack_sip_core::prelude::*;
//!
//! let request = RequestBuilder::new(Method::Invite, "sip:bob@biloxi.com")
//!     .unwrap()
//!     .via(Via::new("UDP", "pc33.atlanta.com", Some(5060)).with_branch(generate_branch()))
//!     .from_address("sip:alice@atlanta.com".parse::<Address>().unwrap().with_tag(generate_tag()))
//!     .to_address("sip:bob@biloxi.com".parse().unwrap())
//!     .call_id(&generate_call_id("pc33.atlanta.com"))
//!     .cseq(1)
//!     .build();
//! assert!(request.validate().is_ok());
//!
//! let ringing = ResponseBuilder::from_request(&request, StatusCode::RINGING)
//!     .to_tag("a6c85cf")
//!     .build();
//! assert_eq!(ringing.to_tag().as_deref(), Some("a6c85cf"));
//! ```

use bytes::Bytes;
use rand::{distributions::Alphanumeric, Rng};
use uuid::Uuid;

use crate::error::Result;
use crate::message::{HeaderAccess, Request, Response};
use crate::types::{Address, CSeq, HeaderName, Method, StatusCode, Via, BRANCH_MAGIC_COOKIE};

/// New RFC 3261 branch (`z9hG4bK` + random).
pub fn generate_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, Uuid::new_v4().simple())
}

/// New From/To tag.
pub fn generate_tag() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

/// New Call-ID, optionally qualified with a host.
pub fn generate_call_id(host: &str) -> String {
    if host.is_empty() {
        Uuid::new_v4().simple().to_string()
    } else {
        format!("{}@{}", Uuid::new_v4().simple(), host)
    }
}

/// Builds a [`Request`]. Headers are emitted in the order they are added;
/// `cseq` uses the request method.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    pub fn new(method: Method, uri: &str) -> Result<Self> {
        Ok(Self {
            request: Request::new(method, uri.parse()?),
        })
    }

    pub fn via(mut self, via: Via) -> Self {
        self.request.headers.push(HeaderName::Via, via.to_string());
        self
    }

    pub fn from_address(mut self, from: Address) -> Self {
        self.request.headers.set(HeaderName::From, from.to_string());
        self
    }

    pub fn to_address(mut self, to: Address) -> Self {
        self.request.headers.set(HeaderName::To, to.to_string());
        self
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.request.headers.set(HeaderName::CallId, call_id);
        self
    }

    pub fn cseq(mut self, seq: u32) -> Self {
        let cseq = CSeq::new(seq, self.request.method.clone());
        self.request.headers.set(HeaderName::CSeq, cseq.to_string());
        self
    }

    pub fn contact(mut self, contact: Address) -> Self {
        self.request.headers.set(HeaderName::Contact, contact.to_string());
        self
    }

    pub fn max_forwards(mut self, hops: u32) -> Self {
        self.request.headers.set(HeaderName::MaxForwards, hops.to_string());
        self
    }

    /// Appends one Route entry.
    pub fn route(mut self, route: Address) -> Self {
        self.request.headers.push(HeaderName::Route, route.to_string());
        self
    }

    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.request.headers.push(name, value);
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.request.headers.set(HeaderName::ContentType, content_type);
        self.request.body = body.into();
        self
    }

    pub fn build(self) -> Request {
        self.request
    }
}

/// Builds a [`Response`] to a request, copying Via, From, To, Call-ID and
/// CSeq as RFC 3261 Section 8.2.6.2 requires.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    response: Response,
}

impl ResponseBuilder {
    pub fn from_request(request: &Request, status: StatusCode) -> Self {
        let mut response = Response::new(status);
        for via in request.headers.get_all(&HeaderName::Via) {
            response.headers.push(HeaderName::Via, via);
        }
        for name in [
            HeaderName::From,
            HeaderName::To,
            HeaderName::CallId,
            HeaderName::CSeq,
        ] {
            if let Some(value) = request.header(&name) {
                response.headers.push(name, value);
            }
        }
        Self { response }
    }

    /// Sets the To tag unless the request already carried one.
    pub fn to_tag(mut self, tag: &str) -> Self {
        if self.response.to_tag().is_none() {
            // Missing or malformed To leaves the response untouched.
            let _ = self.response.set_to_tag(tag);
        }
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.response.reason = reason.into();
        self
    }

    pub fn contact(mut self, contact: Address) -> Self {
        self.response.headers.set(HeaderName::Contact, contact.to_string());
        self
    }

    /// Copies the request's Record-Route entries (RFC 3261 Section 12.1.1).
    pub fn record_routes_from(mut self, request: &Request) -> Self {
        for rr in request.headers.get_all(&HeaderName::RecordRoute) {
            self.response.headers.push(HeaderName::RecordRoute, rr);
        }
        self
    }

    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.response.headers.push(name, value);
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.response.headers.set(HeaderName::ContentType, content_type);
        self.response.body = body.into();
        self
    }

    pub fn build(self) -> Response {
        self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> Request {
        RequestBuilder::new(Method::Invite, "sip:bob@biloxi.com")
            .unwrap()
            .via(Via::new("UDP", "pc33.atlanta.com", None).with_branch("z9hG4bK1"))
            .via(Via::new("UDP", "proxy.atlanta.com", None).with_branch("z9hG4bK0"))
            .from_address("<sip:alice@atlanta.com>;tag=abc".parse().unwrap())
            .to_address("<sip:bob@biloxi.com>".parse().unwrap())
            .call_id("call-1")
            .cseq(7)
            .header(HeaderName::RecordRoute, "<sip:p1.example.com;lr>")
            .build()
    }

    #[test]
    fn test_generated_identifiers() {
        let branch = generate_branch();
        assert!(branch.starts_with(BRANCH_MAGIC_COOKIE));
        assert_ne!(branch, generate_branch());
        assert_eq!(generate_tag().len(), 10);
        assert!(generate_call_id("host").ends_with("@host"));
    }

    #[test]
    fn test_response_copies_identity_headers() {
        let request = invite();
        let response = ResponseBuilder::from_request(&request, StatusCode::OK)
            .to_tag("xyz")
            .record_routes_from(&request)
            .build();
        assert_eq!(response.vias().unwrap().len(), 2);
        assert_eq!(response.call_id(), Some("call-1"));
        assert_eq!(response.cseq().unwrap(), CSeq::new(7, Method::Invite));
        assert_eq!(response.to_tag().as_deref(), Some("xyz"));
        assert_eq!(response.record_routes().unwrap().len(), 1);
        assert!(response.validate().is_ok());
    }

    #[test]
    fn test_existing_to_tag_is_kept() {
        let mut request = invite();
        request.set_to_tag("first").unwrap();
        let response = ResponseBuilder::from_request(&request, StatusCode::OK)
            .to_tag("second")
            .build();
        assert_eq!(response.to_tag().as_deref(), Some("first"));
    }
}
