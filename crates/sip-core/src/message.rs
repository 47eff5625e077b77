//! # SIP Messages
//!
//! [`Request`] and [`Response`] hold their start line, an ordered
//! [`Headers`] list and a [`Bytes`] body. Headers are kept as text and
//! interpreted on demand through [`HeaderAccess`], so headers the engine
//! does not understand survive a parse/encode cycle untouched.
//!
//! ```rust
//! use sipstack_sip_core::prelude::*;
//!
//! let raw = b"OPTIONS sip:bob@biloxi.com SIP/2.0\r\n\
//! Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKhjhs8ass877\r\n\
//! To: <sip:bob@biloxi.com>\r\n\
//! From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
//! Call-ID: a84b4c76e66710\r\n\
//! CSeq: 63104 OPTIONS\r\n\
//! Content-Length: 0\r\n\r\n";
//!
//! let message = parse_message(raw).unwrap();
//! let request = message.as_request().unwrap();
//! assert_eq!(request.method, Method::Options);
//! assert_eq!(request.from_tag().as_deref(), Some("1928301774"));
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Address, CSeq, HeaderName, Headers, Method, StatusCode, Uri, Via};

/// Read/write access to the headers every SIP message carries.
///
/// Parsed accessors return `Err(MissingHeader)` when the header is absent and
/// `Err(InvalidHeader)` when it is present but malformed.
pub trait HeaderAccess {
    fn headers(&self) -> &Headers;
    fn headers_mut(&mut self) -> &mut Headers;

    fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers().get(name)
    }

    fn call_id(&self) -> Option<&str> {
        self.header(&HeaderName::CallId).map(str::trim)
    }

    fn from_header(&self) -> Result<Address> {
        parse_required(self.headers(), HeaderName::From)
    }

    fn to_header(&self) -> Result<Address> {
        parse_required(self.headers(), HeaderName::To)
    }

    fn from_tag(&self) -> Option<String> {
        self.from_header().ok().and_then(|a| a.tag().map(str::to_string))
    }

    fn to_tag(&self) -> Option<String> {
        self.to_header().ok().and_then(|a| a.tag().map(str::to_string))
    }

    fn cseq(&self) -> Result<CSeq> {
        parse_required(self.headers(), HeaderName::CSeq)
    }

    fn top_via(&self) -> Result<Via> {
        parse_required(self.headers(), HeaderName::Via)
    }

    fn vias(&self) -> Result<Vec<Via>> {
        self.headers()
            .get_all(&HeaderName::Via)
            .map(|v| v.parse())
            .collect()
    }

    fn contact(&self) -> Option<Address> {
        self.header(&HeaderName::Contact)
            .and_then(|v| v.trim().parse().ok())
    }

    fn routes(&self) -> Result<Vec<Address>> {
        self.headers()
            .get_all(&HeaderName::Route)
            .map(|v| v.parse())
            .collect()
    }

    fn record_routes(&self) -> Result<Vec<Address>> {
        self.headers()
            .get_all(&HeaderName::RecordRoute)
            .map(|v| v.parse())
            .collect()
    }

    fn max_forwards(&self) -> Option<u32> {
        self.header(&HeaderName::MaxForwards)
            .and_then(|v| v.trim().parse().ok())
    }

    /// Sets (or replaces) the To tag.
    fn set_to_tag(&mut self, tag: &str) -> Result<()> {
        let mut to = self.to_header()?;
        to.set_tag(tag);
        self.headers_mut().set_first(&HeaderName::To, to.to_string());
        Ok(())
    }

    /// Replaces the topmost Via.
    fn set_top_via(&mut self, via: &Via) {
        if !self.headers_mut().set_first(&HeaderName::Via, via.to_string()) {
            self.headers_mut().push(HeaderName::Via, via.to_string());
        }
    }
}

fn parse_required<T>(headers: &Headers, name: HeaderName) -> Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    headers
        .get(&name)
        .ok_or_else(|| Error::MissingHeader(name.to_string()))?
        .parse()
}

/// A SIP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Checks the mandatory headers of RFC 3261 Section 8.1.1 and that the
    /// CSeq method matches the request method.
    pub fn validate(&self) -> Result<()> {
        validate_common(&self.headers)?;
        let cseq = self.cseq()?;
        if cseq.method != self.method {
            return Err(Error::invalid_header(
                "CSeq",
                format!("method {} does not match request method {}", cseq.method, self.method),
            ));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Bytes {
        let start = format!("{} {} SIP/2.0", self.method, self.uri);
        encode(&start, &self.headers, &self.body)
    }
}

impl HeaderAccess for Request {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// A SIP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: status.reason_phrase().to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(&self.headers)
    }

    pub fn to_bytes(&self) -> Bytes {
        let start = format!("SIP/2.0 {} {}", self.status, self.reason);
        encode(&start, &self.headers, &self.body)
    }
}

impl HeaderAccess for Response {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// Either kind of SIP message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(r) => Some(r),
            Message::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Response(r) => Some(r),
            Message::Request(_) => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Message::Request(r) => r.validate(),
            Message::Response(r) => r.validate(),
        }
    }

    /// Encodes the message, always emitting a correct Content-Length.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Message::Request(r) => r.to_bytes(),
            Message::Response(r) => r.to_bytes(),
        }
    }
}

impl HeaderAccess for Message {
    fn headers(&self) -> &Headers {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }

    fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Message::Request(r) => &mut r.headers,
            Message::Response(r) => &mut r.headers,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(r) => r.fmt(f),
            Message::Response(r) => r.fmt(f),
        }
    }
}

fn validate_common(headers: &Headers) -> Result<()> {
    for name in [
        HeaderName::Via,
        HeaderName::From,
        HeaderName::To,
        HeaderName::CallId,
        HeaderName::CSeq,
    ] {
        if !headers.contains(&name) {
            return Err(Error::MissingHeader(name.to_string()));
        }
    }
    headers
        .get(&HeaderName::Via)
        .unwrap_or_default()
        .parse::<Via>()?;
    headers
        .get(&HeaderName::CSeq)
        .unwrap_or_default()
        .parse::<CSeq>()?;
    headers
        .get(&HeaderName::From)
        .unwrap_or_default()
        .parse::<Address>()?;
    headers
        .get(&HeaderName::To)
        .unwrap_or_default()
        .parse::<Address>()?;
    Ok(())
}

fn encode(start_line: &str, headers: &Headers, body: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(512 + body.len());
    buf.put_slice(start_line.as_bytes());
    buf.put_slice(b"\r\n");
    let content_length = format!("Content-Length: {}\r\n", body.len());
    let mut length_written = false;
    for header in headers.iter() {
        if header.name == HeaderName::ContentLength {
            // Keep the position of an existing header but always write the real length.
            if !length_written {
                buf.put_slice(content_length.as_bytes());
                length_written = true;
            }
            continue;
        }
        buf.put_slice(header.to_string().as_bytes());
        buf.put_slice(b"\r\n");
    }
    if !length_written {
        buf.put_slice(content_length.as_bytes());
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Request {
        let mut request = Request::new(Method::Invite, "sip:bob@biloxi.com".parse().unwrap());
        request
            .headers
            .push(HeaderName::Via, "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776");
        request.headers.push(HeaderName::To, "Bob <sip:bob@biloxi.com>");
        request
            .headers
            .push(HeaderName::From, "Alice <sip:alice@atlanta.com>;tag=1928");
        request.headers.push(HeaderName::CallId, "a84b4c76e66710");
        request.headers.push(HeaderName::CSeq, "1 INVITE");
        request
    }

    #[test]
    fn test_accessors() {
        let request = sample_request();
        assert_eq!(request.call_id(), Some("a84b4c76e66710"));
        assert_eq!(request.from_tag().as_deref(), Some("1928"));
        assert_eq!(request.to_tag(), None);
        assert_eq!(request.cseq().unwrap(), CSeq::new(1, Method::Invite));
        assert_eq!(request.top_via().unwrap().branch(), Some("z9hG4bK776"));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_set_to_tag() {
        let mut request = sample_request();
        request.set_to_tag("314159").unwrap();
        assert_eq!(request.to_tag().as_deref(), Some("314159"));
    }

    #[test]
    fn test_validate_cseq_method_mismatch() {
        let mut request = sample_request();
        request.headers.set(HeaderName::CSeq, "1 BYE");
        assert!(matches!(request.validate(), Err(Error::InvalidHeader { .. })));
    }

    #[test]
    fn test_validate_missing_header() {
        let mut request = sample_request();
        request.headers.remove_all(&HeaderName::CallId);
        assert_eq!(
            request.validate(),
            Err(Error::MissingHeader("Call-ID".to_string()))
        );
    }

    #[test]
    fn test_encode_sets_content_length() {
        let mut request = sample_request();
        request.headers.push(HeaderName::ContentLength, "999");
        request.body = Bytes::from_static(b"hello");
        let text = String::from_utf8(request.to_bytes().to_vec()).unwrap();
        assert!(text.starts_with("INVITE sip:bob@biloxi.com SIP/2.0\r\n"));
        assert!(text.contains("Content-Length: 5\r\n\r\nhello"));
        assert!(!text.contains("999"));
    }
}
