//! # Headers
//!
//! Header names are case-insensitive and several have compact forms
//! (RFC 3261 Section 7.3.3). Only the names the engine interprets get a
//! dedicated variant; everything else is carried verbatim in
//! [`HeaderName::Other`].
//!
//! [`Headers`] keeps header lines in wire order. Multi-valued headers
//! (Via, Route, Record-Route, Contact) are stored one value per entry so
//! the topmost value is always the first matching entry.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// SIP header names known to the engine.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub enum HeaderName {
    Via,
    From,
    To,
    CallId,
    CSeq,
    Contact,
    MaxForwards,
    Route,
    RecordRoute,
    ContentLength,
    ContentType,
    UserAgent,
    Allow,
    Supported,
    Expires,
    Event,
    /// Any other header, spelled as received.
    Other(String),
}

impl HeaderName {
    pub fn as_str(&self) -> &str {
        match self {
            HeaderName::Via => "Via",
            HeaderName::From => "From",
            HeaderName::To => "To",
            HeaderName::CallId => "Call-ID",
            HeaderName::CSeq => "CSeq",
            HeaderName::Contact => "Contact",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::Route => "Route",
            HeaderName::RecordRoute => "Record-Route",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::ContentType => "Content-Type",
            HeaderName::UserAgent => "User-Agent",
            HeaderName::Allow => "Allow",
            HeaderName::Supported => "Supported",
            HeaderName::Expires => "Expires",
            HeaderName::Event => "Event",
            HeaderName::Other(name) => name,
        }
    }

    /// Headers whose values may be comma-joined on one line.
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            HeaderName::Via | HeaderName::Route | HeaderName::RecordRoute | HeaderName::Contact
        )
    }
}

impl PartialEq for HeaderName {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HeaderName::Other(a), HeaderName::Other(b)) => a.eq_ignore_ascii_case(b),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

impl Hash for HeaderName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        if let HeaderName::Other(name) = self {
            for b in name.bytes() {
                state.write_u8(b.to_ascii_lowercase());
            }
        }
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeaderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.chars().any(|c| c.is_ascii_whitespace() || c == ':') {
            return Err(Error::invalid_header(s, "invalid header name"));
        }
        let name = match s.to_ascii_lowercase().as_str() {
            "via" | "v" => HeaderName::Via,
            "from" | "f" => HeaderName::From,
            "to" | "t" => HeaderName::To,
            "call-id" | "i" => HeaderName::CallId,
            "cseq" => HeaderName::CSeq,
            "contact" | "m" => HeaderName::Contact,
            "max-forwards" => HeaderName::MaxForwards,
            "route" => HeaderName::Route,
            "record-route" => HeaderName::RecordRoute,
            "content-length" | "l" => HeaderName::ContentLength,
            "content-type" | "c" => HeaderName::ContentType,
            "user-agent" => HeaderName::UserAgent,
            "allow" => HeaderName::Allow,
            "supported" | "k" => HeaderName::Supported,
            "expires" => HeaderName::Expires,
            "event" | "o" => HeaderName::Event,
            _ => HeaderName::Other(s.to_string()),
        };
        Ok(name)
    }
}

/// A single header line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: HeaderName,
    pub value: String,
}

impl Header {
    pub fn new(name: HeaderName, value: impl Into<String>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Ordered header list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// First value of `name`.
    pub fn get(&self, name: &HeaderName) -> Option<&str> {
        self.0
            .iter()
            .find(|h| &h.name == name)
            .map(|h| h.value.as_str())
    }

    /// All values of `name` in wire order.
    pub fn get_all<'a>(&'a self, name: &'a HeaderName) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |h| &h.name == name)
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &HeaderName) -> bool {
        self.0.iter().any(|h| &h.name == name)
    }

    /// Appends a header line.
    pub fn push(&mut self, name: HeaderName, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    /// Inserts before the first existing line with the same name, or appends.
    pub fn insert_front(&mut self, name: HeaderName, value: impl Into<String>) {
        let header = Header::new(name, value);
        match self.0.iter().position(|h| h.name == header.name) {
            Some(idx) => self.0.insert(idx, header),
            None => self.0.push(header),
        }
    }

    /// Removes every line with `name`, returning how many were removed.
    pub fn remove_all(&mut self, name: &HeaderName) -> usize {
        let before = self.0.len();
        self.0.retain(|h| &h.name != name);
        before - self.0.len()
    }

    /// Removes the first line with `name` and returns its value.
    pub fn remove_first(&mut self, name: &HeaderName) -> Option<String> {
        let idx = self.0.iter().position(|h| &h.name == name)?;
        Some(self.0.remove(idx).value)
    }

    /// Replaces the first value of `name` (keeping its position) and drops
    /// any further values; appends when absent.
    pub fn set(&mut self, name: HeaderName, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|h| h.name == name) {
            Some(idx) => {
                self.0[idx].value = value;
                let mut seen = 0usize;
                self.0.retain(|h| {
                    if h.name == name {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.0.push(Header::new(name, value)),
        }
    }

    /// Replaces the first value of `name` only, keeping the rest.
    pub fn set_first(&mut self, name: &HeaderName, value: impl Into<String>) -> bool {
        match self.0.iter_mut().find(|h| &h.name == name) {
            Some(header) => {
                header.value = value.into();
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_and_case_insensitive_names() {
        assert_eq!("v".parse::<HeaderName>().unwrap(), HeaderName::Via);
        assert_eq!("CALL-id".parse::<HeaderName>().unwrap(), HeaderName::CallId);
        assert_eq!(
            "x-custom".parse::<HeaderName>().unwrap(),
            HeaderName::Other("X-Custom".into())
        );
    }

    #[test]
    fn test_multi_valued_order() {
        let mut headers = Headers::new();
        headers.push(HeaderName::Via, "SIP/2.0/UDP a");
        headers.push(HeaderName::CallId, "abc");
        headers.push(HeaderName::Via, "SIP/2.0/UDP b");
        headers.insert_front(HeaderName::Via, "SIP/2.0/UDP top");

        let vias: Vec<_> = headers.get_all(&HeaderName::Via).collect();
        assert_eq!(vias, vec!["SIP/2.0/UDP top", "SIP/2.0/UDP a", "SIP/2.0/UDP b"]);
        assert_eq!(headers.remove_first(&HeaderName::Via).as_deref(), Some("SIP/2.0/UDP top"));
        assert_eq!(headers.remove_all(&HeaderName::Via), 2);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_set_collapses_duplicates() {
        let mut headers = Headers::new();
        headers.push(HeaderName::Route, "<sip:p1;lr>");
        headers.push(HeaderName::Route, "<sip:p2;lr>");
        headers.set(HeaderName::Route, "<sip:p3;lr>");
        assert_eq!(headers.get_all(&HeaderName::Route).count(), 1);
        assert_eq!(headers.get(&HeaderName::Route), Some("<sip:p3;lr>"));
    }
}
