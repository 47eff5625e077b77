//! # SIP Via Header
//!
//! A single Via entry as defined in
//! [RFC 3261 Section 20.42](https://datatracker.ietf.org/doc/html/rfc3261#section-20.42).
//!
//! ```text
//! Via: SIP/2.0/UDP pc33.atlanta.com:5060;branch=z9hG4bK776asdhds;rport
//! ```
//!
//! The engine reads `branch` for transaction matching, `received`/`rport`
//! for response routing, and compares sent-by values for legacy (RFC 2543)
//! transaction keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::param::Params;
use crate::types::uri::split_host_port;

/// RFC 3261 branch magic cookie.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// One Via entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Via {
    /// Transport token, upper-cased (`UDP`, `TCP`, `TLS`, ...).
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            transport: transport.into().to_ascii_uppercase(),
            host: host.into(),
            port,
            params: Params::new(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.set_branch(branch);
        self
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.value("branch")
    }

    pub fn set_branch(&mut self, branch: impl Into<String>) {
        self.params.set("branch", Some(branch.into()));
    }

    /// True when the branch carries the RFC 3261 magic cookie.
    pub fn has_rfc3261_branch(&self) -> bool {
        self.branch()
            .map(|b| b.starts_with(BRANCH_MAGIC_COOKIE))
            .unwrap_or(false)
    }

    pub fn received(&self) -> Option<&str> {
        self.params.value("received")
    }

    pub fn set_received(&mut self, received: impl Into<String>) {
        self.params.set("received", Some(received.into()));
    }

    /// `Some(None)` when `rport` is present without a value.
    pub fn rport(&self) -> Option<Option<u16>> {
        self.params
            .get("rport")
            .map(|value| value.and_then(|v| v.parse().ok()))
    }

    pub fn set_rport(&mut self, port: Option<u16>) {
        self.params.set("rport", port.map(|p| p.to_string()));
    }

    /// `host[:port]` as written by the sender.
    pub fn sent_by(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}{}", self.transport, self.sent_by(), self.params)
    }
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (protocol, rest) = s
            .split_once(|c: char| c.is_ascii_whitespace())
            .ok_or_else(|| Error::invalid_header("Via", "missing sent-by"))?;

        let mut parts = protocol.split('/').map(str::trim);
        let (name, version, transport) = match (parts.next(), parts.next(), parts.next()) {
            (Some(n), Some(v), Some(t)) if !t.is_empty() => (n, v, t),
            _ => return Err(Error::invalid_header("Via", "malformed sent-protocol")),
        };
        if !name.eq_ignore_ascii_case("SIP") || version != "2.0" {
            return Err(Error::invalid_header("Via", format!("unsupported protocol {}", protocol)));
        }

        let rest = rest.trim();
        let (sent_by, params) = match rest.split_once(';') {
            Some((sb, p)) => (sb, Params::parse(p)),
            None => (rest, Params::new()),
        };
        let (host, port) = split_host_port(sent_by)
            .ok_or_else(|| Error::invalid_header("Via", format!("invalid sent-by {}", sent_by)))?;
        if host.is_empty() {
            return Err(Error::invalid_header("Via", "empty host"));
        }

        Ok(Via {
            transport: transport.to_ascii_uppercase(),
            host,
            port,
            params,
        })
    }
}
