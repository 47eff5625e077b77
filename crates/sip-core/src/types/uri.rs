//! # SIP URIs
//!
//! A pragmatic `sip:`/`sips:` URI model (RFC 3261 Section 19.1): user,
//! host (domain, IPv4 or bracketed IPv6), port, parameters and headers.
//! Other schemes (e.g. `tel:`) are accepted with the remainder kept opaque
//! in `host`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::param::Params;

/// URI scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Sip,
    Sips,
    Other(String),
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Sip => f.write_str("sip"),
            Scheme::Sips => f.write_str("sips"),
            Scheme::Other(s) => f.write_str(s),
        }
    }
}

/// A SIP URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: Scheme,
    /// User part including any `:password`.
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
    /// Raw `?` headers component.
    pub headers: Option<String>,
}

impl Uri {
    /// Builds `sip:host`.
    pub fn sip(host: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Sip,
            user: None,
            host: host.into(),
            port: None,
            params: Params::new(),
            headers: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// True when the URI carries the `lr` (loose routing) parameter.
    pub fn is_loose_route(&self) -> bool {
        self.params.contains("lr")
    }

    /// Default port for the scheme when none is given.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(match self.scheme {
            Scheme::Sips => 5061,
            _ => 5060,
        })
    }

    /// `maddr` parameter overrides the host for routing purposes.
    pub fn routing_host(&self) -> &str {
        self.params.value("maddr").unwrap_or(&self.host)
    }

    /// Host stripped of IPv6 brackets.
    pub fn host_unbracketed(&self) -> &str {
        self.routing_host().trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)?;
        if let Some(headers) = &self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidUri(s.to_string()))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "sip" => Scheme::Sip,
            "sips" => Scheme::Sips,
            "" => return Err(Error::InvalidUri(s.to_string())),
            other => Scheme::Other(other.to_string()),
        };

        if let Scheme::Other(_) = scheme {
            if rest.is_empty() {
                return Err(Error::InvalidUri(s.to_string()));
            }
            return Ok(Uri {
                scheme,
                user: None,
                host: rest.to_string(),
                port: None,
                params: Params::new(),
                headers: None,
            });
        }

        let (rest, headers) = match rest.split_once('?') {
            Some((r, h)) => (r, Some(h.to_string())),
            None => (rest, None),
        };
        // The user part may legally contain ';' so split on the last '@' first.
        let (user, hostport_params) = match rest.rfind('@') {
            Some(idx) => (Some(rest[..idx].to_string()), &rest[idx + 1..]),
            None => (None, rest),
        };
        let (hostport, params) = match hostport_params.split_once(';') {
            Some((hp, p)) => (hp, Params::parse(p)),
            None => (hostport_params, Params::new()),
        };

        let (host, port) = split_host_port(hostport).ok_or_else(|| Error::InvalidUri(s.to_string()))?;
        if host.is_empty() {
            return Err(Error::InvalidUri(s.to_string()));
        }

        Ok(Uri {
            scheme,
            user,
            host,
            port,
            params,
            headers,
        })
    }
}

/// Splits `host[:port]`, handling bracketed IPv6 references.
pub(crate) fn split_host_port(input: &str) -> Option<(String, Option<u16>)> {
    let input = input.trim();
    if input.starts_with('[') {
        let end = input.find(']')?;
        let host = input[..=end].to_string();
        let rest = &input[end + 1..];
        if rest.is_empty() {
            return Some((host, None));
        }
        let port = rest.strip_prefix(':')?.parse().ok()?;
        return Some((host, Some(port)));
    }
    match input.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), Some(port.parse().ok()?))),
        None => Some((input.to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri: Uri = "sip:alice@10.0.0.1:5070;transport=udp;lr".parse().unwrap();
        assert_eq!(uri.scheme, Scheme::Sip);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host, "10.0.0.1");
        assert_eq!(uri.port, Some(5070));
        assert!(uri.is_loose_route());
        assert_eq!(uri.to_string(), "sip:alice@10.0.0.1:5070;transport=udp;lr");
    }

    #[test]
    fn test_parse_ipv6_host() {
        let uri: Uri = "sips:[2001:db8::1]:5061".parse().unwrap();
        assert_eq!(uri.host, "[2001:db8::1]");
        assert_eq!(uri.host_unbracketed(), "2001:db8::1");
        assert_eq!(uri.port_or_default(), 5061);
    }

    #[test]
    fn test_default_port() {
        let uri: Uri = "sip:example.com".parse().unwrap();
        assert_eq!(uri.port, None);
        assert_eq!(uri.port_or_default(), 5060);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("not a uri".parse::<Uri>().is_err());
        assert!("sip:".parse::<Uri>().is_err());
        assert!("sip:host:notaport".parse::<Uri>().is_err());
    }
}
