//! CSeq header (RFC 3261 Section 20.16).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::method::Method;

/// Sequence number plus method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        Self { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

impl FromStr for CSeq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let (seq, method) = match (parts.next(), parts.next(), parts.next()) {
            (Some(seq), Some(method), None) => (seq, method),
            _ => return Err(Error::invalid_header("CSeq", format!("malformed value '{}'", s))),
        };
        let seq = seq
            .parse::<u32>()
            .map_err(|e| Error::invalid_header("CSeq", e.to_string()))?;
        Ok(CSeq::new(seq, method.parse()?))
    }
}
