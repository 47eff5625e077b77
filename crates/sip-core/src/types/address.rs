//! # Name-addr values
//!
//! `From`, `To`, `Contact`, `Route` and `Record-Route` all carry a
//! `[display-name] <uri>;params` value (or a bare addr-spec). This module
//! models that shape once so tag handling and route-set computation share
//! the same type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::param::Params;
use crate::types::uri::Uri;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub display_name: Option<String>,
    pub uri: Uri,
    /// Header parameters (outside the angle brackets).
    pub params: Params,
}

impl Address {
    pub fn new(uri: Uri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.set_tag(tag);
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.value("tag")
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.params.set("tag", Some(tag.into()));
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidUri(String::new()));
        }

        if let Some(open) = find_unquoted(s, '<') {
            let close = s[open..]
                .find('>')
                .map(|i| i + open)
                .ok_or_else(|| Error::InvalidUri(s.to_string()))?;
            let display = s[..open].trim();
            let display_name = if display.is_empty() {
                None
            } else {
                Some(display.trim_matches('"').to_string())
            };
            let uri = s[open + 1..close].parse()?;
            let params = s[close + 1..]
                .trim()
                .strip_prefix(';')
                .map(Params::parse)
                .unwrap_or_default();
            return Ok(Address {
                display_name,
                uri,
                params,
            });
        }

        // addr-spec form: any ';' parameters belong to the header, not the URI.
        let (uri, params) = match s.split_once(';') {
            Some((uri, params)) => (uri, Params::parse(params)),
            None => (s, Params::new()),
        };
        Ok(Address {
            display_name: None,
            uri: uri.parse()?,
            params,
        })
    }
}

fn find_unquoted(s: &str, needle: char) -> Option<usize> {
    let mut in_quotes = false;
    for (idx, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == needle && !in_quotes => return Some(idx),
            _ => {}
        }
    }
    None
}
