//! Generic `;name[=value]` parameter lists shared by URIs, Via and
//! name-addr headers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single header or URI parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: Option<String>,
}

impl Param {
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// `branch=<value>`
    pub fn branch(value: impl Into<String>) -> Self {
        Self::new("branch", Some(value.into()))
    }

    /// `tag=<value>`
    pub fn tag(value: impl Into<String>) -> Self {
        Self::new("tag", Some(value.into()))
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, ";{}={}", self.name, value),
            None => write!(f, ";{}", self.name),
        }
    }
}

/// Ordered parameter list. Names compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params(pub Vec<Param>);

impl Params {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Parses `a=b;c;d=e` (without the leading `;`). Empty segments are skipped.
    pub fn parse(input: &str) -> Self {
        let params = split_unquoted(input, ';')
            .into_iter()
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(|segment| match segment.split_once('=') {
                Some((name, value)) => Param::new(name.trim(), Some(value.trim().to_string())),
                None => Param::new(segment, None),
            })
            .collect();
        Params(params)
    }

    /// Value of a parameter. `Some(None)` means the parameter is present as a flag.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_deref())
    }

    /// Value of a valued parameter, `None` when absent or a flag.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).flatten()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces an existing parameter in place or appends a new one.
    pub fn set(&mut self, name: &str, value: Option<String>) {
        match self.0.iter_mut().find(|p| p.name.eq_ignore_ascii_case(name)) {
            Some(existing) => existing.value = value,
            None => self.0.push(Param::new(name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|p| !p.name.eq_ignore_ascii_case(name));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for param in &self.0 {
            write!(f, "{}", param)?;
        }
        Ok(())
    }
}

/// Splits on `sep` outside double quotes and angle brackets.
pub(crate) fn split_unquoted(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut angle_depth = 0usize;
    let mut start = 0;

    for (idx, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => angle_depth += 1,
            '>' if !in_quotes => angle_depth = angle_depth.saturating_sub(1),
            c if c == sep && !in_quotes && angle_depth == 0 => {
                parts.push(&input[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_lookup() {
        let params = Params::parse("branch=z9hG4bK1;rport;Received=10.0.0.1");
        assert_eq!(params.value("branch"), Some("z9hG4bK1"));
        assert_eq!(params.get("rport"), Some(None));
        assert_eq!(params.value("received"), Some("10.0.0.1"));
        assert!(!params.contains("maddr"));
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut params = Params::parse("tag=a;lr");
        params.set("TAG", Some("b".into()));
        assert_eq!(params.to_string(), ";tag=b;lr");
    }

    #[test]
    fn test_split_respects_quotes_and_brackets() {
        let parts = split_unquoted("\"Doe, John\" <sip:j@a.com>, <sip:x@b.com;a=1,2>", ',');
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].trim(), "<sip:x@b.com;a=1,2>");
    }
}
