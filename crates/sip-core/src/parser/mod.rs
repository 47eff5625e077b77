//! # Message parser
//!
//! Parses a complete SIP message from a byte buffer (one UDP datagram or
//! one framed stream message). Start lines and header lines are parsed with
//! `nom`; folded header lines (RFC 3261 Section 7.3.1) are unfolded first and
//! comma-joined values of list headers are split into one entry each.
//!
//! Leading CRLFs (keep-alives) are skipped. When `Content-Length` is present
//! it must not exceed the bytes available; extra trailing bytes are ignored.
//! Without `Content-Length` the rest of the buffer is taken as the body.

use std::str;

use bytes::Bytes;
use nom::{
    bytes::complete::{tag, take_till1, take_while1, take_while_m_n},
    character::complete::{char, space0, space1},
    combinator::{map_res, rest},
    sequence::{preceded, tuple},
    IResult,
};
use tracing::trace;

use crate::error::{Error, Result};
use crate::message::{Message, Request, Response};
use crate::types::param::split_unquoted;
use crate::types::{HeaderName, Headers, Method, StatusCode, Uri};

const SIP_VERSION: &str = "SIP/2.0";

enum StartLine {
    Request(Method, Uri),
    Response(StatusCode, String),
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

// Request-Line = Method SP Request-URI SP SIP-Version
fn request_line(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, (method, _, uri, _, _)) = tuple((
        take_while1(is_token_char),
        space1,
        take_till1(|c: char| c == ' '),
        space1,
        tag(SIP_VERSION),
    ))(input)?;
    Ok((input, (method, uri)))
}

// Status-Line = SIP-Version SP Status-Code SP Reason-Phrase
fn status_line(input: &str) -> IResult<&str, (u16, &str)> {
    let (input, (_, _, code, reason)) = tuple((
        tag(SIP_VERSION),
        space1,
        map_res(take_while_m_n(3, 3, |c: char| c.is_ascii_digit()), str::parse::<u16>),
        preceded(space0, rest),
    ))(input)?;
    Ok((input, (code, reason)))
}

// message-header = field-name HCOLON field-value
fn header_line(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, (name, _, _, value)) = tuple((
        take_till1(|c: char| c == ':' || c == ' ' || c == '\t'),
        space0,
        char(':'),
        rest,
    ))(input)?;
    Ok((input, (name, value.trim())))
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    if line.starts_with(SIP_VERSION) {
        let (_, (code, reason)) = status_line(line)
            .map_err(|e| Error::ParseError(format!("invalid status line '{}': {}", line, e)))?;
        let status = StatusCode::from_u16(code)?;
        return Ok(StartLine::Response(status, reason.trim().to_string()));
    }

    let (remaining, (method, uri)) = request_line(line)
        .map_err(|e| Error::ParseError(format!("invalid request line '{}': {}", line, e)))?;
    if !remaining.trim().is_empty() {
        return Err(Error::ParseError(format!("trailing data in request line '{}'", line)));
    }
    Ok(StartLine::Request(method.parse()?, uri.parse()?))
}

/// Replaces CRLF (or bare LF) followed by whitespace with a single space.
fn unfold(head: &str) -> String {
    let mut out = String::with_capacity(head.len());
    let mut chars = head.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' if chars.peek() == Some(&'\n') => {
                chars.next();
                if matches!(chars.peek(), Some(' ') | Some('\t')) {
                    out.push(' ');
                    while matches!(chars.peek(), Some(' ') | Some('\t')) {
                        chars.next();
                    }
                } else {
                    out.push('\n');
                }
            }
            '\n' => {
                if matches!(chars.peek(), Some(' ') | Some('\t')) {
                    out.push(' ');
                    while matches!(chars.peek(), Some(' ') | Some('\t')) {
                        chars.next();
                    }
                } else {
                    out.push('\n');
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Splits the buffer at the blank line, returning header section and body.
fn split_head(input: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(idx) = input.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((&input[..idx], &input[idx + 4..]));
    }
    input
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|idx| (&input[..idx], &input[idx + 2..]))
}

/// Parses one SIP message.
pub fn parse_message(input: &[u8]) -> Result<Message> {
    let start = input
        .iter()
        .position(|b| *b != b'\r' && *b != b'\n')
        .ok_or_else(|| Error::ParseError("empty message".to_string()))?;
    let input = &input[start..];

    let (head, body) = split_head(input)
        .ok_or_else(|| Error::ParseError("missing blank line after headers".to_string()))?;
    let head = unfold(str::from_utf8(head)?);
    let mut lines = head.lines();

    let start_line = lines
        .next()
        .ok_or_else(|| Error::ParseError("missing start line".to_string()))?;
    let start_line = parse_start_line(start_line.trim_end())?;

    let mut headers = Headers::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let (_, (name, value)) = header_line(line)
            .map_err(|e| Error::ParseError(format!("invalid header line '{}': {}", line, e)))?;
        let name: HeaderName = name.parse()?;
        if name.is_list() {
            for item in split_unquoted(value, ',') {
                let item = item.trim();
                if !item.is_empty() {
                    headers.push(name.clone(), item);
                }
            }
        } else {
            headers.push(name, value);
        }
    }

    let body = match headers.get(&HeaderName::ContentLength) {
        Some(len) => {
            let len: usize = len
                .trim()
                .parse()
                .map_err(|_| Error::invalid_header("Content-Length", format!("'{}'", len)))?;
            if len > body.len() {
                return Err(Error::ParseError(format!(
                    "Content-Length {} exceeds available body of {} bytes",
                    len,
                    body.len()
                )));
            }
            Bytes::copy_from_slice(&body[..len])
        }
        None => Bytes::copy_from_slice(body),
    };

    trace!(headers = headers.len(), body = body.len(), "parsed SIP message");

    let message = match start_line {
        StartLine::Request(method, uri) => Message::Request(Request {
            method,
            uri,
            headers,
            body,
        }),
        StartLine::Response(status, reason) => Message::Response(Response {
            status,
            reason,
            headers,
            body,
        }),
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line() {
        let (_, (method, uri)) = request_line("INVITE sip:bob@biloxi.com SIP/2.0").unwrap();
        assert_eq!(method, "INVITE");
        assert_eq!(uri, "sip:bob@biloxi.com");
    }

    #[test]
    fn test_status_line_without_reason() {
        let (_, (code, reason)) = status_line("SIP/2.0 200").unwrap();
        assert_eq!(code, 200);
        assert_eq!(reason, "");
    }

    #[test]
    fn test_header_line_spacing() {
        let (_, (name, value)) = header_line("Call-ID :  abc@host ").unwrap();
        assert_eq!(name, "Call-ID");
        assert_eq!(value, "abc@host");
    }

    #[test]
    fn test_unfold() {
        assert_eq!(unfold("Subject: a\r\n  b\r\nTo: x"), "Subject: a b\nTo: x");
    }
}
