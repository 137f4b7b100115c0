//! Minimal HTTP/1.1 wire handling for the duplex control connection
//!
//! The broker answers our requests and also pushes its own requests on the
//! same connection, so the parser accepts both message kinds and tells them
//! apart by the start line. Messages are framed by `Content-Length`;
//! chunked bodies are rejected. A pushed `POST` without `Content-Length`
//! takes whatever follows its head in the buffer as its body.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

use crate::error::{BrokerError, Result};

/// Upper bound on the size of a message head
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Upper bound on the declared size of a message body
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Wire-level parse failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid start line: {0:?}")]
    InvalidStartLine(String),

    #[error("invalid header line: {0:?}")]
    InvalidHeader(String),

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("unsupported Transfer-Encoding: {0}")]
    UnsupportedTransferEncoding(String),

    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("message body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

/// Header fields in wire order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// First value for `name`, compared case-insensitively
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn content_length(&self) -> std::result::Result<usize, ParseError> {
        match self.get("content-length") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ParseError::InvalidContentLength(value.to_string())),
            None => Ok(0),
        }
    }
}

/// A response to one of our requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    /// Status in [200, 300)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Status in [200, 400)
    pub fn is_accepted(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// A request pushed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedRequest {
    pub method: String,
    pub target: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// Any complete message read from the control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Response(Response),
    Request(PushedRequest),
}

/// Outgoing request
#[derive(Debug, Clone)]
pub struct Request {
    method: &'static str,
    target: String,
    body: Option<Vec<u8>>,
}

impl Request {
    /// Build a request, rejecting targets that are not origin-form paths
    pub fn new(method: &'static str, target: impl Into<String>) -> Result<Self> {
        let target = target.into();
        if !target.starts_with('/')
            || target
                .chars()
                .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(BrokerError::InvalidRequestTarget(target));
        }

        Ok(Self {
            method,
            target,
            body: None,
        })
    }

    pub fn get(target: impl Into<String>) -> Result<Self> {
        Self::new("GET", target)
    }

    pub fn post(target: impl Into<String>) -> Result<Self> {
        Self::new("POST", target)
    }

    pub fn delete(target: impl Into<String>) -> Result<Self> {
        Self::new("DELETE", target)
    }

    /// Attach a JSON body
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(body)
            .map_err(|e| BrokerError::ImproperConnectionState(format!("encode body: {}", e)))?;
        self.body = Some(encoded);
        Ok(self)
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Serialize for the wire
    pub fn encode(&self, host: &str) -> Vec<u8> {
        let body = self.body.as_deref().unwrap_or_default();
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nAccept: application/json\r\n",
            self.method, self.target, host
        );
        if self.body.is_some() {
            head.push_str("Content-Type: application/json\r\n");
        }
        head.push_str(&format!(
            "Content-Length: {}\r\nConnection: keep-alive\r\n\r\n",
            body.len()
        ));

        let mut out = head.into_bytes();
        out.extend_from_slice(body);
        out
    }
}

/// Bodiless reply to a pushed request
pub fn encode_reply(status: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: keep-alive\r\n\r\n",
        status, reason
    )
    .into_bytes()
}

/// Take one complete message off the front of `buffer`
///
/// Returns `Ok(None)` when more bytes are needed; the buffer is left as is
/// in that case.
pub fn parse_message(buffer: &mut BytesMut) -> std::result::Result<Option<Message>, ParseError> {
    let head_end = match find(buffer, HEAD_TERMINATOR) {
        Some(pos) => pos,
        None if buffer.len() > MAX_HEAD_SIZE => return Err(ParseError::HeadTooLarge(MAX_HEAD_SIZE)),
        None => return Ok(None),
    };
    if head_end > MAX_HEAD_SIZE {
        return Err(ParseError::HeadTooLarge(MAX_HEAD_SIZE));
    }

    let head = std::str::from_utf8(&buffer[..head_end])
        .map_err(|_| ParseError::InvalidStartLine("non UTF-8 message head".into()))?;
    let mut lines = head.split("\r\n");
    let start = StartLine::parse(lines.next().unwrap_or_default())?;
    let headers = parse_headers(lines)?;

    if let Some(encoding) = headers.get("transfer-encoding") {
        if !encoding.eq_ignore_ascii_case("identity") {
            return Err(ParseError::UnsupportedTransferEncoding(encoding.to_string()));
        }
    }

    let body_start = head_end + HEAD_TERMINATOR.len();
    let body_len = match (&start, headers.get("content-length")) {
        (StartLine::Request { method, .. }, None) if method.eq_ignore_ascii_case("POST") => {
            match buffer.len() - body_start {
                0 => {
                    trace!("Unframed push body not received yet");
                    return Ok(None);
                }
                rest => rest,
            }
        }
        _ => headers.content_length()?,
    };
    if body_len > MAX_BODY_SIZE {
        return Err(ParseError::BodyTooLarge(MAX_BODY_SIZE));
    }

    let total = body_start + body_len;
    if buffer.len() < total {
        trace!(have = buffer.len(), need = total, "Incomplete message");
        return Ok(None);
    }

    let _ = buffer.split_to(body_start);
    let body = buffer.split_to(body_len).freeze();

    Ok(Some(match start {
        StartLine::Status { status, reason } => Message::Response(Response {
            status,
            reason,
            headers,
            body,
        }),
        StartLine::Request { method, target } => Message::Request(PushedRequest {
            method,
            target,
            headers,
            body,
        }),
    }))
}

enum StartLine {
    Status { status: u16, reason: String },
    Request { method: String, target: String },
}

impl StartLine {
    fn parse(line: &str) -> std::result::Result<Self, ParseError> {
        let invalid = || ParseError::InvalidStartLine(line.to_string());

        if let Some(rest) = line.strip_prefix("HTTP/") {
            let mut parts = rest.splitn(3, ' ');
            let version = parts.next().unwrap_or_default();
            if !version.starts_with("1.") {
                return Err(invalid());
            }
            let status: u16 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .filter(|s| (100..1000).contains(s))
                .ok_or_else(invalid)?;
            let reason = parts.next().unwrap_or_default().trim().to_string();
            return Ok(Self::Status { status, reason });
        }

        let parts: Vec<&str> = line.split(' ').collect();
        match parts.as_slice() {
            [method, target, version]
                if !method.is_empty()
                    && method.bytes().all(|b| b.is_ascii_alphabetic())
                    && version.starts_with("HTTP/1.") =>
            {
                Ok(Self::Request {
                    method: method.to_ascii_uppercase(),
                    target: target.to_string(),
                })
            }
            _ => Err(invalid()),
        }
    }
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> std::result::Result<Headers, ParseError> {
    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .filter(|(name, _)| !name.is_empty() && !name.contains(' '))
            .ok_or_else(|| ParseError::InvalidHeader(line.to_string()))?;
        headers.push((name.to_string(), value.trim().to_string()));
    }
    Ok(Headers(headers))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
