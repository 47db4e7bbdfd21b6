//! HTTP/1.x message types, parsing, and wire serialization.
//!
//! Messages are parsed from a complete header section (as produced by
//! [`StreamReader::read_header_block`](crate::reader::StreamReader)) with a
//! strict grammar: methods are uppercase tokens, versions match
//! `HTTP/<digit>.<digit>`, status codes are 100–599, and header names must
//! be RFC 7230 tokens. Serialization always emits CRLF line endings.

use std::str::FromStr;

use bytes::Bytes;
use http::{Method, StatusCode, Version};
use n0_error::{Result, StdResultExt, anyerr, ensure_any};

use crate::headers::HeaderMap;

/// Maximum number of distinct header lines accepted per message.
const MAX_HEADER_COUNT: usize = 64;

pub(crate) fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn parsed_version(minor: Option<u8>) -> Result<Version> {
    match minor {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        _ => Err(anyerr!("Unsupported HTTP version")),
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for header in raw {
        let value = std::str::from_utf8(header.value)
            .std_context("Header value is not valid UTF-8")?;
        headers.set(header.name, value.trim());
    }
    Ok(headers)
}

/// A parsed HTTP request.
///
/// `target` is kept verbatim as received; interpretation (absolute-form,
/// authority-form, origin-form) happens in [`crate::url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Request {
    /// Parses a request line and header section.
    ///
    /// The block must be a complete header section including the blank-line
    /// terminator. The body is left empty; callers read it separately
    /// according to `Content-Length`.
    pub fn parse_header_block(block: &[u8]) -> Result<Self> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut parsed = httparse::Request::new(&mut slots);
        match parsed.parse(block).std_context("Invalid HTTP request")? {
            httparse::Status::Partial => Err(anyerr!("Truncated request header section")),
            httparse::Status::Complete(_) => {
                let method_str = parsed.method.ok_or_else(|| anyerr!("Missing method"))?;
                ensure_any!(
                    !method_str.is_empty()
                        && method_str.bytes().all(|b| b.is_ascii_uppercase()),
                    "Invalid method: {method_str}"
                );
                let method = Method::from_str(method_str).std_context("Invalid method")?;
                let target = parsed
                    .path
                    .ok_or_else(|| anyerr!("Missing request target"))?
                    .to_string();
                let version = parsed_version(parsed.version)?;
                let headers = collect_headers(parsed.headers)?;
                Ok(Self {
                    method,
                    target,
                    version,
                    headers,
                    body: Bytes::new(),
                })
            }
        }
    }

    /// The request line as received, without the terminator.
    pub fn request_line(&self) -> String {
        format!(
            "{} {} {}",
            self.method,
            self.target,
            version_str(self.version)
        )
    }

    /// Declared body length, or `None` when no `Content-Length` is present.
    pub fn content_length(&self) -> Result<Option<usize>> {
        match self.headers.get("content-length") {
            None => Ok(None),
            Some(value) => {
                let len = value
                    .trim()
                    .parse::<usize>()
                    .std_context(format!("Invalid Content-Length: {value}"))?;
                Ok(Some(len))
            }
        }
    }

    /// Serializes the request to wire form with CRLF line endings.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.push(b' ');
        out.extend_from_slice(version_str(self.version).as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// A parsed HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: Version,
    pub status: StatusCode,
    /// Reason phrase as received; may be empty.
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// Parses a status line and header section.
    ///
    /// The body is left empty; callers read it according to the framing
    /// rules for the originating request method.
    pub fn parse_header_block(block: &[u8]) -> Result<Self> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut parsed = httparse::Response::new(&mut slots);
        match parsed.parse(block).std_context("Invalid HTTP response")? {
            httparse::Status::Partial => Err(anyerr!("Truncated response header section")),
            httparse::Status::Complete(_) => {
                let code = parsed.code.ok_or_else(|| anyerr!("Missing status code"))?;
                ensure_any!(
                    (100..=599).contains(&code),
                    "Status code out of range: {code}"
                );
                let status = StatusCode::from_u16(code).std_context("Invalid status code")?;
                let version = parsed_version(parsed.version)?;
                let reason = parsed.reason.unwrap_or_default().to_string();
                let headers = collect_headers(parsed.headers)?;
                Ok(Self {
                    version,
                    status,
                    reason,
                    headers,
                    body: Bytes::new(),
                })
            }
        }
    }

    /// Builds a response with an empty body, for synthesized replies.
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: reason.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Declared body length, or `None` when no `Content-Length` is present.
    pub fn content_length(&self) -> Result<Option<usize>> {
        match self.headers.get("content-length") {
            None => Ok(None),
            Some(value) => {
                let len = value
                    .trim()
                    .parse::<usize>()
                    .std_context(format!("Invalid Content-Length: {value}"))?;
                Ok(Some(len))
            }
        }
    }

    /// Whether the body is declared as chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    }

    /// Whether the message carries `Connection: close`.
    pub fn says_close(&self) -> bool {
        self.headers
            .get("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }

    /// Formats the status line without the terminator.
    pub fn status_line(&self) -> String {
        format!(
            "{} {} {}",
            version_str(self.version),
            self.status.as_u16(),
            self.reason
        )
    }

    /// Serializes the response to wire form with CRLF line endings.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.status_line().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}
