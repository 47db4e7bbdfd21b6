//! Proxy failure classification and error responses.
//!
//! Every failure that reaches a client maps to one of the kinds below and is
//! rendered as a complete `text/plain` HTTP response. Origin-side errors are
//! never surfaced raw; the pipeline converts them at its boundary.

use http::StatusCode;
use n0_error::{AnyError, stack_error};

use crate::parse::Response;

/// Failure kinds for request handling.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ProxyError {
    /// Malformed request line or headers, unsupported method, or an invalid
    /// target for the method.
    #[error("malformed request: {reason}")]
    BadRequest { reason: String },

    /// The target resolves to this proxy's own listener.
    #[error("request target loops back to this proxy")]
    SelfLoop,

    /// DNS lookup failed or exceeded its deadline.
    #[error("could not resolve host: {host}")]
    ResolveFailure { host: String },

    /// The origin refused the TCP connection.
    #[error("connection refused by {host}:{port}")]
    ConnectionRefused { host: String, port: u16 },

    /// The OS reports no route to the origin network.
    #[error("network unreachable for host: {host}")]
    NetworkUnreachable { host: String },

    /// Any other I/O failure while talking to the origin, including
    /// unparseable origin responses.
    #[error("origin i/o error")]
    OriginIo {
        #[error(source)]
        source: AnyError,
    },

    /// Origin connect/read, or the whole request, exceeded its deadline.
    #[error("{operation} timed out")]
    OriginTimeout { operation: String },

    /// Any unexpected condition.
    #[error("internal proxy error")]
    Internal {
        #[error(source)]
        source: AnyError,
    },
}

impl ProxyError {
    /// Status code sent to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ProxyError::SelfLoop { .. } => StatusCode::MISDIRECTED_REQUEST,
            ProxyError::OriginTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::ResolveFailure { .. }
            | ProxyError::ConnectionRefused { .. }
            | ProxyError::NetworkUnreachable { .. }
            | ProxyError::OriginIo { .. }
            | ProxyError::Internal { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn reason_phrase(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST => "Bad Request",
            StatusCode::MISDIRECTED_REQUEST => "Misdirected Request",
            StatusCode::GATEWAY_TIMEOUT => "Gateway Timeout",
            _ => "Bad Gateway",
        }
    }

    /// Renders the failure as a complete client-facing response.
    ///
    /// The body is `Error <code>: <reason>` followed by a blank line and a
    /// short detail. Error responses always demand connection close.
    pub fn to_response(&self) -> Response {
        let code = self.status().as_u16();
        let reason = self.reason_phrase();
        let body = format!("Error {code}: {reason}\n\n{self}");
        let mut response = Response::new(self.status(), reason);
        response.headers.set("Content-Type", "text/plain");
        response.headers.set("Content-Length", body.len().to_string());
        response.headers.set("Connection", "close");
        response.body = body.into();
        response
    }
}
