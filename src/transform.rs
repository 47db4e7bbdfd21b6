//! Forwarding rewrites for proxied requests and responses.
//!
//! Requests to the origin get an origin-form target, `Connection: close`, a
//! normalized `Host`, a chained `Via`, and no `Proxy-Connection`. Responses
//! to the client keep their status line and body; their `Connection` header
//! is replaced according to the client's persistence preference and `Via` is
//! chained. Bodies pass through untouched in both directions.

use http::Version;

use crate::{
    headers::HeaderMap,
    parse::{Request, Response},
    url::RemoteTarget,
};

/// Whether the client connection should stay open after a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    KeepAlive,
    Close,
}

/// Derives the client's persistence preference from its request.
///
/// An explicit `Connection: keep-alive` or `Connection: close` wins;
/// otherwise HTTP/1.1 defaults to keep-alive and HTTP/1.0 to close.
pub fn client_persistence(request: &Request) -> Persistence {
    match request.headers.get("connection") {
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => Persistence::KeepAlive,
        Some(v) if v.eq_ignore_ascii_case("close") => Persistence::Close,
        _ => {
            if request.version == Version::HTTP_11 {
                Persistence::KeepAlive
            } else {
                Persistence::Close
            }
        }
    }
}

/// Applies the proxy's forwarding rewrites.
#[derive(Debug, Clone)]
pub struct Transformer {
    proxy_id: String,
}

impl Transformer {
    pub fn new(proxy_id: impl Into<String>) -> Self {
        Self {
            proxy_id: proxy_id.into(),
        }
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    fn chain_via(&self, headers: &mut HeaderMap) {
        let value = match headers.get("via") {
            Some(existing) => format!("{existing}, {}", self.proxy_id),
            None => self.proxy_id.clone(),
        };
        headers.set("Via", value);
    }

    /// Rewrites a client request for forwarding to `target`'s origin.
    pub fn request_for_origin(&self, request: &Request, target: &RemoteTarget) -> Request {
        let mut headers: HeaderMap = request
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("proxy-connection"))
            .collect();
        // Every origin fetch runs on its own connection.
        headers.set("Connection", "close");
        self.chain_via(&mut headers);
        let host = if target.port == 80 || target.port == 443 {
            target.host.clone()
        } else {
            format!("{}:{}", target.host, target.port)
        };
        headers.set("Host", host);
        Request {
            method: request.method.clone(),
            target: target.path.clone(),
            version: request.version,
            headers,
            body: request.body.clone(),
        }
    }

    /// Rewrites an origin response for the client that sent `request`.
    pub fn response_for_client(&self, response: &Response, request: &Request) -> Response {
        let mut headers: HeaderMap = response
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("connection"))
            .collect();
        match client_persistence(request) {
            Persistence::KeepAlive => headers.set("Connection", "keep-alive"),
            Persistence::Close => headers.set("Connection", "close"),
        }
        self.chain_via(&mut headers);
        Response {
            version: response.version,
            status: response.status,
            reason: response.reason.clone(),
            headers,
            body: response.body.clone(),
        }
    }
}
