//! Caching, concurrent HTTP/1.x forward proxy.
//!
//! Clients issue absolute-form `GET`/`HEAD`/`POST` requests or
//! authority-form `CONNECT` requests. The proxy rewrites and forwards them
//! to origins over TCP, memoizes cacheable `GET` responses in a bounded LRU
//! shared across connections, and turns `CONNECT` into an opaque
//! bidirectional tunnel.

/// Message framing: buffered socket reading per body discipline.
pub mod reader;
/// Message types, strict parsing, and wire serialization.
pub mod parse;
/// Ordered case-preserving header storage.
pub mod headers;
/// Request-target parsing and cache-key normalization.
pub mod url;
/// Forwarding rewrites (`Via`, `Connection`, `Host`).
pub mod transform;
/// Bounded LRU response cache.
pub mod cache;
/// Failure kinds and error responses.
pub mod error;
/// Per-request transaction events.
pub mod events;
/// Validated runtime configuration.
pub mod config;
/// Accept loop, worker pool, and connection lifecycle.
pub mod server;

mod dial;
mod pipeline;
mod tunnel;

pub use cache::{CacheStats, HttpCache};
pub use config::{ConfigError, ProxyConfig};
pub use error::ProxyError;
pub use events::{CacheTag, TracingSink, TransactionEvent, TransactionSink};
pub use headers::HeaderMap;
pub use parse::{Request, Response};
pub use reader::{FrameError, StreamReader};
pub use server::{ConnectionStats, MAX_WORKERS, ProxyServer};
pub use transform::Transformer;

/// Upper bound on the size of a message header section.
pub const MAX_HEADER_BYTES: usize = 65536;

#[cfg(test)]
mod tests;
