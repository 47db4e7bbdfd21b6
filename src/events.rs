//! Structured per-request transaction events.
//!
//! The server emits one [`TransactionEvent`] per completed request to a
//! [`TransactionSink`]. Rendering is the sink's concern; the default sink
//! hands the fields to `tracing` and lets the installed subscriber format
//! them.

use std::{net::IpAddr, time::SystemTime};

use derive_more::Display;
use tracing::info;

/// Cache disposition of a request, decided before it is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CacheTag {
    /// A `GET` whose key was present in the cache.
    #[display("H")]
    Hit,
    /// A `GET` whose key was absent.
    #[display("M")]
    Miss,
    /// Any non-`GET` request.
    #[display("-")]
    Skip,
}

/// One completed proxy transaction.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub cache_tag: CacheTag,
    pub timestamp: SystemTime,
    /// The request line verbatim; empty when the request never parsed.
    pub request_line: String,
    pub status: u16,
    /// Response body bytes after the header terminator, not wire size.
    pub body_bytes: usize,
}

/// Receives transaction events from the server.
pub trait TransactionSink: Send + Sync {
    fn record(&self, event: &TransactionEvent);
}

/// Default sink: emits each transaction as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TransactionSink for TracingSink {
    fn record(&self, event: &TransactionEvent) {
        info!(
            target: "cachepipe::transactions",
            client_ip = %event.client_ip,
            client_port = event.client_port,
            cache = %event.cache_tag,
            request = %event.request_line,
            status = event.status,
            bytes = event.body_bytes,
            "transaction"
        );
    }
}
