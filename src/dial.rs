//! Origin connection establishment.
//!
//! Name resolution is bounded by a hard 3 second deadline and TCP connect by
//! the configured idle timeout. Failures are classified into the proxy's
//! error kinds at the call site where the failure is observed; the dialer
//! never retries.

use std::{io, time::Duration};

use n0_error::{anyerr, e};
use tokio::net::{TcpStream, lookup_host};
use tokio_util::time::FutureExt;
use tracing::debug;

use crate::error::ProxyError;

/// Hard bound on DNS resolution.
const DNS_TIMEOUT: Duration = Duration::from_secs(3);

/// Dials origin servers with bounded resolution and connect.
#[derive(Debug, Clone)]
pub struct OriginDialer {
    connect_timeout: Duration,
}

impl OriginDialer {
    /// `connect_timeout` bounds the TCP connect and is the idle timeout of
    /// the owning server.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Resolves `host` and opens a TCP connection to `host:port`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let mut addrs = match lookup_host((host, port)).timeout(DNS_TIMEOUT).await {
            Err(_) | Ok(Err(_)) => {
                return Err(e!(ProxyError::ResolveFailure {
                    host: host.to_string()
                }));
            }
            Ok(Ok(addrs)) => addrs,
        };
        let Some(addr) = addrs.next() else {
            return Err(e!(ProxyError::ResolveFailure {
                host: host.to_string()
            }));
        };
        debug!(%addr, "connecting to origin");
        let stream = TcpStream::connect(addr)
            .timeout(self.connect_timeout)
            .await
            .map_err(|_| {
                e!(ProxyError::OriginTimeout {
                    operation: format!("connect to {host}:{port}")
                })
            })?
            .map_err(|source| classify_connect_error(source, host, port))?;
        Ok(stream)
    }
}

fn classify_connect_error(source: io::Error, host: &str, port: u16) -> ProxyError {
    match source.kind() {
        io::ErrorKind::ConnectionRefused => e!(ProxyError::ConnectionRefused {
            host: host.to_string(),
            port
        }),
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
            e!(ProxyError::NetworkUnreachable {
                host: host.to_string()
            })
        }
        io::ErrorKind::TimedOut => e!(ProxyError::OriginTimeout {
            operation: format!("connect to {host}:{port}")
        }),
        _ => e!(ProxyError::OriginIo {
            source: anyerr!(source)
        }),
    }
}
