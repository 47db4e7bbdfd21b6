//! Accept loop, worker pool, and the per-connection request loop.
//!
//! The acceptor is the only producer into a pool of at most
//! [`MAX_WORKERS`] concurrent connection tasks, bounded by a semaphore: the
//! accept loop takes a permit before accepting, so a full pool pushes back
//! on accepting rather than queueing unbounded work. Each connection task
//! serializes requests strictly: a response is fully flushed before the next
//! request is read.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use http::Method;
use n0_error::{Result, StdResultExt, e};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpSocket, TcpStream},
    sync::Semaphore,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker, time::FutureExt};
use tracing::{Instrument, debug, error_span, info};

use crate::{
    cache::HttpCache,
    config::ProxyConfig,
    error::ProxyError,
    events::{CacheTag, TracingSink, TransactionEvent, TransactionSink},
    parse::Request,
    pipeline::{Outcome, Pipeline},
    reader::StreamReader,
    transform::{self, Persistence, Transformer},
    url,
};

/// Number of client connections served concurrently.
pub const MAX_WORKERS: usize = 30;

/// How long shutdown waits for open connections before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Snapshot of the server's connection counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub total_accepted: u64,
    pub active: u64,
    pub completed: u64,
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    total_accepted: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
}

/// The proxy server: listener setup, accept loop, and shutdown.
pub struct ProxyServer {
    config: ProxyConfig,
    cache: Arc<HttpCache>,
    pipeline: Arc<Pipeline>,
    sink: Arc<dyn TransactionSink>,
    counters: Arc<ConnectionCounters>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ProxyServer {
    /// Builds a server that reports transactions through [`TracingSink`].
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_sink(config, TracingSink)
    }

    /// Builds a server with a custom transaction sink.
    pub fn with_sink(config: ProxyConfig, sink: impl TransactionSink + 'static) -> Self {
        let cache = Arc::new(HttpCache::new(
            config.max_cache_bytes,
            config.max_object_bytes,
        ));
        let transformer = Arc::new(Transformer::new(config.proxy_id.clone()));
        let pipeline = Arc::new(Pipeline::new(config.clone(), cache.clone(), transformer));
        Self {
            config,
            cache,
            pipeline,
            sink: Arc::new(sink),
            counters: Arc::new(ConnectionCounters::default()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// The shared response cache, exposed for stats and maintenance.
    pub fn cache(&self) -> &Arc<HttpCache> {
        &self.cache
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            total_accepted: self.counters.total_accepted.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
        }
    }

    /// Binds the configured port with address reuse.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.listen_port).into();
        let socket = TcpSocket::new_v4().anyerr()?;
        socket.set_reuseaddr(true).anyerr()?;
        socket.bind(addr).anyerr()?;
        let listener = socket.listen(1024).anyerr()?;
        info!(port = self.config.listen_port, "proxy listening");
        Ok(listener)
    }

    /// Accepts connections until the listener fails or shutdown is
    /// signalled. Each accepted connection runs on a pooled worker task.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(MAX_WORKERS));
        let mut conn_id: u64 = 0;
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit.anyerr()?,
            };
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = accepted.anyerr()?;
            self.counters.total_accepted.fetch_add(1, Ordering::Relaxed);
            self.counters.active.fetch_add(1, Ordering::Relaxed);
            debug!(%peer, "accepted connection");

            let pipeline = self.pipeline.clone();
            let cache = self.cache.clone();
            let sink = self.sink.clone();
            let counters = self.counters.clone();
            let idle_timeout = self.config.idle_timeout();
            self.tasks.spawn(
                async move {
                    serve_connection(pipeline, cache, sink, idle_timeout, stream, peer).await;
                    drop(permit);
                    counters.active.fetch_sub(1, Ordering::Relaxed);
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                .instrument(error_span!("conn", id = conn_id, %peer)),
            );
            conn_id += 1;
        }
        Ok(())
    }

    /// Signals shutdown, then waits up to the grace period for open
    /// connections to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        debug!("shutting down ({} open connections)", self.tasks.len());
        match self.tasks.wait().timeout(SHUTDOWN_GRACE).await {
            Ok(()) => debug!("all connections closed cleanly"),
            Err(_) => debug!(
                remaining = self.tasks.len(),
                "connections still open after grace period, abandoning"
            ),
        }
    }
}

/// Serves requests on one client connection until it should close.
async fn serve_connection(
    pipeline: Arc<Pipeline>,
    cache: Arc<HttpCache>,
    sink: Arc<dyn TransactionSink>,
    idle_timeout: Duration,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = StreamReader::new(read_half, idle_timeout);
    loop {
        let request = match reader.read_request().await {
            Ok(request) => request,
            Err(err) if err.is_eof() => break,
            Err(err) if err.is_timeout() => {
                debug!("client idle timeout");
                break;
            }
            Err(err) if err.is_client_fault() => {
                // The framing is no longer trustworthy; answer 400 and
                // drop the connection.
                debug!("unreadable request: {err:#}");
                let response = e!(ProxyError::BadRequest {
                    reason: err.to_string()
                })
                .to_response()
                .to_bytes();
                write_half.write_all(&response).await.ok();
                sink.record(&TransactionEvent {
                    client_ip: peer.ip(),
                    client_port: peer.port(),
                    cache_tag: CacheTag::Skip,
                    timestamp: SystemTime::now(),
                    request_line: String::new(),
                    status: 400,
                    body_bytes: extract_body_len(&response),
                });
                break;
            }
            Err(err) => {
                debug!("client read failed: {err:#}");
                break;
            }
        };
        let request_line = request.request_line();
        debug!(%request_line, "request received");
        // The cache disposition is recorded before processing so a miss
        // that gets admitted during processing still logs as a miss.
        let cache_tag = cache_tag_for(&cache, &request);

        let outcome = pipeline.handle(&request, &mut reader, &mut write_half).await;
        let (status, body_bytes, close) = match &outcome {
            Outcome::Response(bytes) => {
                let write_failed = write_half.write_all(bytes).await.is_err()
                    || write_half.flush().await.is_err();
                let close = write_failed
                    || request_wants_close(&request)
                    || response_demands_close(bytes);
                (extract_status(bytes), extract_body_len(bytes), close)
            }
            // A serviced tunnel produces no response bytes to parse back,
            // so the logged status falls back to 502 and the spent
            // connection closes.
            Outcome::Tunneled => (502, 0, true),
        };
        sink.record(&TransactionEvent {
            client_ip: peer.ip(),
            client_port: peer.port(),
            cache_tag,
            timestamp: SystemTime::now(),
            request_line,
            status,
            body_bytes,
        });
        if close {
            break;
        }
    }
}

fn cache_tag_for(cache: &HttpCache, request: &Request) -> CacheTag {
    if request.method != Method::GET {
        return CacheTag::Skip;
    }
    if cache.contains(&url::normalize_url(&request.target)) {
        CacheTag::Hit
    } else {
        CacheTag::Miss
    }
}

fn request_wants_close(request: &Request) -> bool {
    transform::client_persistence(request) == Persistence::Close
}

/// Status code parsed back from serialized response bytes, 502 on failure.
fn extract_status(bytes: &[u8]) -> u16 {
    let line_end = bytes.iter().position(|&b| b == b'\n').unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..line_end])
        .ok()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(502)
}

fn header_section_end(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .or_else(|| bytes.windows(2).position(|w| w == b"\n\n").map(|i| i + 2))
}

/// Body bytes after the header terminator, for transaction accounting.
fn extract_body_len(bytes: &[u8]) -> usize {
    header_section_end(bytes)
        .map(|end| bytes.len() - end)
        .unwrap_or(0)
}

/// Whether serialized response bytes demand connection close.
fn response_demands_close(bytes: &[u8]) -> bool {
    let end = header_section_end(bytes).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
        .to_ascii_lowercase()
        .contains("connection: close")
}
