//! Per-request orchestration.
//!
//! One parsed request goes in; either serialized response bytes come out, or
//! (for CONNECT) the client socket has been taken over by a tunnel relay and
//! nothing further must be written. All failures are mapped to a
//! [`ProxyError`] at this boundary and rendered as error responses; nothing
//! origin-side is surfaced raw.

use std::sync::Arc;

use n0_error::{anyerr, e};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::time::FutureExt;
use tracing::debug;

use crate::{
    cache::HttpCache,
    config::ProxyConfig,
    dial::OriginDialer,
    error::ProxyError,
    parse::{Request, Response},
    reader::{FrameError, StreamReader},
    transform::Transformer,
    tunnel, url,
};

/// Literal reply confirming an established CONNECT tunnel.
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Result of running one request through the pipeline.
pub(crate) enum Outcome {
    /// A complete serialized response to write to the client.
    Response(Vec<u8>),
    /// A CONNECT tunnel ran and finished; the connection is spent.
    Tunneled,
}

/// Per-request dispatch: cache, origin fetch, or tunnel.
pub(crate) struct Pipeline {
    config: ProxyConfig,
    cache: Arc<HttpCache>,
    transformer: Arc<Transformer>,
    dialer: OriginDialer,
}

impl Pipeline {
    pub(crate) fn new(
        config: ProxyConfig,
        cache: Arc<HttpCache>,
        transformer: Arc<Transformer>,
    ) -> Self {
        let dialer = OriginDialer::new(config.idle_timeout());
        Self {
            config,
            cache,
            transformer,
            dialer,
        }
    }

    /// Handles one request on an established client connection.
    ///
    /// GET/HEAD/POST run under the request deadline and yield response
    /// bytes. CONNECT applies the deadline to tunnel establishment only,
    /// then relays until the tunnel ends.
    pub(crate) async fn handle(
        &self,
        request: &Request,
        client_reader: &mut StreamReader<impl AsyncRead + Send + Unpin>,
        client_writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> Outcome {
        match request.method.as_str() {
            "GET" => Outcome::Response(self.with_deadline(self.handle_get(request)).await),
            "HEAD" | "POST" => {
                Outcome::Response(self.with_deadline(self.forward_uncached(request)).await)
            }
            "CONNECT" => self.handle_connect(request, client_reader, client_writer).await,
            other => {
                let err = e!(ProxyError::BadRequest {
                    reason: format!("method not supported: {other}")
                });
                Outcome::Response(err.to_response().to_bytes())
            }
        }
    }

    /// Runs a handler under the request deadline and renders any failure as
    /// an error response. Dropping the timed-out future closes its origin
    /// socket, which cancels the in-flight fetch.
    async fn with_deadline(
        &self,
        handler: impl Future<Output = Result<Vec<u8>, ProxyError>>,
    ) -> Vec<u8> {
        let result = match handler.timeout(self.config.request_deadline()).await {
            Ok(result) => result,
            Err(_) => Err(e!(ProxyError::OriginTimeout {
                operation: "request processing".into()
            })),
        };
        result.unwrap_or_else(|err| {
            debug!("request failed: {err:#}");
            err.to_response().to_bytes()
        })
    }

    async fn handle_get(&self, request: &Request) -> Result<Vec<u8>, ProxyError> {
        let key = url::normalize_url(&request.target);
        if let Some(cached) = self.cache.get(&key) {
            debug!(%key, "serving from cache");
            let response = self.transformer.response_for_client(&cached, request);
            return Ok(response.to_bytes());
        }
        let response = self.fetch_from_origin(request).await?;
        let client_response = self.transformer.response_for_client(&response, request);
        self.cache.put(key, response, request);
        Ok(client_response.to_bytes())
    }

    async fn forward_uncached(&self, request: &Request) -> Result<Vec<u8>, ProxyError> {
        let response = self.fetch_from_origin(request).await?;
        Ok(self
            .transformer
            .response_for_client(&response, request)
            .to_bytes())
    }

    /// Dials the origin, forwards the rewritten request, and reads one
    /// response framed by the request method.
    async fn fetch_from_origin(&self, request: &Request) -> Result<Response, ProxyError> {
        let target = url::parse_absolute_url(&request.target)?;
        if url::is_self_loop(&target.host, target.port, self.config.listen_port) {
            return Err(e!(ProxyError::SelfLoop));
        }
        let mut origin = self.dialer.connect(&target.host, target.port).await?;
        let forwarded = self.transformer.request_for_origin(request, &target);
        origin.write_all(&forwarded.to_bytes()).await.map_err(|source| {
            e!(ProxyError::OriginIo {
                source: anyerr!(source)
            })
        })?;
        let mut reader = StreamReader::new(origin, self.config.idle_timeout());
        let response = reader
            .read_response(&request.method)
            .await
            .map_err(origin_frame_error)?;
        debug!(status = %response.status, body_bytes = response.body.len(), "origin response");
        Ok(response)
    }

    async fn handle_connect(
        &self,
        request: &Request,
        client_reader: &mut StreamReader<impl AsyncRead + Send + Unpin>,
        client_writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> Outcome {
        let establish = async {
            let (host, port) = url::parse_authority_form(&request.target)?;
            if url::is_self_loop(&host, port, self.config.listen_port) {
                return Err(e!(ProxyError::SelfLoop));
            }
            if port != 443 {
                return Err(e!(ProxyError::BadRequest {
                    reason: format!("CONNECT is limited to port 443, got {port}")
                }));
            }
            self.dialer.connect(&host, port).await
        };
        let origin = match establish.timeout(self.config.request_deadline()).await {
            Ok(result) => result,
            Err(_) => Err(e!(ProxyError::OriginTimeout {
                operation: "tunnel establishment".into()
            })),
        };
        let origin = match origin {
            Ok(origin) => origin,
            Err(err) => {
                debug!("CONNECT rejected: {err:#}");
                return Outcome::Response(err.to_response().to_bytes());
            }
        };
        if let Err(err) = client_writer.write_all(CONNECT_ESTABLISHED).await {
            debug!("client went away before tunnel start: {err:#}");
            return Outcome::Tunneled;
        }
        client_writer.flush().await.ok();
        debug!(target = %request.target, "tunnel established");
        let (mut origin_recv, mut origin_send) = origin.into_split();
        tunnel::relay_bidi(client_reader, client_writer, &mut origin_recv, &mut origin_send).await;
        Outcome::Tunneled
    }
}

fn origin_frame_error(err: FrameError) -> ProxyError {
    if err.is_timeout() {
        e!(ProxyError::OriginTimeout {
            operation: "origin read".into()
        })
    } else {
        e!(ProxyError::OriginIo { source: err.into() })
    }
}
