//! Buffered message reading from stream sockets.
//!
//! [`StreamReader`] owns the read half of a socket plus an internal buffer,
//! and knows the three body-framing disciplines the proxy needs: a bounded
//! header section ending in a blank line, an exact `Content-Length` count,
//! and close-delimited reads that end on EOF or a short quiet period.
//!
//! Every read from the inner socket is bounded by the reader's timeout,
//! standing in for a socket-level read timeout.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use http::Method;
use n0_error::{e, stack_error};
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::time::FutureExt;

use crate::{
    MAX_HEADER_BYTES,
    parse::{Request, Response},
};

/// Initial capacity for the internal buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Read timeout applied while draining a close-delimited body. A quiet
/// origin for this long ends the body.
const CLOSE_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Failure modes while framing a message from a socket.
#[stack_error(derive, add_meta)]
pub enum FrameError {
    /// The peer closed the connection before sending anything.
    #[error("connection closed")]
    Eof,
    /// No data arrived within the read timeout.
    #[error("timed out while reading")]
    Timeout,
    /// The header section did not terminate within the allowed size.
    #[error("header section exceeds 64 KiB")]
    HeadersTooLarge,
    /// The bytes received do not form a valid message.
    #[error("malformed message: {reason}")]
    Parse { reason: String },
    /// The underlying socket failed.
    #[error("i/o failure while reading")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
}

impl FrameError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FrameError::Timeout { .. })
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Eof { .. })
    }

    /// Whether the failure should be answered with `400 Bad Request` when it
    /// happened on a client connection (rather than silently closing).
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            FrameError::HeadersTooLarge { .. } | FrameError::Parse { .. }
        )
    }
}

/// Buffered reader over the read half of a stream socket.
pub struct StreamReader<R> {
    inner: R,
    buf: BytesMut,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    /// Creates a reader whose socket reads are bounded by `read_timeout`.
    pub fn new(inner: R, read_timeout: Duration) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            read_timeout,
        }
    }

    /// Reads until the first blank line and returns the header section,
    /// terminator included.
    ///
    /// Accepts `\r\n\r\n` or the lenient `\n\n`. Bytes past the terminator
    /// stay buffered for the body or a pipelined message.
    pub async fn read_header_block(&mut self) -> Result<Bytes, FrameError> {
        loop {
            if let Some(end) = find_header_end(&self.buf) {
                if end > MAX_HEADER_BYTES {
                    return Err(e!(FrameError::HeadersTooLarge));
                }
                return Ok(self.buf.split_to(end).freeze());
            }
            if self.buf.len() >= MAX_HEADER_BYTES {
                return Err(e!(FrameError::HeadersTooLarge));
            }
            let n = self.fill(self.read_timeout).await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Err(e!(FrameError::Eof))
                } else {
                    Err(e!(FrameError::Parse {
                        reason: "connection closed before end of header section".into()
                    }))
                };
            }
        }
    }

    /// Reads exactly `n` bytes, draining the buffer first.
    pub async fn read_exact_bytes(&mut self, n: usize) -> Result<Bytes, FrameError> {
        while self.buf.len() < n {
            let got = self.fill(self.read_timeout).await?;
            if got == 0 {
                return Err(e!(FrameError::Parse {
                    reason: format!("expected {n} body bytes, got {}", self.buf.len())
                }));
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Reads until EOF or until the peer goes quiet, returning whatever
    /// accumulated. Used for close-delimited and chunk-opaque bodies.
    pub async fn read_until_close(&mut self) -> Result<Bytes, FrameError> {
        loop {
            match self.fill(CLOSE_READ_TIMEOUT).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.is_timeout() => break,
                Err(err) => return Err(err),
            }
        }
        Ok(self.buf.split().freeze())
    }

    /// Reads one complete request: header section plus a `Content-Length`
    /// body when declared. Chunked request bodies are not supported.
    pub async fn read_request(&mut self) -> Result<Request, FrameError> {
        let block = self.read_header_block().await?;
        let mut request = Request::parse_header_block(&block)
            .map_err(|err| e!(FrameError::Parse { reason: format!("{err:#}") }))?;
        let content_length = request
            .content_length()
            .map_err(|err| e!(FrameError::Parse { reason: format!("{err:#}") }))?;
        if let Some(len) = content_length
            && len > 0
        {
            request.body = self.read_exact_bytes(len).await?;
        }
        Ok(request)
    }

    /// Reads one complete response for a request issued with `method`.
    ///
    /// Body framing, in order: no body for `HEAD`/204/304; chunked transfer
    /// is collected opaquely until close; then `Content-Length`; then
    /// close-delimited when the origin said `Connection: close`; otherwise
    /// empty.
    pub async fn read_response(&mut self, method: &Method) -> Result<Response, FrameError> {
        let block = self.read_header_block().await?;
        let mut response = Response::parse_header_block(&block)
            .map_err(|err| e!(FrameError::Parse { reason: format!("{err:#}") }))?;

        if *method == Method::HEAD
            || response.status.as_u16() == 204
            || response.status.as_u16() == 304
        {
            return Ok(response);
        }
        if response.headers.contains("transfer-encoding") {
            if response.is_chunked() {
                response.body = self.read_until_close().await?;
            }
            // Unknown transfer coding: treat as no body.
            return Ok(response);
        }
        let content_length = response
            .content_length()
            .map_err(|err| e!(FrameError::Parse { reason: format!("{err:#}") }))?;
        match content_length {
            Some(len) => {
                if len > 0 {
                    response.body = self.read_exact_bytes(len).await?;
                }
            }
            None => {
                if response.says_close() {
                    response.body = self.read_until_close().await?;
                }
            }
        }
        Ok(response)
    }

    async fn fill(&mut self, timeout: Duration) -> Result<usize, FrameError> {
        match self.inner.read_buf(&mut self.buf).timeout(timeout).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(source)) => Err(e!(FrameError::Io { source })),
            Err(_) => Err(e!(FrameError::Timeout)),
        }
    }
}

/// Returns the end offset (exclusive) of the first blank-line terminator.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    for i in 0..buf.len() {
        if buf[i] != b'\n' {
            continue;
        }
        if i >= 1 && buf[i - 1] == b'\n' {
            return Some(i + 1);
        }
        if i >= 3 && &buf[i - 3..i] == b"\r\n\r" {
            return Some(i + 1);
        }
    }
    None
}

impl<R: AsyncRead + Unpin> AsyncRead for StreamReader<R> {
    /// Drains buffered bytes first, then falls through to the socket. This
    /// lets a reader that finished framing hand the remaining byte stream to
    /// a tunnel relay without losing read-ahead data.
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}
