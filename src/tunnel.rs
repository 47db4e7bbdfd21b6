//! Bidirectional byte relay for CONNECT tunnels.
//!
//! Each direction copies in 4 KiB frames and flushes after every write so
//! interactive protocols inside the tunnel are not delayed. A direction ends
//! on its own EOF or error and shuts down its write side; the relay returns
//! when both directions have ended or the overall cap fires.

use std::{io, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::Instant,
};
use tokio_util::time::FutureExt;
use tracing::{debug, trace};

const RELAY_BUF_BYTES: usize = 4096;

/// Upper bound on a tunnel's total lifetime.
const TUNNEL_MAX_DURATION: Duration = Duration::from_secs(300);

async fn copy_flush(
    reader: &mut (impl AsyncRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
) -> io::Result<u64> {
    let mut buf = [0u8; RELAY_BUF_BYTES];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
    Ok(total)
}

/// Relays bytes between a client and an origin until both directions end.
///
/// Returns `(client_to_origin, origin_to_client)` byte counts, or `None`
/// when the overall tunnel cap fired first.
pub(crate) async fn relay_bidi(
    client_recv: &mut (impl AsyncRead + Send + Unpin),
    client_send: &mut (impl AsyncWrite + Send + Unpin),
    origin_recv: &mut (impl AsyncRead + Send + Unpin),
    origin_send: &mut (impl AsyncWrite + Send + Unpin),
) -> Option<(u64, u64)> {
    let start = Instant::now();
    let relay = async {
        tokio::join!(
            async {
                let res = copy_flush(client_recv, origin_send).await;
                origin_send.shutdown().await.ok();
                trace!(?res, elapsed = ?start.elapsed(), "relay client-to-origin finished");
                res.unwrap_or(0)
            },
            async {
                let res = copy_flush(origin_recv, client_send).await;
                client_send.shutdown().await.ok();
                trace!(?res, elapsed = ?start.elapsed(), "relay origin-to-client finished");
                res.unwrap_or(0)
            }
        )
    };
    match relay.timeout(TUNNEL_MAX_DURATION).await {
        Ok(counts) => Some(counts),
        Err(_) => {
            debug!("tunnel exceeded maximum duration, closing");
            None
        }
    }
}
