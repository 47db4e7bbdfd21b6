use clap::Parser;
use n0_error::Result;
use tracing::info;

use cachepipe::{ProxyConfig, ProxyServer};

/// Caching HTTP/1.x forward proxy.
#[derive(Parser)]
struct Cli {
    /// Port to listen on (1024-65535).
    port: u16,
    /// Idle timeout in seconds for client and origin sockets.
    timeout: u64,
    /// Largest response body admitted into the cache, in bytes.
    max_object_size: usize,
    /// Total cache budget in bytes; at least the max object size.
    max_cache_size: usize,
    /// Token appended to Via headers.
    #[clap(long)]
    proxy_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let mut config = ProxyConfig::new(
        cli.port,
        cli.timeout,
        cli.max_object_size,
        cli.max_cache_size,
    )?;
    if let Some(proxy_id) = cli.proxy_id {
        config = config.with_proxy_id(proxy_id);
    }
    let server = ProxyServer::new(config);
    let listener = server.bind().await?;
    tokio::select! {
        res = server.run(listener) => res?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
    }
    server.shutdown().await;
    Ok(())
}
