//! Validated runtime configuration.

use std::time::Duration;

use n0_error::{e, stack_error};

/// Rejected configuration values.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("port must be between 1024 and 65535, got {port}")]
    InvalidPort { port: u16 },
    #[error("timeout must be a positive number of seconds")]
    InvalidTimeout,
    #[error("max object size must be positive")]
    InvalidObjectSize,
    #[error("max cache size must be positive")]
    InvalidCacheSize,
    #[error("max cache size ({max_cache_bytes}) must be at least the max object size ({max_object_bytes})")]
    CacheSmallerThanObject {
        max_cache_bytes: usize,
        max_object_bytes: usize,
    },
}

/// Immutable proxy configuration, validated at construction.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_port: u16,
    pub idle_timeout_secs: u64,
    pub max_object_bytes: usize,
    pub max_cache_bytes: usize,
    /// Token appended to `Via` headers on both forwarding directions.
    pub proxy_id: String,
}

impl ProxyConfig {
    pub const DEFAULT_PROXY_ID: &'static str = "1.1 cachepipe";

    /// Validates and builds a configuration with the default proxy id.
    pub fn new(
        listen_port: u16,
        idle_timeout_secs: u64,
        max_object_bytes: usize,
        max_cache_bytes: usize,
    ) -> Result<Self, ConfigError> {
        if listen_port < 1024 {
            return Err(e!(ConfigError::InvalidPort { port: listen_port }));
        }
        if idle_timeout_secs == 0 {
            return Err(e!(ConfigError::InvalidTimeout));
        }
        if max_object_bytes == 0 {
            return Err(e!(ConfigError::InvalidObjectSize));
        }
        if max_cache_bytes == 0 {
            return Err(e!(ConfigError::InvalidCacheSize));
        }
        if max_cache_bytes < max_object_bytes {
            return Err(e!(ConfigError::CacheSmallerThanObject {
                max_cache_bytes,
                max_object_bytes
            }));
        }
        Ok(Self {
            listen_port,
            idle_timeout_secs,
            max_object_bytes,
            max_cache_bytes,
            proxy_id: Self::DEFAULT_PROXY_ID.to_string(),
        })
    }

    /// Replaces the `Via` token.
    pub fn with_proxy_id(mut self, proxy_id: impl Into<String>) -> Self {
        self.proxy_id = proxy_id.into();
        self
    }

    /// Idle timeout for client and origin socket reads and origin connects.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Wall-clock deadline for handling one request, one second under the
    /// idle timeout so the timeout response still reaches the client.
    /// Clamped to at least one second.
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.saturating_sub(1).max(1))
    }
}
