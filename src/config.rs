//! Recognized configuration surface (spec §6). Loading this from a file or
//! environment is explicitly out of scope; this module only defines the
//! shape and the defaults spec.md calls out by name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub thread_pool_size: usize,
    pub request_queue_limit: usize,
    pub request_timeout_ms: u64,
    pub keep_alive_enabled: bool,
    pub keep_alive_timeout_ms: u64,
    pub keep_alive_max_requests: u32,
    pub request_body_max_bytes: u64,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_second: f64,
    pub rate_limit_burst: f64,
    pub rate_limit_max_buckets: usize,
    pub zero_copy_threshold_bytes: u64,
    pub compression_min_bytes: usize,
    pub compression_max_cache_file_bytes: u64,
    pub compression_cache_entries: usize,
    pub etag_cache_entries: usize,
    pub sse_max_connections_per_topic: usize,
    pub virtual_hosts: HashMap<String, PathBuf>,
    pub tls: Option<TlsConfig>,
    pub auth: AuthConfig,
    pub peek_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            thread_pool_size: num_cpus_fallback(),
            request_queue_limit: 1024,
            request_timeout_ms: 5_000,
            keep_alive_enabled: true,
            keep_alive_timeout_ms: 5_000,
            keep_alive_max_requests: 100,
            request_body_max_bytes: 10 * 1024 * 1024,
            rate_limit_enabled: true,
            rate_limit_per_second: 10.0,
            rate_limit_burst: 20.0,
            rate_limit_max_buckets: 10_000,
            zero_copy_threshold_bytes: 10_485_760,
            compression_min_bytes: 256,
            compression_max_cache_file_bytes: 1_048_576,
            compression_cache_entries: 1_000,
            etag_cache_entries: 10_000,
            sse_max_connections_per_topic: 1_000,
            virtual_hosts: HashMap::new(),
            tls: None,
            auth: AuthConfig::default(),
            peek_timeout_ms: 1_000,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    #[must_use]
    pub fn peek_timeout(&self) -> Duration {
        Duration::from_millis(self.peek_timeout_ms)
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub basic: Option<BasicCredentialStore>,
    pub api_keys: Option<Vec<String>>,
}

#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Default)]
pub struct BasicCredentialStore {
    /// username -> password. A real deployment would hash these; spec.md
    /// scopes credential storage out, this just needs to exist so the
    /// auth module (§4.15) has something to compare against.
    pub credentials: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.keep_alive_max_requests, 100);
        assert_eq!(cfg.request_timeout_ms, 5_000);
        assert_eq!(cfg.keep_alive_timeout_ms, 5_000);
        assert_eq!(cfg.rate_limit_max_buckets, 10_000);
        assert_eq!(cfg.zero_copy_threshold_bytes, 10_485_760);
        assert_eq!(cfg.compression_min_bytes, 256);
        assert_eq!(cfg.compression_max_cache_file_bytes, 1_048_576);
        assert_eq!(cfg.compression_cache_entries, 1_000);
        assert_eq!(cfg.etag_cache_entries, 10_000);
        assert_eq!(cfg.sse_max_connections_per_topic, 1_000);
    }
}
