//! # Runtime Configuration
//!
//! All process-wide knobs live in an explicit [`Runtime`] value constructed
//! at startup and handed to every client and server factory. There is no
//! global mutable state: two runtimes with different settings can coexist
//! in one process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::filter::FilterRegistry;
use crate::http::HttpMessageVerifier;
use crate::protocol::{ArchiveProtocol, ARCHIVE_VERSION, RUNTIME_VERSION};

/// Plain-data configuration. See [`crate::defaults`] for the values used by
/// [`RuntimeConfig::default`].
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Bound on transport connection establishment.
    pub connect_timeout: Duration,
    /// Bound on one remote call (send + receive), extended by ping-backs.
    pub call_timeout: Duration,
    /// Largest frame a peer may send before the session closes.
    pub max_incoming_message_length: usize,
    /// Socket send/receive buffer size; zero keeps the OS default.
    pub socket_buffer_size: usize,
    /// Runtime protocol version spoken and advertised.
    pub runtime_version: u32,
    /// Archive encoding version spoken and advertised.
    pub archive_version: u32,
    /// Default archive protocol for new clients and publishers.
    pub archive_protocol: ArchiveProtocol,
    /// Concurrent writes a publisher issues across its subscribers.
    pub simultaneous_publish_limit: usize,
    /// Publisher-to-subscriber keepalive interval.
    pub publish_ping_interval: Duration,
    /// Window over which file-transfer bandwidth is measured and paced.
    pub transfer_window: Duration,
    /// Bytes per second granted to file uploads; zero means unlimited.
    pub upload_quota_bps: u32,
    /// Bytes per second granted to file downloads; zero means unlimited.
    pub download_quota_bps: u32,
    /// Directory that receives uploaded files.
    pub upload_directory: Option<PathBuf>,
    /// Directory that download requests are resolved against.
    pub download_directory: Option<PathBuf>,
    /// Server-side cap on concurrently open sessions.
    pub max_connections: usize,
    /// Inactivity window after which a session is reaped.
    pub session_idle_timeout: Duration,
    /// How often the reaper and harvest timers run.
    pub reaping_interval: Duration,
    /// How long a proxy endpoint may stay away from its long poll before
    /// the broker purges it, and how long a waiting client holds on.
    pub proxy_endpoint_idle_timeout: Duration,
    /// Password demanded from back-ends registering proxy endpoints.
    pub proxy_endpoint_password: Option<String>,
    /// Outbound HTTP proxy for CONNECT tunnelling:
    /// `(host, port, credentials)`.
    pub http_proxy: Option<(String, u16, Option<(String, String)>)>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        use crate::defaults;

        RuntimeConfig {
            connect_timeout: defaults::CONNECT_TIMEOUT,
            call_timeout: defaults::CALL_TIMEOUT,
            max_incoming_message_length: defaults::MAX_INCOMING_MESSAGE_LENGTH,
            socket_buffer_size: 0,
            runtime_version: RUNTIME_VERSION,
            archive_version: ARCHIVE_VERSION,
            archive_protocol: ArchiveProtocol::Binary,
            simultaneous_publish_limit: defaults::SIMULTANEOUS_PUBLISH_LIMIT,
            publish_ping_interval: defaults::PUBLISH_PING_INTERVAL,
            transfer_window: defaults::TRANSFER_WINDOW,
            upload_quota_bps: 0,
            download_quota_bps: 0,
            upload_directory: None,
            download_directory: None,
            max_connections: defaults::MAX_CONNECTIONS,
            session_idle_timeout: defaults::SESSION_IDLE_TIMEOUT,
            reaping_interval: defaults::REAPING_INTERVAL,
            proxy_endpoint_idle_timeout: defaults::PROXY_ENDPOINT_IDLE_TIMEOUT,
            proxy_endpoint_password: None,
            http_proxy: None,
        }
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    filters: FilterRegistry,
    http_verifier: Option<Arc<dyn HttpMessageVerifier>>,
}

/// Shared handle to one runtime's configuration and registries. Cloning is
/// cheap; all clones observe the same registries.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Runtime {
            inner: Arc::new(RuntimeInner {
                config,
                filters: FilterRegistry::with_defaults(),
                http_verifier: None,
            }),
        }
    }

    /// Runtime with a non-default filter registry or HTTP verifier.
    pub fn with_parts(
        config: RuntimeConfig,
        filters: FilterRegistry,
        http_verifier: Option<Arc<dyn HttpMessageVerifier>>,
    ) -> Self {
        Runtime {
            inner: Arc::new(RuntimeInner {
                config,
                filters,
                http_verifier,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn filters(&self) -> &FilterRegistry {
        &self.inner.filters
    }

    pub fn http_verifier(&self) -> Option<Arc<dyn HttpMessageVerifier>> {
        self.inner.http_verifier.clone()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new(RuntimeConfig::default())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("filters", self.filters())
            .field(
                "max_incoming_message_length",
                &self.config().max_incoming_message_length,
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_incoming_message_length, 16 * 1024 * 1024);
        assert_eq!(cfg.archive_protocol, ArchiveProtocol::Binary);
        assert!(cfg.upload_directory.is_none());
    }

    #[test]
    fn runtimes_are_independent() {
        let a = Runtime::default();
        let mut cfg = RuntimeConfig::default();
        cfg.max_connections = 1;
        let b = Runtime::new(cfg);
        assert_ne!(a.config().max_connections, b.config().max_connections);
    }
}
