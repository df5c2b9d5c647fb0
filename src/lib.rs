//! # Wirecall
//!
//! A connection-oriented remote call framework. A client binds to an
//! interface description and invokes methods; arguments and results are
//! serialized, framed, optionally filtered (compression, verification),
//! carried over a pluggable transport, dispatched on the server, and
//! returned to the caller.
//!
//! ## Key pieces
//!
//! - **Transports**: TCP, UDP (and multicast fan-out), Unix local
//!   sockets, Windows named pipes, HTTP(S) envelopes, and reverse-tunnel
//!   proxy endpoints — one [`Endpoint`] union, one capability trait.
//! - **Filter chain**: ordered byte transformers between application and
//!   wire, negotiated per connection by stable ids.
//! - **Call engine**: connect, serialize, send, receive as a state
//!   machine with timeouts, progress callbacks, cancellation, ping-back
//!   keepalives, and a one-shot versioning retry.
//! - **Services**: publish/subscribe over adopted connections, resumable
//!   file transfer with bandwidth quotas, proxy-endpoint brokering, idle
//!   session reaping.

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod http;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod service;
pub mod transport;
pub mod typedmap;

pub use buffer::ByteBuffer;
pub use client::{Client, RemoteCallAction, RemoteCallPhase, RemoteCallProgress};
pub use config::{Runtime, RuntimeConfig};
pub use error::{Error, ErrorKind, ProtocolFault, RemoteError, Result};
pub use filter::{Filter, FilterFactory, FilterId, FilterRegistry};
pub use protocol::{ArchiveProtocol, CallMode};
pub use server::{RemoteCallContext, Server, ServerHandle};
pub use service::filetransfer::{download_file, upload_file, FileManifest};
pub use service::proxy::ProxyEndpointAgent;
pub use service::publish::{subscribe, Publisher, PublisherParams, Subscription};
pub use transport::{CancelHandle, Endpoint, Transport, TransportKind};
pub use typedmap::{Key, TypedMap};

/// The crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    use std::time::Duration;

    /// Default transport connect timeout.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Default remote call timeout (send plus receive).
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

    /// Largest accepted incoming message.
    pub const MAX_INCOMING_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;

    /// Concurrent writes a publisher issues across subscribers.
    pub const SIMULTANEOUS_PUBLISH_LIMIT: usize = 32;

    /// Publisher-to-subscriber keepalive interval.
    pub const PUBLISH_PING_INTERVAL: Duration = Duration::from_secs(10);

    /// Window over which file-transfer bandwidth is measured.
    pub const TRANSFER_WINDOW: Duration = Duration::from_secs(5);

    /// Server-side cap on concurrently open sessions.
    pub const MAX_CONNECTIONS: usize = 1024;

    /// Inactivity window after which a session is reaped.
    pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

    /// Cadence of the reaper and harvest cycles.
    pub const REAPING_INTERVAL: Duration = Duration::from_secs(1);

    /// Long-poll absence after which a proxy endpoint is purged.
    pub const PROXY_ENDPOINT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
}
