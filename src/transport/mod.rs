//! # Transports
//!
//! An [`Endpoint`] is a tagged address covering the finite transport set;
//! it parses from and prints as a URL-style string. A [`Transport`] is the
//! capability trait every client transport implements: connect, send one
//! message, receive one message, disconnect, cancel. Stream transports
//! (TCP, local socket, named pipe, HTTP, proxied connections) share one
//! framed-connection core; UDP and multicast have datagram semantics.

pub mod conn;
pub mod pipe;
pub mod stream;
pub mod udp;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::buffer::ByteBuffer;
use crate::error::{Error, Result};

pub use conn::{BoxedStream, Connection};
pub use stream::StreamTransport;
pub use udp::{MulticastTransport, UdpTransport};

/// The transport flavor behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
    Multicast,
    Local,
    NamedPipe,
    Http,
    Https,
    Proxy,
}

/// A tagged transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Udp { host: String, port: u16 },
    Multicast { group: String, port: u16 },
    Local { path: String },
    NamedPipe { name: String },
    Http { host: String, port: u16, path: String },
    Https { host: String, port: u16, path: String },
    Proxy { broker: Box<Endpoint>, name: String },
}

impl Endpoint {
    pub fn kind(&self) -> TransportKind {
        match self {
            Endpoint::Tcp { .. } => TransportKind::Tcp,
            Endpoint::Udp { .. } => TransportKind::Udp,
            Endpoint::Multicast { .. } => TransportKind::Multicast,
            Endpoint::Local { .. } => TransportKind::Local,
            Endpoint::NamedPipe { .. } => TransportKind::NamedPipe,
            Endpoint::Http { .. } => TransportKind::Http,
            Endpoint::Https { .. } => TransportKind::Https,
            Endpoint::Proxy { .. } => TransportKind::Proxy,
        }
    }

    /// True for endpoints carried over an ordered byte stream.
    pub fn is_stream(&self) -> bool {
        !matches!(self, Endpoint::Udp { .. } | Endpoint::Multicast { .. })
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint::Tcp { host: host.into(), port }
    }

    pub fn udp(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint::Udp { host: host.into(), port }
    }

    pub fn local(path: impl Into<String>) -> Endpoint {
        Endpoint::Local { path: path.into() }
    }

    pub fn http(host: impl Into<String>, port: u16, path: impl Into<String>) -> Endpoint {
        Endpoint::Http { host: host.into(), port, path: path.into() }
    }

    pub fn proxy(broker: Endpoint, name: impl Into<String>) -> Endpoint {
        Endpoint::Proxy { broker: Box::new(broker), name: name.into() }
    }
}

fn split_host_port(s: &str, what: &str) -> Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| Error::transport(format!("{what} endpoint needs host:port: {s}")))?;
    let port = port
        .parse()
        .map_err(|_| Error::transport(format!("bad port in {what} endpoint: {s}")))?;
    Ok((host.to_string(), port))
}

fn split_http(s: &str, default_port: u16) -> Result<(String, u16, String)> {
    let (authority, path) = match s.find('/') {
        Some(idx) => (&s[..idx], s[idx..].to_string()),
        None => (s, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (
            h.to_string(),
            p.parse()
                .map_err(|_| Error::transport(format!("bad port in http endpoint: {s}")))?,
        ),
        None => (authority.to_string(), default_port),
    };
    Ok((host, port, path))
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Endpoint> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = split_host_port(rest, "tcp")?;
            Ok(Endpoint::Tcp { host, port })
        } else if let Some(rest) = s.strip_prefix("udp://") {
            let (host, port) = split_host_port(rest, "udp")?;
            Ok(Endpoint::Udp { host, port })
        } else if let Some(rest) = s.strip_prefix("multicast://") {
            let (group, port) = split_host_port(rest, "multicast")?;
            Ok(Endpoint::Multicast { group, port })
        } else if let Some(rest) = s.strip_prefix("unix:") {
            Ok(Endpoint::Local { path: rest.to_string() })
        } else if let Some(rest) = s.strip_prefix("pipe:") {
            Ok(Endpoint::NamedPipe { name: rest.to_string() })
        } else if let Some(rest) = s.strip_prefix("http://") {
            let (host, port, path) = split_http(rest, 80)?;
            Ok(Endpoint::Http { host, port, path })
        } else if let Some(rest) = s.strip_prefix("https://") {
            let (host, port, path) = split_http(rest, 443)?;
            Ok(Endpoint::Https { host, port, path })
        } else if let Some(rest) = s.strip_prefix("proxy://") {
            let (broker_part, name) = rest
                .rsplit_once('/')
                .ok_or_else(|| Error::transport(format!("proxy endpoint needs a name: {s}")))?;
            let (host, port) = split_host_port(broker_part, "proxy")?;
            Ok(Endpoint::Proxy {
                broker: Box::new(Endpoint::Tcp { host, port }),
                name: name.to_string(),
            })
        } else {
            Err(Error::transport(format!("unrecognized endpoint: {s}")))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Udp { host, port } => write!(f, "udp://{host}:{port}"),
            Endpoint::Multicast { group, port } => write!(f, "multicast://{group}:{port}"),
            Endpoint::Local { path } => write!(f, "unix:{path}"),
            Endpoint::NamedPipe { name } => write!(f, "pipe:{name}"),
            Endpoint::Http { host, port, path } => write!(f, "http://{host}:{port}{path}"),
            Endpoint::Https { host, port, path } => write!(f, "https://{host}:{port}{path}"),
            Endpoint::Proxy { broker, name } => match broker.as_ref() {
                Endpoint::Tcp { host, port } => write!(f, "proxy://{host}:{port}/{name}"),
                other => write!(f, "proxy://{other}/{name}"),
            },
        }
    }
}

/// Cancellation handle shared between a pending operation and whoever may
/// abort it. Cancelling is sticky: once fired, every pending and future
/// operation on the same handle completes with `Cancelled`.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CancelHandle { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves when the handle is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender kept alive by self; unreachable in practice.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Re-arms the handle after a cancelled call so the owner can be
    /// reused.
    pub fn reset(&self) {
        let _ = self.tx.send(false);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds `fut` by a deadline and a cancellation handle.
pub async fn with_deadline<T, F>(
    fut: F,
    timeout: Duration,
    cancel: &CancelHandle,
    what: &str,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        result = fut => result,
        _ = tokio::time::sleep(timeout) => Err(Error::timeout(format!("{what} timed out after {timeout:?}"))),
        _ = cancel.cancelled() => Err(Error::cancelled()),
    }
}

/// The client transport capability set.
///
/// `send` transmits one whole message (framing is the transport's
/// concern); `receive` yields one whole message. Per-operation deadlines
/// and the cancel handle cover every suspension point.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    fn is_connected(&self) -> bool;

    async fn connect(&mut self, timeout: Duration) -> Result<()>;

    /// Sends one message; returns wire bytes written.
    async fn send(&mut self, message: ByteBuffer, timeout: Duration) -> Result<usize>;

    /// Receives one message frame.
    async fn receive(&mut self, timeout: Duration) -> Result<ByteBuffer>;

    async fn disconnect(&mut self);

    fn cancel_handle(&self) -> CancelHandle;

    /// The framed connection, for filter installation and adoption.
    /// Datagram transports return `None`.
    fn connection_mut(&mut self) -> Option<&mut Connection> {
        None
    }

    /// Detaches the framed connection, leaving the transport disconnected.
    fn take_connection(&mut self) -> Option<Connection> {
        None
    }
}
