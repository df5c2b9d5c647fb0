//! # Server, Service Registry and Dispatcher
//!
//! A [`Server`] holds the interface bindings and the auxiliary services
//! (publishing, file transfer, proxy endpoints, ping-back, session
//! reaping) and serves any number of endpoints. Each accepted connection
//! becomes a session task; the session reads framed requests, dispatches
//! built-ins internally, and hands user requests to bound handlers
//! through a [`RemoteCallContext`].

pub mod context;
pub mod session;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::filter::filter_ids;
use crate::service::filetransfer::FileTransferService;
use crate::service::pingback::PingBackService;
use crate::service::proxy::ProxyEndpointService;
use crate::service::publish::{Publisher, PublisherParams, PublishingService};
use crate::service::session_timeout::SessionTimeoutService;
use crate::transport::{pipe, stream::configure_tcp, CancelHandle, Connection, Endpoint};

pub use context::{RemoteCallContext, SessionData};
pub use session::SessionEnvelope;

/// Erased method handler: decodes its arguments from the context and
/// commits a reply, inline or later from another task.
pub type MethodHandler = Arc<dyn Fn(RemoteCallContext) + Send + Sync>;

/// Invoked when a client turns its connection into a callback channel.
pub type CallbackConnectionHandler = Arc<dyn Fn(Client) + Send + Sync>;

/// One bound method: declared arity plus the handler.
#[derive(Clone)]
pub struct MethodEntry {
    pub arity: u8,
    pub handler: MethodHandler,
}

/// Live session bookkeeping shared with the reaper.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub cancel: CancelHandle,
    pub last_activity_ms: Arc<AtomicU64>,
}

/// Registry of open sessions.
#[derive(Default)]
pub struct SessionRegistry {
    map: Mutex<HashMap<u64, SessionHandle>>,
}

impl SessionRegistry {
    pub fn insert(&self, handle: SessionHandle) {
        self.map.lock().insert(handle.id, handle);
    }

    pub fn remove(&self, id: u64) {
        self.map.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.map.lock().values().cloned().collect()
    }
}

#[derive(Default)]
pub(crate) struct PerfCounters {
    pub sessions_opened: AtomicU64,
    pub requests_dispatched: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

/// Point-in-time server counters.
#[derive(Debug, Clone, Copy)]
pub struct PerfSnapshot {
    pub sessions_opened: u64,
    pub active_sessions: usize,
    pub requests_dispatched: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

pub(crate) struct ServerCore {
    pub runtime: Runtime,
    pub bindings: RwLock<HashMap<String, HashMap<u32, MethodEntry>>>,
    pub sessions: Arc<SessionRegistry>,
    pub stats: PerfCounters,
    pub publishing: PublishingService,
    pub file_transfer: FileTransferService,
    pub proxy: ProxyEndpointService,
    pub pingback: PingBackService,
    pub callback_handler: RwLock<Option<CallbackConnectionHandler>>,
    pub session_seq: AtomicU64,
    pub shutdown: CancelHandle,
    services_started: AtomicBool,
}

/// The server. Cheap to clone; clones share bindings and services.
#[derive(Clone)]
pub struct Server {
    core: Arc<ServerCore>,
}

impl Server {
    pub fn new(runtime: &Runtime) -> Self {
        Server {
            core: Arc::new(ServerCore {
                runtime: runtime.clone(),
                bindings: RwLock::new(HashMap::new()),
                sessions: Arc::new(SessionRegistry::default()),
                stats: PerfCounters::default(),
                publishing: PublishingService::new(runtime.clone()),
                file_transfer: FileTransferService::new(runtime.clone()),
                proxy: ProxyEndpointService::new(runtime.clone()),
                pingback: PingBackService::new(),
                callback_handler: RwLock::new(None),
                session_seq: AtomicU64::new(1),
                shutdown: CancelHandle::new(),
                services_started: AtomicBool::new(false),
            }),
        }
    }

    /// Starts binding methods of an interface.
    pub fn bind(&self, interface: impl Into<String>) -> InterfaceBinder {
        InterfaceBinder {
            core: self.core.clone(),
            interface: interface.into(),
        }
    }

    pub fn unbind(&self, interface: &str) {
        self.core.bindings.write().remove(interface);
    }

    /// Creates a publisher; subscribers reach it by topic name.
    pub fn create_publisher(&self, params: PublisherParams) -> Result<Publisher> {
        self.core.publishing.create_publisher(params)
    }

    /// Registers the handler that receives adopted callback connections.
    pub fn on_callback_connection(&self, handler: CallbackConnectionHandler) {
        *self.core.callback_handler.write() = Some(handler);
    }

    pub fn stats(&self) -> PerfSnapshot {
        let stats = &self.core.stats;
        PerfSnapshot {
            sessions_opened: stats.sessions_opened.load(Ordering::Relaxed),
            active_sessions: self.core.sessions.len(),
            requests_dispatched: stats.requests_dispatched.load(Ordering::Relaxed),
            bytes_in: stats.bytes_in.load(Ordering::Relaxed),
            bytes_out: stats.bytes_out.load(Ordering::Relaxed),
        }
    }

    /// Spawns the background service cycles once per server.
    fn ensure_services(&self) {
        if self.core.services_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let shutdown = self.core.shutdown.clone();
        tokio::spawn(self.core.pingback.clone().run(shutdown.clone()));
        tokio::spawn(self.core.publishing.clone().run(shutdown.clone()));
        tokio::spawn(self.core.file_transfer.clone().run(shutdown.clone()));
        tokio::spawn(self.core.proxy.clone().run(shutdown.clone()));
        let reaper =
            SessionTimeoutService::new(self.core.runtime.clone(), self.core.sessions.clone());
        tokio::spawn(reaper.run(shutdown));
    }

    /// Binds the endpoint and starts accepting connections.
    pub async fn serve(&self, endpoint: &Endpoint) -> Result<ServerHandle> {
        self.ensure_services();
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                let local = listener.local_addr()?;
                let resolved = Endpoint::tcp(host.clone(), local.port());
                let cancel = self.spawn_tcp_acceptor(listener, SessionEnvelope::Raw);
                info!(endpoint = %resolved, "server listening");
                Ok(ServerHandle { endpoint: resolved, cancel })
            }
            Endpoint::Http { host, port, path } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                let local = listener.local_addr()?;
                let resolved = Endpoint::Http {
                    host: host.clone(),
                    port: local.port(),
                    path: path.clone(),
                };
                let cancel = self.spawn_tcp_acceptor(listener, SessionEnvelope::Http);
                info!(endpoint = %resolved, "server listening");
                Ok(ServerHandle { endpoint: resolved, cancel })
            }
            Endpoint::Https { host, port, path } => {
                if !self.core.runtime.filters().contains(filter_ids::TLS) {
                    return Err(Error::filter(
                        "serving https requires a registered TLS filter factory",
                    ));
                }
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                let local = listener.local_addr()?;
                let resolved = Endpoint::Https {
                    host: host.clone(),
                    port: local.port(),
                    path: path.clone(),
                };
                let cancel = self.spawn_tcp_acceptor(listener, SessionEnvelope::Https);
                info!(endpoint = %resolved, "server listening");
                Ok(ServerHandle { endpoint: resolved, cancel })
            }
            #[cfg(unix)]
            Endpoint::Local { path } => {
                let listener = tokio::net::UnixListener::bind(path)?;
                let resolved = endpoint.clone();
                let cancel = self.spawn_unix_acceptor(listener, path.clone());
                info!(endpoint = %resolved, "server listening");
                Ok(ServerHandle { endpoint: resolved, cancel })
            }
            #[cfg(not(unix))]
            Endpoint::Local { path } => Err(Error::transport(format!(
                "local socket endpoint {path} is not available on this platform"
            ))),
            Endpoint::NamedPipe { name } => {
                let cancel = self.spawn_pipe_acceptor(name.clone());
                Ok(ServerHandle { endpoint: endpoint.clone(), cancel })
            }
            Endpoint::Udp { host, port } => {
                let socket = UdpSocket::bind((host.as_str(), *port)).await?;
                let local = socket.local_addr()?;
                let resolved = Endpoint::udp(host.clone(), local.port());
                let cancel = self.spawn_udp_server(socket);
                info!(endpoint = %resolved, "server listening");
                Ok(ServerHandle { endpoint: resolved, cancel })
            }
            Endpoint::Multicast { .. } | Endpoint::Proxy { .. } => Err(Error::transport(
                "this endpoint kind cannot be served directly; use a proxy endpoint agent",
            )),
        }
    }

    fn accept_allowed(&self) -> bool {
        let limit = self.core.runtime.config().max_connections;
        limit == 0 || self.core.sessions.len() < limit
    }

    fn spawn_tcp_acceptor(&self, listener: TcpListener, envelope: SessionEnvelope) -> CancelHandle {
        let cancel = CancelHandle::new();
        let accept_cancel = cancel.clone();
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => return,
                    _ = server.core.shutdown.cancelled() => return,
                    a = listener.accept() => a,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        if !server.accept_allowed() {
                            warn!(%peer, "connection limit reached; dropping connection");
                            continue;
                        }
                        let stream = match configure_tcp(stream, &server.core.runtime) {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(%peer, error = %e, "socket configuration failed");
                                continue;
                            }
                        };
                        let peer_endpoint = Endpoint::tcp(peer.ip().to_string(), peer.port());
                        session::spawn(
                            server.core.clone(),
                            Box::new(stream),
                            envelope,
                            peer_endpoint,
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        return;
                    }
                }
            }
        });
        cancel
    }

    #[cfg(unix)]
    fn spawn_unix_acceptor(
        &self,
        listener: tokio::net::UnixListener,
        path: String,
    ) -> CancelHandle {
        let cancel = CancelHandle::new();
        let accept_cancel = cancel.clone();
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    _ = server.core.shutdown.cancelled() => break,
                    a = listener.accept() => a,
                };
                match accepted {
                    Ok((stream, _)) => {
                        if !server.accept_allowed() {
                            warn!("connection limit reached; dropping local connection");
                            continue;
                        }
                        session::spawn(
                            server.core.clone(),
                            Box::new(stream),
                            SessionEnvelope::Raw,
                            Endpoint::local(path.clone()),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        break;
                    }
                }
            }
            let _ = std::fs::remove_file(&path);
        });
        cancel
    }

    fn spawn_pipe_acceptor(&self, name: String) -> CancelHandle {
        let cancel = CancelHandle::new();
        let accept_cancel = cancel.clone();
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => return,
                    _ = server.core.shutdown.cancelled() => return,
                    a = pipe::accept(&name) => a,
                };
                match accepted {
                    Ok(stream) => {
                        if !server.accept_allowed() {
                            warn!("connection limit reached; dropping pipe connection");
                            continue;
                        }
                        session::spawn(
                            server.core.clone(),
                            stream,
                            SessionEnvelope::Raw,
                            Endpoint::NamedPipe { name: name.clone() },
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "pipe accept failed");
                        return;
                    }
                }
            }
        });
        cancel
    }

    fn spawn_udp_server(&self, socket: UdpSocket) -> CancelHandle {
        let cancel = CancelHandle::new();
        let accept_cancel = cancel.clone();
        let server = self.clone();
        let socket = Arc::new(socket);
        tokio::spawn(async move {
            let max = server.core.runtime.config().max_incoming_message_length;
            let mut buf = vec![0u8; max.min(crate::transport::udp::MAX_DATAGRAM_LEN)];
            loop {
                let received = tokio::select! {
                    _ = accept_cancel.cancelled() => return,
                    _ = server.core.shutdown.cancelled() => return,
                    r = socket.recv_from(&mut buf) => r,
                };
                match received {
                    Ok((n, peer)) => {
                        let data = buf[..n].to_vec();
                        let core = server.core.clone();
                        let socket = socket.clone();
                        tokio::spawn(async move {
                            session::handle_datagram(core, socket, peer, data).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "udp receive failed");
                        return;
                    }
                }
            }
        });
        cancel
    }

    /// Serves calls arriving on an adopted, already-framed connection:
    /// subscription channels, callback connections, reverse proxy
    /// connections. Returns the session's cancel handle.
    pub fn serve_adopted(&self, conn: Connection, peer: Endpoint) -> CancelHandle {
        self.ensure_services();
        session::spawn_adopted(self.core.clone(), conn, peer)
    }

    /// Stops acceptors, background services, and open sessions.
    pub fn shutdown(&self) {
        debug!("server shutting down");
        self.core.shutdown.cancel();
        for handle in self.core.sessions.snapshot() {
            handle.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let interfaces: Vec<String> = self.core.bindings.read().keys().cloned().collect();
        f.debug_struct("Server")
            .field("interfaces", &interfaces)
            .field("active_sessions", &self.core.sessions.len())
            .finish()
    }
}

/// A served endpoint: the resolved address and the acceptor's handle.
#[derive(Debug)]
pub struct ServerHandle {
    endpoint: Endpoint,
    cancel: CancelHandle,
}

impl ServerHandle {
    /// The endpoint actually bound (port zero resolves here).
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stops accepting on this endpoint; existing sessions continue.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Builder-style method registration for one interface.
pub struct InterfaceBinder {
    core: Arc<ServerCore>,
    interface: String,
}

impl InterfaceBinder {
    /// Binds an erased handler.
    pub fn method(self, method_id: u32, arity: u8, handler: MethodHandler) -> Self {
        self.core
            .bindings
            .write()
            .entry(self.interface.clone())
            .or_default()
            .insert(method_id, MethodEntry { arity, handler });
        self
    }

    /// Binds a synchronous typed handler. `Args` is the argument tuple.
    pub fn method_fn<Args, R, F>(self, method_id: u32, arity: u8, f: F) -> Self
    where
        Args: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(Args) -> Result<R> + Send + Sync + 'static,
    {
        let handler: MethodHandler = Arc::new(move |ctx: RemoteCallContext| {
            match ctx.args::<Args>() {
                Ok(args) => match f(args) {
                    Ok(result) => {
                        if let Err(e) = ctx.commit(&result) {
                            warn!(error = %e, "reply serialization failed");
                        }
                    }
                    Err(e) => ctx.commit_error(e),
                },
                Err(e) => ctx.commit_error(e),
            }
        });
        self.method(method_id, arity, handler)
    }

    /// Binds an async typed handler; the future runs on its own task and
    /// commits the context when it completes.
    pub fn method_async<Args, R, F, Fut>(self, method_id: u32, arity: u8, f: F) -> Self
    where
        Args: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |ctx: RemoteCallContext| {
            match ctx.args::<Args>() {
                Ok(args) => {
                    let fut = f(args);
                    tokio::spawn(async move {
                        match fut.await {
                            Ok(result) => {
                                if let Err(e) = ctx.commit(&result) {
                                    warn!(error = %e, "reply serialization failed");
                                }
                            }
                            Err(e) => ctx.commit_error(e),
                        }
                    });
                }
                Err(e) => ctx.commit_error(e),
            }
        });
        self.method(method_id, arity, handler)
    }

    /// Binds a handler that takes the raw context, for deferred completion
    /// without an intermediate future.
    pub fn method_ctx<F>(self, method_id: u32, arity: u8, f: F) -> Self
    where
        F: Fn(RemoteCallContext) + Send + Sync + 'static,
    {
        self.method(method_id, arity, Arc::new(f))
    }
}
