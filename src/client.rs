//! # Client Stub and Call Engine
//!
//! A [`Client`] owns one transport to one endpoint and drives remote calls
//! through it. The same engine serves every call:
//!
//! 1. **Connect** if needed, negotiating transport filters on the bare
//!    connection first.
//! 2. **Serialize** the header and argument tuple.
//! 3. **Send** the framed message through the filter chain.
//! 4. **Receive** (two-way only): ping-back frames re-arm the receive
//!    deadline; an error frame raises the carried error; otherwise the
//!    return value is decoded.
//! 5. **Progress**: after each step the progress state updates and the
//!    registered callback may cancel the in-flight operation.
//!
//! The connect timeout bounds step 1. The remote-call timeout bounds steps
//! 2–4 together, except that every received ping-back frame restarts it.
//! On a versioning error the stub records the server's advised versions
//! and retries once; on a retryable transport error (peer closed before
//! any data) it reconnects and retries once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Runtime;
use crate::error::{Error, ErrorKind, ProtocolFault, Result};
use crate::filter::{negotiation::FilterAck, negotiation::FilterRequest, FilterId};
use crate::protocol::{
    self, method_ids, ArchiveProtocol, CallMode, Message, MessageHeader,
};
use crate::transport::{
    CancelHandle, Endpoint, StreamTransport, Transport, TransportKind, UdpTransport,
};

/// Which activity a remote call is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCallPhase {
    Connect,
    Send,
    Receive,
}

/// Returned by a progress callback to continue or abort the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCallAction {
    Continue,
    Cancel,
}

/// Live progress of the current call.
#[derive(Debug, Clone, Copy)]
pub struct RemoteCallProgress {
    pub phase: RemoteCallPhase,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
}

impl Default for RemoteCallProgress {
    fn default() -> Self {
        RemoteCallProgress {
            phase: RemoteCallPhase::Connect,
            bytes_transferred: 0,
            bytes_total: 0,
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(&RemoteCallProgress) -> RemoteCallAction + Send + Sync>;

fn make_transport(runtime: &Runtime, endpoint: &Endpoint) -> Box<dyn Transport> {
    match endpoint {
        Endpoint::Udp { host, port } => {
            Box::new(UdpTransport::new(runtime.clone(), host.clone(), *port))
        }
        Endpoint::Multicast { group, port } => Box::new(UdpTransport::new_multicast(
            runtime.clone(),
            group.clone(),
            *port,
        )),
        other => Box::new(StreamTransport::new(runtime.clone(), other.clone())),
    }
}

/// The client stub: endpoint, transport, timeouts, and per-call state.
pub struct Client {
    runtime: Runtime,
    endpoint: Endpoint,
    transport: Box<dyn Transport>,
    protocol: ArchiveProtocol,
    runtime_version: u32,
    archive_version: u32,
    connect_timeout: Duration,
    call_timeout: Duration,
    ping_back_interval_ms: u32,
    transport_filter_ids: Vec<FilterId>,
    filters_negotiated: bool,
    next_request_id: u64,
    progress: RemoteCallProgress,
    progress_cb: Option<ProgressCallback>,
}

impl Client {
    pub fn new(runtime: &Runtime, endpoint: Endpoint) -> Self {
        let cfg = runtime.config();
        let transport = make_transport(runtime, &endpoint);
        Client {
            runtime: runtime.clone(),
            endpoint,
            transport,
            protocol: cfg.archive_protocol,
            runtime_version: cfg.runtime_version,
            archive_version: cfg.archive_version,
            connect_timeout: cfg.connect_timeout,
            call_timeout: cfg.call_timeout,
            ping_back_interval_ms: 0,
            transport_filter_ids: Vec::new(),
            filters_negotiated: false,
            next_request_id: 1,
            progress: RemoteCallProgress::default(),
            progress_cb: None,
        }
    }

    /// Parses the endpoint from its string form.
    pub fn from_endpoint_str(runtime: &Runtime, endpoint: &str) -> Result<Self> {
        Ok(Client::new(runtime, endpoint.parse()?))
    }

    /// Wraps an already-connected transport, e.g. a connection a server
    /// adopted from one of its sessions.
    pub(crate) fn from_transport(
        runtime: &Runtime,
        endpoint: Endpoint,
        transport: Box<dyn Transport>,
    ) -> Self {
        let mut client = Client::new(runtime, endpoint);
        client.transport = transport;
        client.filters_negotiated = true;
        client
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    pub fn set_call_timeout(&mut self, timeout: Duration) {
        self.call_timeout = timeout;
    }

    pub fn set_archive_protocol(&mut self, protocol: ArchiveProtocol) {
        self.protocol = protocol;
    }

    /// Overrides the advertised runtime/archive versions, e.g. to talk to
    /// an older server without the automatic retry.
    pub fn set_versions(&mut self, runtime_version: u32, archive_version: u32) {
        self.runtime_version = runtime_version;
        self.archive_version = archive_version;
    }

    pub fn versions(&self) -> (u32, u32) {
        (self.runtime_version, self.archive_version)
    }

    /// Asks the server to keep long calls alive with ping-back frames at
    /// this interval. Zero disables ping-backs.
    pub fn set_ping_back_interval(&mut self, interval: Duration) {
        self.ping_back_interval_ms = interval.as_millis() as u32;
    }

    /// Transport filters to negotiate on the next connect, application end
    /// first.
    pub fn set_transport_filters(&mut self, filter_ids: Vec<FilterId>) {
        self.transport_filter_ids = filter_ids;
        self.filters_negotiated = false;
    }

    pub fn set_progress_callback(&mut self, cb: ProgressCallback) {
        self.progress_cb = Some(cb);
    }

    pub fn progress(&self) -> &RemoteCallProgress {
        &self.progress
    }

    /// Handle that aborts the in-flight transport operation.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.transport.cancel_handle()
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn emit_progress(&mut self, phase: RemoteCallPhase, transferred: u64, total: u64) -> Result<()> {
        self.progress = RemoteCallProgress {
            phase,
            bytes_transferred: transferred,
            bytes_total: total,
        };
        if let Some(cb) = &self.progress_cb {
            if cb(&self.progress) == RemoteCallAction::Cancel {
                self.transport.cancel_handle().cancel();
                return Err(Error::cancelled());
            }
        }
        Ok(())
    }

    /// Establishes the connection and negotiates transport filters.
    pub async fn connect(&mut self) -> Result<()> {
        if !self.transport.is_connected() {
            self.emit_progress(RemoteCallPhase::Connect, 0, 0)?;
            self.transport.connect(self.connect_timeout).await?;
            self.filters_negotiated = false;
        }
        self.negotiate_filters().await
    }

    async fn negotiate_filters(&mut self) -> Result<()> {
        if self.transport_filter_ids.is_empty() || self.filters_negotiated {
            self.filters_negotiated = true;
            return Ok(());
        }
        if self.transport.connection_mut().is_none() {
            return Err(Error::filter(
                "transport filters are not supported on datagram transports",
            ));
        }
        let ids = self.transport_filter_ids.clone();
        debug!(?ids, "negotiating transport filters");

        let header = MessageHeader::builtin(
            method_ids::REQUEST_TRANSPORT_FILTERS,
            self.next_request_id(),
            self.protocol,
        );
        let request = protocol::encode_request(
            &header,
            1,
            &(FilterRequest { filter_ids: ids.clone() },),
        )?;
        self.transport.send(request, self.call_timeout).await?;
        let frame = self.transport.receive(self.call_timeout).await?;
        let ack: FilterAck = protocol::decode_reply(&Message::decode(frame)?)?;
        if ack.filter_ids != ids {
            return Err(Error::filter(format!(
                "server realized filters {:?} instead of {:?}",
                ack.filter_ids, ids
            )));
        }
        let stack = self
            .runtime
            .filters()
            .create_stack(&ids)
            .ok_or_else(|| Error::filter("requested filter id is not registered locally"))?;
        let conn = self
            .transport
            .connection_mut()
            .ok_or_else(|| Error::transport("connection lost during filter negotiation"))?;
        conn.install_filters(stack);
        self.filters_negotiated = true;
        Ok(())
    }

    /// Invokes a two-way method and decodes its result.
    ///
    /// `args` is the argument tuple; `arg_count` is its declared arity,
    /// checked by the server against the binding.
    pub async fn call<Args, R>(
        &mut self,
        interface: &str,
        method_id: u32,
        arg_count: u8,
        args: &Args,
    ) -> Result<R>
    where
        Args: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut tried_version_retry = false;
        let mut tried_reconnect = false;
        loop {
            let attempt: Result<R> = match self
                .try_call(interface, method_id, arg_count, args, CallMode::Twoway)
                .await
            {
                Ok(Some(msg)) => protocol::decode_reply(&msg),
                Ok(None) => Err(Error::protocol(
                    ProtocolFault::BadHeader,
                    "two-way call completed without a reply",
                )),
                Err(e) => Err(e),
            };
            match attempt {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if let ErrorKind::Versioning { runtime, archive } = e.kind() {
                        if !tried_version_retry {
                            tried_version_retry = true;
                            debug!(runtime, archive, "retrying with server-advised versions");
                            self.runtime_version = runtime;
                            self.archive_version = archive;
                            continue;
                        }
                    }
                    if e.should_retry() && !tried_reconnect {
                        tried_reconnect = true;
                        warn!("connection closed before reply; retrying on a fresh connection");
                        self.transport.disconnect().await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Invokes a one-way method: completes when the message is sent.
    pub async fn call_oneway<Args>(
        &mut self,
        interface: &str,
        method_id: u32,
        arg_count: u8,
        args: &Args,
    ) -> Result<()>
    where
        Args: Serialize + Sync,
    {
        self.try_call(interface, method_id, arg_count, args, CallMode::Oneway)
            .await?;
        Ok(())
    }

    /// Built-in reachability probe.
    pub async fn ping(&mut self) -> Result<()> {
        self.call(method_ids::BUILTIN_INTERFACE, method_ids::PING, 0, &())
            .await
    }

    /// Turns this connection into a callback channel: the server adopts
    /// it as a client transport, and `dispatcher` serves the calls the
    /// server makes back over it. The stub is left disconnected.
    pub async fn create_callback_connection(
        &mut self,
        dispatcher: &crate::server::Server,
    ) -> Result<()> {
        self.call::<_, ()>(
            method_ids::BUILTIN_INTERFACE,
            method_ids::CREATE_CALLBACK_CONNECTION,
            0,
            &(),
        )
        .await?;
        let conn = self
            .take_connection()
            .ok_or_else(|| Error::transport("callback channel has no stream connection"))?;
        dispatcher.serve_adopted(conn, self.endpoint.clone());
        Ok(())
    }

    async fn try_call<Args>(
        &mut self,
        interface: &str,
        method_id: u32,
        arg_count: u8,
        args: &Args,
        mode: CallMode,
    ) -> Result<Option<Message>>
    where
        Args: Serialize + Sync,
    {
        self.connect().await?;

        let request_id = self.next_request_id();
        let header = MessageHeader {
            runtime_version: self.runtime_version,
            archive_version: self.archive_version,
            protocol: self.protocol,
            call_mode: mode,
            request_id,
            interface: interface.to_string(),
            method_id,
            ping_back_interval_ms: match mode {
                CallMode::Twoway => self.ping_back_interval_ms,
                CallMode::Oneway => 0,
            },
        };
        let message = protocol::encode_request(&header, arg_count, args)?;
        let total = message.len() as u64;

        let mut deadline = Instant::now() + self.call_timeout;

        self.emit_progress(RemoteCallPhase::Send, 0, total)?;
        if let Some(conn) = self.transport.connection_mut() {
            conn.mark_request_boundary();
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.transport.send(message, remaining).await?;
        self.emit_progress(RemoteCallPhase::Send, total, total)?;

        if mode == CallMode::Oneway {
            return Ok(None);
        }

        self.emit_progress(RemoteCallPhase::Receive, 0, 0)?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout("remote call timed out awaiting reply"));
            }
            let frame = self.transport.receive(remaining).await?;
            if frame.is_empty() {
                // Chunk separator; not part of a call reply.
                continue;
            }
            let msg = Message::decode(frame)?;
            let received = msg.payload.len() as u64;
            if msg.is_ping_back() {
                debug!(request_id, "ping-back received; extending call deadline");
                deadline = Instant::now() + self.call_timeout;
                self.emit_progress(RemoteCallPhase::Receive, 0, 0)?;
                continue;
            }
            if msg.header.request_id != request_id {
                return Err(Error::protocol(
                    ProtocolFault::BadHeader,
                    format!(
                        "reply for request {} while awaiting {}",
                        msg.header.request_id, request_id
                    ),
                ));
            }
            self.emit_progress(RemoteCallPhase::Receive, received, received)?;
            return Ok(Some(msg));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
        self.filters_negotiated = false;
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Detaches the connected stream, e.g. to hand it to a server that
    /// will serve calls arriving on it. The client is left disconnected.
    pub fn take_connection(&mut self) -> Option<crate::transport::Connection> {
        self.filters_negotiated = false;
        self.transport.take_connection()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.endpoint.to_string())
            .field("connected", &self.transport.is_connected())
            .field("versions", &(self.runtime_version, self.archive_version))
            .finish()
    }
}
