//! Per-connection server session.
//!
//! A session owns one framed connection and runs as a single task, so its
//! state needs no locking: at most one thing happens on a session at a
//! time. The loop reads one message, dispatches built-in control requests
//! internally, routes user requests through the binding table, and writes
//! the reply back through the same filter chain.
//!
//! Some built-ins end with the session *adopting away* its connection: a
//! subscription turns it into a publisher fan-out channel, a callback
//! connection turns it into a client transport, and the proxy built-ins
//! pair and splice it with a second connection. In those cases the loop
//! exits without closing the stream.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::error::{Error, ProtocolFault, Result};
use crate::filter::negotiation::{FilterAck, FilterRequest};
use crate::http::HttpFrameFilter;
use crate::protocol::{self, method_ids, CallMode, Message, MessageHeader};
use crate::server::context::SessionData;
use crate::server::{MethodEntry, ServerCore, SessionHandle};
use crate::service::filetransfer::{
    BeginDownloadRequest, BeginUploadRequest, DownloadChunksRequest, FileChunkPos,
    SessionTransfers, UploadChunksRequest,
};
use crate::service::now_ms;
use crate::service::proxy::PollOutcome;
use crate::service::publish::{SubscriptionAck, SubscriptionRequest};
use crate::filter::filter_ids;
use crate::transport::{conn::BoxedStream, CancelHandle, Connection, Endpoint, StreamTransport};

/// Which envelope filters a freshly accepted stream needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnvelope {
    /// Plain length-prefixed framing.
    Raw,
    /// HTTP request/response envelope.
    Http,
    /// HTTP envelope under a TLS record layer.
    Https,
}

enum Flow {
    Continue,
    Adopt(Adoption),
}

enum Adoption {
    Subscriber { topic: String, ping_ms: u32 },
    Callback(crate::server::CallbackConnectionHandler),
    ProxyBackend { name: String, request_id: String },
    Splice { other: Connection },
}

const PINGBACK_QUEUE: usize = 16;

pub(crate) struct Session {
    id: u64,
    core: Arc<ServerCore>,
    conn: Connection,
    peer: Endpoint,
    handle: SessionHandle,
    transfers: SessionTransfers,
    user_data: SessionData,
    registered_proxy_endpoints: Vec<String>,
    pingback_tx: mpsc::Sender<u64>,
    pingback_rx: mpsc::Receiver<u64>,
}

/// Spawns a session over a raw accepted stream.
pub(crate) fn spawn(
    core: Arc<ServerCore>,
    stream: BoxedStream,
    envelope: SessionEnvelope,
    peer: Endpoint,
) -> CancelHandle {
    let mut conn = Connection::new(stream, core.runtime.config().max_incoming_message_length);
    match envelope {
        SessionEnvelope::Raw => {}
        SessionEnvelope::Http => {
            conn.push_outermost_filter(Box::new(HttpFrameFilter::new_server(
                core.runtime.http_verifier(),
            )));
        }
        SessionEnvelope::Https => {
            conn.push_outermost_filter(Box::new(HttpFrameFilter::new_server(
                core.runtime.http_verifier(),
            )));
            match core.runtime.filters().create(filter_ids::TLS) {
                Some(tls) => conn.push_outermost_filter(tls),
                None => {
                    warn!("no TLS filter factory; dropping https connection");
                    return CancelHandle::new();
                }
            }
        }
    }
    spawn_adopted(core, conn, peer)
}

/// Spawns a session over an existing framed connection.
pub(crate) fn spawn_adopted(
    core: Arc<ServerCore>,
    conn: Connection,
    peer: Endpoint,
) -> CancelHandle {
    let id = core.session_seq.fetch_add(1, Ordering::Relaxed);
    let handle = SessionHandle {
        id,
        cancel: CancelHandle::new(),
        last_activity_ms: Arc::new(std::sync::atomic::AtomicU64::new(now_ms())),
    };
    core.sessions.insert(handle.clone());
    core.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);

    let (pingback_tx, pingback_rx) = mpsc::channel(PINGBACK_QUEUE);
    let session = Session {
        id,
        core,
        conn,
        peer,
        handle: handle.clone(),
        transfers: SessionTransfers::default(),
        user_data: SessionData::default(),
        registered_proxy_endpoints: Vec::new(),
        pingback_tx,
        pingback_rx,
    };
    tokio::spawn(session.run());
    handle.cancel
}

impl Session {
    async fn run(mut self) {
        debug!(session_id = self.id, peer = %self.peer, "session opened");
        let outcome = self.serve_loop().await;

        // Common cleanup happens before any adoption so the registry never
        // holds a session whose connection changed hands.
        self.core.pingback.unregister(self.id);
        self.core.proxy.session_closed(self.id);
        self.core.file_transfer.session_closed(&mut self.transfers);
        self.core.sessions.remove(self.id);
        self.core
            .stats
            .bytes_in
            .fetch_add(self.conn.bytes_in(), Ordering::Relaxed);
        self.core
            .stats
            .bytes_out
            .fetch_add(self.conn.bytes_out(), Ordering::Relaxed);

        let Session {
            id, core, mut conn, peer, ..
        } = self;

        match outcome {
            Ok(None) => {
                conn.shutdown().await;
                debug!(session_id = id, "session closed");
            }
            Ok(Some(adoption)) => match adoption {
                Adoption::Subscriber { topic, ping_ms } => {
                    if let Err(e) = core.publishing.add_subscriber(&topic, conn, ping_ms).await {
                        warn!(session_id = id, error = %e, "subscriber adoption failed");
                    }
                }
                Adoption::Callback(handler) => {
                    info!(session_id = id, "connection adopted as callback channel");
                    let transport =
                        StreamTransport::from_connection(core.runtime.clone(), peer.clone(), conn);
                    let client =
                        Client::from_transport(&core.runtime, peer, Box::new(transport));
                    handler(client);
                }
                Adoption::ProxyBackend { name, request_id } => {
                    core.proxy.connection_available(&name, &request_id, conn);
                }
                Adoption::Splice { other } => {
                    let mut near = conn.into_stream();
                    let mut far = other.into_stream();
                    tokio::spawn(async move {
                        match tokio::io::copy_bidirectional(&mut near, &mut far).await {
                            Ok((a_to_b, b_to_a)) => {
                                debug!(a_to_b, b_to_a, "spliced connection finished")
                            }
                            Err(e) => debug!(error = %e, "spliced connection ended"),
                        }
                    });
                }
            },
            Err(e) => {
                debug!(session_id = id, error = %e, "session closed on error");
                conn.shutdown().await;
            }
        }
    }

    fn touch(&self) {
        self.handle
            .last_activity_ms
            .store(now_ms(), Ordering::Relaxed);
    }

    async fn serve_loop(&mut self) -> Result<Option<Adoption>> {
        loop {
            let frame = tokio::select! {
                _ = self.handle.cancel.cancelled() => return Ok(None),
                frame = self.conn.recv_frame() => frame?,
            };
            self.touch();
            if frame.is_empty() {
                continue;
            }
            let msg = Message::decode(frame)?;
            match self.process(msg).await? {
                Flow::Continue => {}
                Flow::Adopt(adoption) => return Ok(Some(adoption)),
            }
        }
    }

    async fn reply_ok<R: serde::Serialize>(
        &mut self,
        header: &MessageHeader,
        value: &R,
    ) -> Result<()> {
        let buf = protocol::encode_reply(header, value)?;
        self.conn.send_message(buf).await?;
        self.touch();
        Ok(())
    }

    async fn reply_err(&mut self, header: &MessageHeader, err: &Error) -> Result<()> {
        debug!(session_id = self.id, error = %err, "sending error reply");
        let buf = protocol::encode_error_reply(header, err)?;
        self.conn.send_message(buf).await?;
        self.touch();
        Ok(())
    }

    async fn process(&mut self, msg: Message) -> Result<Flow> {
        let cfg_runtime_version = self.core.runtime.config().runtime_version;
        let cfg_archive_version = self.core.runtime.config().archive_version;
        if !msg.header.is_builtin() && msg.header.runtime_version > cfg_runtime_version {
            if msg.header.call_mode == CallMode::Twoway {
                let advise = Error::versioning(cfg_runtime_version, cfg_archive_version);
                self.reply_err(&msg.header.clone(), &advise).await?;
            }
            return Ok(Flow::Continue);
        }

        if msg.header.is_builtin() {
            self.process_builtin(msg).await
        } else {
            self.dispatch_user(msg).await
        }
    }

    /// Decodes the single-value argument tuple of a built-in request,
    /// replying with a protocol error on failure.
    async fn builtin_args<T: serde::de::DeserializeOwned>(
        &mut self,
        msg: &Message,
    ) -> Result<Option<T>> {
        let decoded = protocol::split_request_payload(&msg.payload)
            .and_then(|(_, bytes)| msg.header.protocol.decode::<T>(bytes.as_slice()));
        match decoded {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                if msg.header.call_mode == CallMode::Twoway {
                    self.reply_err(&msg.header.clone(), &e).await?;
                }
                Ok(None)
            }
        }
    }

    async fn process_builtin(&mut self, msg: Message) -> Result<Flow> {
        let header = msg.header.clone();
        match header.method_id {
            method_ids::PING => {
                if header.call_mode == CallMode::Twoway {
                    self.reply_ok(&header, &()).await?;
                }
                Ok(Flow::Continue)
            }

            method_ids::REQUEST_TRANSPORT_FILTERS => {
                let Some((request,)) = self.builtin_args::<(FilterRequest,)>(&msg).await? else {
                    return Ok(Flow::Continue);
                };
                match self.core.runtime.filters().create_stack(&request.filter_ids) {
                    Some(stack) => {
                        let ack = FilterAck {
                            filter_ids: request.filter_ids.clone(),
                        };
                        self.reply_ok(&header, &ack).await?;
                        // Install only after the acknowledgement left on
                        // the bare chain.
                        self.conn.install_filters(stack);
                        debug!(session_id = self.id, ids = ?request.filter_ids, "transport filters installed");
                        Ok(Flow::Continue)
                    }
                    None => {
                        let err = Error::filter(format!(
                            "unsupported transport filter in {:?}",
                            request.filter_ids
                        ));
                        self.reply_err(&header, &err).await?;
                        Ok(Flow::Continue)
                    }
                }
            }

            method_ids::QUERY_FOR_TRANSPORT_FILTERS => {
                let err = Error::protocol(
                    ProtocolFault::LegacyCall,
                    "QueryForTransportFilters is no longer supported",
                );
                self.reply_err(&header, &err).await?;
                Ok(Flow::Continue)
            }

            method_ids::REQUEST_SUBSCRIPTION => {
                let Some((request,)) = self.builtin_args::<(SubscriptionRequest,)>(&msg).await?
                else {
                    return Ok(Flow::Continue);
                };
                if !self.core.publishing.has_publisher(&request.topic) {
                    let err = Error::resource(format!("no publisher for topic {}", request.topic));
                    self.reply_err(&header, &err).await?;
                    return Ok(Flow::Continue);
                }
                let ack = SubscriptionAck {
                    ping_interval_ms: self.core.publishing.ping_interval_ms(),
                };
                self.reply_ok(&header, &ack).await?;
                Ok(Flow::Adopt(Adoption::Subscriber {
                    topic: request.topic,
                    ping_ms: request.ping_interval_ms,
                }))
            }

            method_ids::CREATE_CALLBACK_CONNECTION => {
                let handler = self.core.callback_handler.read().clone();
                match handler {
                    Some(handler) => {
                        self.reply_ok(&header, &()).await?;
                        Ok(Flow::Adopt(Adoption::Callback(handler)))
                    }
                    None => {
                        let err =
                            Error::resource("server accepts no callback connections");
                        self.reply_err(&header, &err).await?;
                        Ok(Flow::Continue)
                    }
                }
            }

            method_ids::SETUP_PROXY_ENDPOINT => {
                let Some((name, password)) =
                    self.builtin_args::<(String, String)>(&msg).await?
                else {
                    return Ok(Flow::Continue);
                };
                match self.core.proxy.setup_endpoint(self.id, &name, &password) {
                    Ok(()) => {
                        self.registered_proxy_endpoints.push(name);
                        self.reply_ok(&header, &()).await?;
                    }
                    Err(e) => self.reply_err(&header, &e).await?,
                }
                Ok(Flow::Continue)
            }

            method_ids::GET_CONNECTION_REQUESTS => {
                let Some(name) = self.registered_proxy_endpoints.first().cloned() else {
                    let err = Error::resource("no proxy endpoint registered on this session");
                    self.reply_err(&header, &err).await?;
                    return Ok(Flow::Continue);
                };
                match self.core.proxy.poll_requests(&name) {
                    Ok(PollOutcome::Ready(ids)) => self.reply_ok(&header, &ids).await?,
                    Ok(PollOutcome::Parked(rx)) => {
                        let ids = rx.await.unwrap_or_default();
                        self.reply_ok(&header, &ids).await?;
                    }
                    Err(e) => self.reply_err(&header, &e).await?,
                }
                Ok(Flow::Continue)
            }

            method_ids::MAKE_CONNECTION_AVAILABLE => {
                let Some((name, request_id)) =
                    self.builtin_args::<(String, String)>(&msg).await?
                else {
                    return Ok(Flow::Continue);
                };
                self.reply_ok(&header, &()).await?;
                Ok(Flow::Adopt(Adoption::ProxyBackend { name, request_id }))
            }

            method_ids::REQUEST_PROXY_CONNECTION => {
                let Some((name,)) = self.builtin_args::<(String,)>(&msg).await? else {
                    return Ok(Flow::Continue);
                };
                let (request_id, wait) = match self.core.proxy.begin_client_request(&name) {
                    Ok(pair) => pair,
                    Err(e) => {
                        self.reply_err(&header, &e).await?;
                        return Ok(Flow::Continue);
                    }
                };
                let window = self.core.runtime.config().proxy_endpoint_idle_timeout;
                match tokio::time::timeout(window, wait).await {
                    Ok(Ok(backend_conn)) => {
                        self.reply_ok(&header, &()).await?;
                        Ok(Flow::Adopt(Adoption::Splice { other: backend_conn }))
                    }
                    _ => {
                        self.core.proxy.abandon_client_request(&name, &request_id);
                        let err = Error::resource(format!(
                            "proxy endpoint {name} is unavailable"
                        ));
                        self.reply_err(&header, &err).await?;
                        Ok(Flow::Continue)
                    }
                }
            }

            method_ids::BEGIN_UPLOAD => {
                let Some((request,)) = self.builtin_args::<(BeginUploadRequest,)>(&msg).await?
                else {
                    return Ok(Flow::Continue);
                };
                let service = self.core.file_transfer.clone();
                match service.begin_upload(&mut self.transfers, request).await {
                    Ok(reply) => self.reply_ok(&header, &reply).await?,
                    Err(e) => self.reply_err(&header, &e).await?,
                }
                Ok(Flow::Continue)
            }

            method_ids::UPLOAD_CHUNKS => {
                let Some((request,)) = self.builtin_args::<(UploadChunksRequest,)>(&msg).await?
                else {
                    return Ok(Flow::Continue);
                };
                let service = self.core.file_transfer.clone();
                match service.upload_chunks(&mut self.transfers, request).await {
                    Ok(reply) => self.reply_ok(&header, &reply).await?,
                    Err(e) => self.reply_err(&header, &e).await?,
                }
                Ok(Flow::Continue)
            }

            method_ids::BEGIN_DOWNLOAD => {
                let Some((request,)) = self.builtin_args::<(BeginDownloadRequest,)>(&msg).await?
                else {
                    return Ok(Flow::Continue);
                };
                let service = self.core.file_transfer.clone();
                match service.begin_download(&mut self.transfers, request).await {
                    Ok(reply) => self.reply_ok(&header, &reply).await?,
                    Err(e) => self.reply_err(&header, &e).await?,
                }
                Ok(Flow::Continue)
            }

            method_ids::TRIM_DOWNLOAD => {
                let Some((position,)) = self.builtin_args::<(FileChunkPos,)>(&msg).await? else {
                    return Ok(Flow::Continue);
                };
                let service = self.core.file_transfer.clone();
                match service.trim_download(&mut self.transfers, position) {
                    Ok(()) => self.reply_ok(&header, &()).await?,
                    Err(e) => self.reply_err(&header, &e).await?,
                }
                Ok(Flow::Continue)
            }

            method_ids::DOWNLOAD_CHUNKS => {
                let Some((request,)) = self.builtin_args::<(DownloadChunksRequest,)>(&msg).await?
                else {
                    return Ok(Flow::Continue);
                };
                let service = self.core.file_transfer.clone();
                match service.download_chunks(&mut self.transfers, request).await {
                    Ok(reply) => self.reply_ok(&header, &reply).await?,
                    Err(e) => self.reply_err(&header, &e).await?,
                }
                Ok(Flow::Continue)
            }

            other => {
                let err = Error::protocol(
                    ProtocolFault::UnknownMethod,
                    format!("unknown built-in method {other:#x}"),
                );
                if header.call_mode == CallMode::Twoway {
                    self.reply_err(&header, &err).await?;
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn dispatch_user(&mut self, msg: Message) -> Result<Flow> {
        let header = msg.header.clone();
        let twoway = header.call_mode == CallMode::Twoway;

        let entry: std::result::Result<MethodEntry, Error> = {
            let bindings = self.core.bindings.read();
            bindings
                .get(&header.interface)
                .ok_or_else(|| {
                    Error::protocol(
                        ProtocolFault::UnknownInterface,
                        format!("no interface {}", header.interface),
                    )
                })
                .and_then(|methods| {
                    methods.get(&header.method_id).ok_or_else(|| {
                        Error::protocol(
                            ProtocolFault::UnknownMethod,
                            format!(
                                "interface {} has no method {}",
                                header.interface, header.method_id
                            ),
                        )
                    })
                })
                .map(Clone::clone)
        };
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if twoway {
                    self.reply_err(&header, &e).await?;
                }
                return Ok(Flow::Continue);
            }
        };

        let argc = match protocol::split_request_payload(&msg.payload) {
            Ok((argc, _)) => argc,
            Err(e) => {
                if twoway {
                    self.reply_err(&header, &e).await?;
                }
                return Ok(Flow::Continue);
            }
        };
        if argc != entry.arity {
            let e = Error::protocol(
                ProtocolFault::ArityMismatch,
                format!(
                    "method {}.{} takes {} arguments, caller sent {argc}",
                    header.interface, header.method_id, entry.arity
                ),
            );
            if twoway {
                self.reply_err(&header, &e).await?;
            }
            return Ok(Flow::Continue);
        }

        self.core
            .stats
            .requests_dispatched
            .fetch_add(1, Ordering::Relaxed);
        let (ctx, mut reply_rx) = crate::server::RemoteCallContext::new(
            header.clone(),
            msg.payload,
            self.id,
            self.user_data.clone(),
        );
        (entry.handler)(ctx);

        if !twoway {
            // One-way: the handler runs, any reply it commits is dropped.
            return Ok(Flow::Continue);
        }

        let wants_pingback = header.ping_back_interval_ms > 0;
        if wants_pingback {
            self.core.pingback.register(
                self.id,
                header.request_id,
                Duration::from_millis(u64::from(header.ping_back_interval_ms)),
                self.pingback_tx.clone(),
            );
        }

        let reply = loop {
            tokio::select! {
                reply = &mut reply_rx => break reply,
                ping = self.pingback_rx.recv() => {
                    if let Some(request_id) = ping {
                        let frame = protocol::encode_ping_back(header.protocol, request_id);
                        self.conn.send_message(frame).await?;
                        self.touch();
                        debug!(session_id = self.id, request_id, "ping-back sent");
                    }
                }
            }
        };
        if wants_pingback {
            self.core.pingback.unregister(self.id);
            while self.pingback_rx.try_recv().is_ok() {}
        }

        match reply {
            Ok(Ok(result_bytes)) => {
                let frame = protocol::encode_reply_raw(&header, &result_bytes);
                self.conn.send_message(frame).await?;
                self.touch();
            }
            Ok(Err(e)) => self.reply_err(&header, &e).await?,
            Err(_) => {
                let e = Error::application(0, "handler completed without a reply");
                self.reply_err(&header, &e).await?;
            }
        }
        Ok(Flow::Continue)
    }
}

/// Serves one UDP datagram: decode, dispatch, reply to the sender.
/// Datagram sessions are ephemeral; no filters, no ping-back, no
/// adoption.
pub(crate) async fn handle_datagram(
    core: Arc<ServerCore>,
    socket: Arc<UdpSocket>,
    peer: std::net::SocketAddr,
    data: Vec<u8>,
) {
    let frame = crate::buffer::ByteBuffer::from_vec(data).into_read_only();
    let msg = match Message::decode(frame) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(%peer, error = %e, "undecodable datagram");
            return;
        }
    };
    let header = msg.header.clone();
    let twoway = header.call_mode == CallMode::Twoway;

    let reply = dispatch_datagram(&core, msg).await;
    if !twoway {
        return;
    }
    let frame = match reply {
        Ok(result_bytes) => protocol::encode_reply_raw(&header, &result_bytes),
        Err(e) => match protocol::encode_error_reply(&header, &e) {
            Ok(frame) => frame,
            Err(encode_err) => {
                warn!(%peer, error = %encode_err, "could not encode error reply");
                return;
            }
        },
    };
    if let Err(e) = socket.send_to(frame.as_slice(), peer).await {
        debug!(%peer, error = %e, "datagram reply failed");
    }
}

async fn dispatch_datagram(core: &Arc<ServerCore>, msg: Message) -> Result<Vec<u8>> {
    let cfg = core.runtime.config();
    if !msg.header.is_builtin() && msg.header.runtime_version > cfg.runtime_version {
        return Err(Error::versioning(cfg.runtime_version, cfg.archive_version));
    }
    if msg.header.is_builtin() {
        return match msg.header.method_id {
            method_ids::PING => msg.header.protocol.encode(&()),
            other => Err(Error::protocol(
                ProtocolFault::UnknownMethod,
                format!("built-in {other:#x} is not available over udp"),
            )),
        };
    }

    let entry = {
        let bindings = core.bindings.read();
        bindings
            .get(&msg.header.interface)
            .ok_or_else(|| {
                Error::protocol(
                    ProtocolFault::UnknownInterface,
                    format!("no interface {}", msg.header.interface),
                )
            })?
            .get(&msg.header.method_id)
            .ok_or_else(|| {
                Error::protocol(
                    ProtocolFault::UnknownMethod,
                    format!(
                        "interface {} has no method {}",
                        msg.header.interface, msg.header.method_id
                    ),
                )
            })?
            .clone()
    };
    let (argc, _) = protocol::split_request_payload(&msg.payload)?;
    if argc != entry.arity {
        return Err(Error::protocol(
            ProtocolFault::ArityMismatch,
            format!("method takes {} arguments, caller sent {argc}", entry.arity),
        ));
    }
    core.stats
        .requests_dispatched
        .fetch_add(1, Ordering::Relaxed);

    let (ctx, reply_rx) = crate::server::RemoteCallContext::new(
        msg.header.clone(),
        msg.payload,
        0,
        SessionData::default(),
    );
    (entry.handler)(ctx);
    match reply_rx.await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::application(0, "handler completed without a reply")),
    }
}
