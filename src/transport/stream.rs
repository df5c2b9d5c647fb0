//! Stream-based client transport.
//!
//! One implementation covers every ordered-stream endpoint: TCP, local
//! socket, named pipe, HTTP, HTTPS and proxied connections. The endpoint
//! decides how the socket is dialled and which envelope filters are pushed
//! at the wire end; everything after that is the shared framed
//! [`Connection`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::buffer::ByteBuffer;
use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::filter::filter_ids;
use crate::http::{connect::establish_tunnel, HttpFrameFilter};
use crate::protocol::{self, method_ids, Message, MessageHeader};
use crate::transport::{
    conn::Connection, pipe, with_deadline, CancelHandle, Endpoint, Transport, TransportKind,
};

/// Applies socket options the way the runtime is configured: no Nagle
/// delay, and explicit kernel buffer sizes when requested.
pub(crate) fn configure_tcp(stream: TcpStream, runtime: &Runtime) -> Result<TcpStream> {
    let std_stream = stream.into_std()?;
    let socket = socket2::Socket::from(std_stream.try_clone()?);
    socket.set_nodelay(true)?;
    let buf = runtime.config().socket_buffer_size;
    if buf > 0 {
        socket.set_recv_buffer_size(buf)?;
        socket.set_send_buffer_size(buf)?;
    }
    Ok(TcpStream::from_std(std_stream)?)
}

async fn dial_tcp(runtime: &Runtime, host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    configure_tcp(stream, runtime)
}

/// Dials the TCP leg of an HTTP(S) endpoint, going through the configured
/// outbound proxy with a CONNECT tunnel when one is set.
async fn dial_http_leg(runtime: &Runtime, host: &str, port: u16) -> Result<TcpStream> {
    match &runtime.config().http_proxy {
        Some((proxy_host, proxy_port, credentials)) => {
            debug!(%proxy_host, proxy_port, "connecting via http proxy");
            let mut stream = dial_tcp(runtime, proxy_host, *proxy_port).await?;
            establish_tunnel(&mut stream, host, port, credentials.as_ref()).await?;
            Ok(stream)
        }
        None => dial_tcp(runtime, host, port).await,
    }
}

/// Connects a non-proxy stream endpoint and returns its framed connection
/// with envelope filters installed.
pub(crate) async fn connect_stream(runtime: &Runtime, endpoint: &Endpoint) -> Result<Connection> {
    let max_incoming = runtime.config().max_incoming_message_length;
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = dial_tcp(runtime, host, *port).await?;
            Ok(Connection::new(Box::new(stream), max_incoming))
        }
        #[cfg(unix)]
        Endpoint::Local { path } => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Connection::new(Box::new(stream), max_incoming))
        }
        #[cfg(not(unix))]
        Endpoint::Local { path } => Err(Error::transport(format!(
            "local socket endpoint {path} is not available on this platform"
        ))),
        Endpoint::NamedPipe { name } => {
            let stream = pipe::connect_client(name).await?;
            Ok(Connection::new(stream, max_incoming))
        }
        Endpoint::Http { host, port, path } => {
            let stream = dial_http_leg(runtime, host, *port).await?;
            let mut conn = Connection::new(Box::new(stream), max_incoming);
            conn.push_outermost_filter(Box::new(HttpFrameFilter::new_client(
                host.clone(),
                *port,
                path.clone(),
                runtime.http_verifier(),
            )));
            Ok(conn)
        }
        Endpoint::Https { host, port, path } => {
            // Fail before dialling when no record layer can be built.
            if !runtime.filters().contains(filter_ids::TLS) {
                return Err(Error::filter(
                    "https endpoint requires a registered TLS filter factory",
                ));
            }
            let stream = dial_http_leg(runtime, host, *port).await?;
            let mut conn = Connection::new(Box::new(stream), max_incoming);
            conn.push_outermost_filter(Box::new(HttpFrameFilter::new_client(
                host.clone(),
                *port,
                path.clone(),
                runtime.http_verifier(),
            )));
            let tls = runtime.filters().create(filter_ids::TLS).ok_or_else(|| {
                Error::filter("https endpoint requires a registered TLS filter factory")
            })?;
            conn.push_outermost_filter(tls);
            Ok(conn)
        }
        Endpoint::Udp { .. } | Endpoint::Multicast { .. } => {
            Err(Error::transport("datagram endpoint used as a stream"))
        }
        Endpoint::Proxy { .. } => Err(Error::transport(
            "proxy endpoints must be connected through connect_via_broker",
        )),
    }
}

/// Dials the broker and asks it for a spliced connection to the named
/// proxy endpoint. On success the returned connection reaches the
/// registered back-end.
async fn connect_via_broker(runtime: &Runtime, broker: &Endpoint, name: &str) -> Result<Connection> {
    if matches!(broker, Endpoint::Proxy { .. }) {
        return Err(Error::transport("proxy broker cannot itself be a proxy endpoint"));
    }
    let mut conn = connect_stream(runtime, broker).await?;

    let header = MessageHeader::builtin(
        method_ids::REQUEST_PROXY_CONNECTION,
        1,
        runtime.config().archive_protocol,
    );
    let request = protocol::encode_request(&header, 1, &(name.to_string(),))?;
    conn.send_message(request).await?;
    let frame = conn.recv_frame().await?;
    let msg = Message::decode(frame)?;
    protocol::decode_reply::<()>(&msg)?;
    debug!(name, "proxied connection established via broker");
    Ok(conn)
}

/// Client transport over any ordered-stream endpoint.
pub struct StreamTransport {
    runtime: Runtime,
    endpoint: Endpoint,
    conn: Option<Connection>,
    cancel: CancelHandle,
}

impl StreamTransport {
    pub fn new(runtime: Runtime, endpoint: Endpoint) -> Self {
        StreamTransport {
            runtime,
            endpoint,
            conn: None,
            cancel: CancelHandle::new(),
        }
    }

    /// Wraps an already-connected stream, e.g. a connection adopted from a
    /// server session.
    pub fn from_connection(runtime: Runtime, endpoint: Endpoint, conn: Connection) -> Self {
        StreamTransport {
            runtime,
            endpoint,
            conn: Some(conn),
            cancel: CancelHandle::new(),
        }
    }

    fn conn_mut(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::transport("transport is not connected"))
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        self.endpoint.kind()
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let runtime = self.runtime.clone();
        let endpoint = self.endpoint.clone();
        let connect_fut = async {
            match &endpoint {
                Endpoint::Proxy { broker, name } => {
                    connect_via_broker(&runtime, broker, name).await
                }
                other => connect_stream(&runtime, other).await,
            }
        };
        let conn = with_deadline(connect_fut, timeout, &self.cancel, "connect").await?;
        debug!(endpoint = %self.endpoint, "transport connected");
        self.conn = Some(conn);
        Ok(())
    }

    async fn send(&mut self, message: ByteBuffer, timeout: Duration) -> Result<usize> {
        let cancel = self.cancel.clone();
        let conn = self.conn_mut()?;
        let result = with_deadline(conn.send_message(message), timeout, &cancel, "send").await;
        if result.as_ref().is_err_and(|e| e.is_fatal_to_connection()) {
            self.conn = None;
        }
        result
    }

    async fn receive(&mut self, timeout: Duration) -> Result<ByteBuffer> {
        let cancel = self.cancel.clone();
        let conn = self.conn_mut()?;
        let result = with_deadline(conn.recv_frame(), timeout, &cancel, "receive").await;
        if result.as_ref().is_err_and(|e| e.is_fatal_to_connection()) {
            self.conn = None;
        }
        result
    }

    async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.shutdown().await;
        }
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.conn.as_mut()
    }

    fn take_connection(&mut self) -> Option<Connection> {
        self.conn.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_transport_connects_and_exchanges_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(Box::new(stream), 1024 * 1024);
            let frame = conn.recv_frame().await.unwrap();
            assert_eq!(frame.as_slice(), b"hello");
            conn.send_message(ByteBuffer::copy_with_margin(
                b"world",
                protocol::FRAME_PREFIX_LEN,
            ))
            .await
            .unwrap();
        });

        let runtime = Runtime::default();
        let mut transport =
            StreamTransport::new(runtime, Endpoint::tcp("127.0.0.1", addr.port()));
        transport.connect(Duration::from_secs(2)).await.unwrap();
        transport
            .send(
                ByteBuffer::copy_with_margin(b"hello", protocol::FRAME_PREFIX_LEN),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        let reply = transport.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply.as_slice(), b"world");
        transport.disconnect().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails_within_deadline() {
        let runtime = Runtime::default();
        // Bind-then-drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport = StreamTransport::new(runtime, Endpoint::tcp("127.0.0.1", addr.port()));
        let err = transport.connect(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::ErrorKind::Transport | crate::error::ErrorKind::Timeout
        ));
    }
}
