//! Datagram transports.
//!
//! UDP uses single-datagram framing: one datagram is one message, there is
//! no length prefix, no chunking, and no transport filter negotiation.
//! Multicast fan-out wraps a set of child transports and aggregates their
//! completions, so a publisher can address many receivers with one send.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, warn};

use crate::buffer::ByteBuffer;
use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::transport::{with_deadline, CancelHandle, Transport, TransportKind};

/// Largest UDP payload we will attempt to send.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Client transport for unicast or multicast UDP.
pub struct UdpTransport {
    runtime: Runtime,
    host: String,
    port: u16,
    multicast: bool,
    socket: Option<Arc<UdpSocket>>,
    cancel: CancelHandle,
}

impl UdpTransport {
    pub fn new(runtime: Runtime, host: impl Into<String>, port: u16) -> Self {
        UdpTransport {
            runtime,
            host: host.into(),
            port,
            multicast: false,
            socket: None,
            cancel: CancelHandle::new(),
        }
    }

    pub fn new_multicast(runtime: Runtime, group: impl Into<String>, port: u16) -> Self {
        UdpTransport {
            multicast: true,
            ..Self::new(runtime, group, port)
        }
    }

    fn socket(&self) -> Result<&Arc<UdpSocket>> {
        self.socket
            .as_ref()
            .ok_or_else(|| Error::transport("udp transport is not connected"))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        if self.multicast {
            TransportKind::Multicast
        } else {
            TransportKind::Udp
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let host = self.host.clone();
        let port = self.port;
        let multicast = self.multicast;
        let connect_fut = async move {
            let peer: SocketAddr = lookup_host((host.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| Error::transport(format!("could not resolve {host}:{port}")))?;
            let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind_addr).await?;
            if multicast {
                socket.set_multicast_ttl_v4(1)?;
            }
            socket.connect(peer).await?;
            debug!(%peer, multicast, "udp transport bound");
            Ok(Arc::new(socket))
        };
        let socket = with_deadline(connect_fut, timeout, &self.cancel, "udp connect").await?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, message: ByteBuffer, timeout: Duration) -> Result<usize> {
        if message.len() > MAX_DATAGRAM_LEN {
            return Err(Error::framing(format!(
                "message of {} bytes exceeds the udp datagram limit",
                message.len()
            )));
        }
        let socket = self.socket()?.clone();
        let cancel = self.cancel.clone();
        with_deadline(
            async move {
                let n = socket.send(message.as_slice()).await?;
                Ok(n)
            },
            timeout,
            &cancel,
            "udp send",
        )
        .await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<ByteBuffer> {
        let max = self
            .runtime
            .config()
            .max_incoming_message_length
            .min(MAX_DATAGRAM_LEN);
        let socket = self.socket()?.clone();
        let cancel = self.cancel.clone();
        with_deadline(
            async move {
                let mut buf = vec![0u8; max];
                let n = socket.recv(&mut buf).await?;
                buf.truncate(n);
                Ok(ByteBuffer::from_vec(buf).into_read_only())
            },
            timeout,
            &cancel,
            "udp receive",
        )
        .await
    }

    async fn disconnect(&mut self) {
        self.socket = None;
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

/// Fan-out transport: one send is issued to every child, and the
/// completions are aggregated. Receiving through the fan-out is not
/// defined; responses, if any, are read on individual children.
pub struct MulticastTransport {
    children: Vec<Box<dyn Transport>>,
    cancel: CancelHandle,
}

impl MulticastTransport {
    pub fn new(children: Vec<Box<dyn Transport>>) -> Self {
        MulticastTransport {
            children,
            cancel: CancelHandle::new(),
        }
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

#[async_trait]
impl Transport for MulticastTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Multicast
    }

    fn is_connected(&self) -> bool {
        self.children.iter().all(|c| c.is_connected())
    }

    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        for child in &mut self.children {
            child.connect(timeout).await?;
        }
        Ok(())
    }

    async fn send(&mut self, message: ByteBuffer, timeout: Duration) -> Result<usize> {
        let mut sent = 0;
        let mut failures = 0;
        for child in &mut self.children {
            match child.send(message.clone(), timeout).await {
                Ok(n) => sent += n,
                Err(e) => {
                    warn!(error = %e, "fan-out send failed on one child");
                    failures += 1;
                }
            }
        }
        if failures == self.children.len() && failures > 0 {
            return Err(Error::transport("fan-out send failed on every child"));
        }
        Ok(sent)
    }

    async fn receive(&mut self, _timeout: Duration) -> Result<ByteBuffer> {
        Err(Error::transport("receive is not defined on a fan-out transport"))
    }

    async fn disconnect(&mut self) {
        for child in &mut self.children {
            child.disconnect().await;
        }
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}
