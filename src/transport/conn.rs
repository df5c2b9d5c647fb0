//! The framed, filtered connection shared by every stream transport.
//!
//! Outgoing messages get their length prefix written into the buffer's
//! left margin, pass through the filter chain, and are written to the
//! stream. Incoming bytes pass through the chain in the read direction
//! into a decode buffer, from which complete frames are extracted. The
//! same type serves client transports and server sessions, and is what
//! changes hands when a connection is adopted (subscriptions, callback
//! connections, proxied pairing).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::buffer::ByteBuffer;
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterChain};
use crate::protocol;

/// Object-safe stream bound: anything duplex, ordered and owned.
pub trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIo for T {}

/// An owned duplex byte stream.
pub type BoxedStream = Box<dyn StreamIo>;

const READ_SCRATCH_LEN: usize = 8192;

/// One framed connection over an owned stream.
pub struct Connection {
    stream: BoxedStream,
    chain: FilterChain,
    envelope_count: usize,
    decoded: Vec<u8>,
    max_incoming: usize,
    bytes_in: u64,
    bytes_out: u64,
    got_bytes_since_mark: bool,
}

impl Connection {
    pub fn new(stream: BoxedStream, max_incoming: usize) -> Self {
        Connection {
            stream,
            chain: FilterChain::new(),
            envelope_count: 0,
            decoded: Vec::new(),
            max_incoming,
            bytes_in: 0,
            bytes_out: 0,
            got_bytes_since_mark: true,
        }
    }

    /// Replaces the negotiated (application-end) filters. Envelope filters
    /// pushed with [`Connection::push_outermost_filter`] stay at the wire
    /// end of the chain.
    pub fn install_filters(&mut self, filters: Vec<Box<dyn Filter>>) {
        let envelope = self.chain.take_outermost(self.envelope_count);
        let mut all = filters;
        all.extend(envelope);
        self.chain.install(all);
    }

    /// Adds a filter at the wire end of the chain (HTTP envelope, TLS).
    /// Envelope filters survive later negotiation.
    pub fn push_outermost_filter(&mut self, filter: Box<dyn Filter>) {
        self.envelope_count += 1;
        self.chain.push_outermost(filter);
    }

    pub fn filter_ids(&self) -> Vec<crate::filter::FilterId> {
        self.chain.ids()
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Marks a request boundary. If the peer closes before any further
    /// byte arrives, the failure is flagged retryable: the request can be
    /// reissued safely on a fresh connection.
    pub fn mark_request_boundary(&mut self) {
        self.got_bytes_since_mark = false;
    }

    /// Sends one message. The message must reserve
    /// [`protocol::FRAME_PREFIX_LEN`] bytes of left margin. Returns wire
    /// bytes written.
    pub async fn send_message(&mut self, message: ByteBuffer) -> Result<usize> {
        let framed = protocol::frame_message(message)?;
        let wire = self.chain.write_through(vec![framed])?;
        let mut written = 0;
        for buf in &wire {
            self.stream.write_all(buf.as_slice()).await?;
            written += buf.len();
        }
        self.stream.flush().await?;
        self.bytes_out += written as u64;
        trace!(written, "sent frame");
        Ok(written)
    }

    /// Receives one complete frame, running wire bytes up the filter
    /// chain. A zero-length frame (chunk separator) is returned as an
    /// empty buffer.
    pub async fn recv_frame(&mut self) -> Result<ByteBuffer> {
        loop {
            if let Some(frame) = protocol::extract_frame(&mut self.decoded, self.max_incoming)? {
                trace!(len = frame.len(), "received frame");
                return Ok(frame);
            }
            let mut scratch = [0u8; READ_SCRATCH_LEN];
            let n = self.stream.read(&mut scratch).await?;
            if n == 0 {
                let retryable = !self.got_bytes_since_mark && self.decoded.is_empty();
                return Err(
                    Error::transport("connection closed by peer").with_retry(retryable)
                );
            }
            self.got_bytes_since_mark = true;
            self.bytes_in += n as u64;
            self.chain.read_through(&scratch[..n], &mut self.decoded)?;
        }
    }

    /// Shuts down the write side, signalling end-of-stream to the peer.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// Surrenders the raw stream, discarding filter state. Used when a
    /// broker splices two connections together.
    pub fn into_stream(self) -> BoxedStream {
        self.stream
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("filters", &self.chain.ids())
            .field("bytes_in", &self.bytes_in)
            .field("bytes_out", &self.bytes_out)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::compress::ZlibStatefulFilter;
    use tokio::io::duplex;

    fn message(payload: &[u8]) -> ByteBuffer {
        ByteBuffer::copy_with_margin(payload, protocol::FRAME_PREFIX_LEN)
    }

    #[tokio::test]
    async fn frames_round_trip_over_a_stream() {
        let (a, b) = duplex(64 * 1024);
        let mut left = Connection::new(Box::new(a), 1024 * 1024);
        let mut right = Connection::new(Box::new(b), 1024 * 1024);

        left.send_message(message(&[1, 2, 3])).await.unwrap();
        left.send_message(message(&[4, 5])).await.unwrap();

        assert_eq!(right.recv_frame().await.unwrap().as_slice(), &[1, 2, 3]);
        assert_eq!(right.recv_frame().await.unwrap().as_slice(), &[4, 5]);
    }

    #[tokio::test]
    async fn filtered_connections_agree() {
        let (a, b) = duplex(64 * 1024);
        let mut left = Connection::new(Box::new(a), 1024 * 1024);
        let mut right = Connection::new(Box::new(b), 1024 * 1024);
        left.install_filters(vec![Box::new(ZlibStatefulFilter::new())]);
        right.install_filters(vec![Box::new(ZlibStatefulFilter::new())]);

        let payload: Vec<u8> = (0..20_000).map(|i| (i % 7) as u8).collect();
        left.send_message(message(&payload)).await.unwrap();
        let frame = right.recv_frame().await.unwrap();
        assert_eq!(frame.as_slice(), &payload[..]);
    }

    #[tokio::test]
    async fn close_before_any_data_is_retryable() {
        let (a, b) = duplex(1024);
        let mut left = Connection::new(Box::new(a), 1024 * 1024);
        left.mark_request_boundary();
        drop(b);
        let err = left.recv_frame().await.unwrap_err();
        assert!(err.should_retry());
    }

    #[tokio::test]
    async fn close_mid_frame_is_not_retryable() {
        let (a, mut b) = duplex(1024);
        let mut left = Connection::new(Box::new(a), 1024 * 1024);
        left.mark_request_boundary();
        // A partial frame arrives, then the peer goes away.
        b.write_all(&[10, 0, 0, 0, 1, 2]).await.unwrap();
        drop(b);
        let err = left.recv_frame().await.unwrap_err();
        assert!(!err.should_retry());
    }
}
