//! # Wire Protocol
//!
//! The message header, the archive (serialization) protocols, the reserved
//! built-in method id space, and the binary framing helpers.
//!
//! ## Framing
//!
//! One message on a stream transport is a 4-byte little-endian length prefix
//! followed by exactly that many bytes. The length excludes itself and is
//! bounded by the configured maximum incoming message length. A length of
//! zero is a chunk separator, used only in chunked-response mode.
//!
//! ## Header layout
//!
//! Ordered fields, all integers little-endian:
//!
//! ```text
//! runtime_version:u32 | archive_version:u32 | protocol:u8 | call_mode:u8 |
//! request_id:u64 | interface_len:u32 | interface:utf8 | method_id:u32 |
//! ping_back_interval_ms:u32
//! ```
//!
//! A request payload is a `u8` argument count followed by the archive-encoded
//! argument tuple. A response payload is `result_present:u8` followed by the
//! encoded result (`1`) or the encoded [`RemoteError`] (`0`).

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::buffer::ByteBuffer;
use crate::error::{Error, ProtocolFault, RemoteError, Result};

/// Runtime protocol version spoken by this build.
pub const RUNTIME_VERSION: u32 = 12;

/// Archive encoding version spoken by this build.
pub const ARCHIVE_VERSION: u32 = 5;

/// Size of the binary frame length prefix, also the left margin reserved in
/// front of serialized messages so the prefix can be written in place.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Reserved method ids at the top of the id space. User interfaces assign
/// small integers from zero; anything at or above [`method_ids::FIRST`] is
/// dispatched internally.
pub mod method_ids {
    /// Lowest reserved id.
    pub const FIRST: u32 = 0xFFFF_FF00;

    pub const PING: u32 = 0xFFFF_FF01;
    pub const PING_BACK: u32 = 0xFFFF_FF02;
    pub const REQUEST_TRANSPORT_FILTERS: u32 = 0xFFFF_FF03;
    /// Legacy negotiation call, kept as a compatibility stub.
    pub const QUERY_FOR_TRANSPORT_FILTERS: u32 = 0xFFFF_FF04;
    pub const REQUEST_SUBSCRIPTION: u32 = 0xFFFF_FF05;
    pub const CREATE_CALLBACK_CONNECTION: u32 = 0xFFFF_FF06;
    pub const SETUP_PROXY_ENDPOINT: u32 = 0xFFFF_FF07;
    pub const GET_CONNECTION_REQUESTS: u32 = 0xFFFF_FF08;
    pub const MAKE_CONNECTION_AVAILABLE: u32 = 0xFFFF_FF09;
    pub const REQUEST_PROXY_CONNECTION: u32 = 0xFFFF_FF0A;
    pub const BEGIN_UPLOAD: u32 = 0xFFFF_FF10;
    pub const UPLOAD_CHUNKS: u32 = 0xFFFF_FF11;
    pub const BEGIN_DOWNLOAD: u32 = 0xFFFF_FF12;
    pub const TRIM_DOWNLOAD: u32 = 0xFFFF_FF13;
    pub const DOWNLOAD_CHUNKS: u32 = 0xFFFF_FF14;

    /// Interface name carried by built-in control requests.
    pub const BUILTIN_INTERFACE: &str = "";
}

/// One-way calls complete after the send; two-way calls wait for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Oneway = 0,
    Twoway = 1,
}

impl CallMode {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(CallMode::Oneway),
            1 => Ok(CallMode::Twoway),
            other => Err(Error::protocol(
                ProtocolFault::BadHeader,
                format!("bad call mode {other}"),
            )),
        }
    }
}

/// Which archive encodes argument tuples and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveProtocol {
    /// Compact binary archive (bincode).
    Binary = 1,
    /// Text archive (JSON), for interop and debugging.
    Json = 2,
}

impl ArchiveProtocol {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(ArchiveProtocol::Binary),
            2 => Ok(ArchiveProtocol::Json),
            other => Err(Error::protocol(
                ProtocolFault::UnsupportedProtocol,
                format!("serialization protocol {other}"),
            )),
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            ArchiveProtocol::Binary => Ok(bincode::serialize(value)?),
            ArchiveProtocol::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            ArchiveProtocol::Binary => Ok(bincode::deserialize(bytes)?),
            ArchiveProtocol::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

/// Parsed message header.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    pub runtime_version: u32,
    pub archive_version: u32,
    pub protocol: ArchiveProtocol,
    pub call_mode: CallMode,
    pub request_id: u64,
    pub interface: String,
    pub method_id: u32,
    pub ping_back_interval_ms: u32,
}

impl MessageHeader {
    /// Header for a built-in control request.
    pub fn builtin(method_id: u32, request_id: u64, protocol: ArchiveProtocol) -> Self {
        MessageHeader {
            runtime_version: RUNTIME_VERSION,
            archive_version: ARCHIVE_VERSION,
            protocol,
            call_mode: CallMode::Twoway,
            request_id,
            interface: method_ids::BUILTIN_INTERFACE.to_string(),
            method_id,
            ping_back_interval_ms: 0,
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.method_id >= method_ids::FIRST
    }

    /// Header for the reply to `self`, echoing identity fields.
    pub fn reply_header(&self) -> MessageHeader {
        MessageHeader {
            call_mode: CallMode::Twoway,
            interface: self.interface.clone(),
            ..self.clone()
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.runtime_version.to_le_bytes());
        out.extend_from_slice(&self.archive_version.to_le_bytes());
        out.push(self.protocol as u8);
        out.push(self.call_mode as u8);
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&(self.interface.len() as u32).to_le_bytes());
        out.extend_from_slice(self.interface.as_bytes());
        out.extend_from_slice(&self.method_id.to_le_bytes());
        out.extend_from_slice(&self.ping_back_interval_ms.to_le_bytes());
    }

    /// Decodes a header, returning it and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(MessageHeader, usize)> {
        let mut r = Reader::new(bytes);
        let runtime_version = r.u32()?;
        let archive_version = r.u32()?;
        let protocol = ArchiveProtocol::from_u8(r.u8()?)?;
        let call_mode = CallMode::from_u8(r.u8()?)?;
        let request_id = r.u64()?;
        let name_len = r.u32()? as usize;
        let name_bytes = r.take(name_len)?;
        let interface = std::str::from_utf8(name_bytes)
            .map_err(|_| Error::protocol(ProtocolFault::BadHeader, "interface name not utf-8"))?
            .to_string();
        let method_id = r.u32()?;
        let ping_back_interval_ms = r.u32()?;
        Ok((
            MessageHeader {
                runtime_version,
                archive_version,
                protocol,
                call_mode,
                request_id,
                interface,
                method_id,
                ping_back_interval_ms,
            },
            r.pos,
        ))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::protocol(ProtocolFault::BadHeader, "truncated header"));
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }
}

/// A decoded message: header plus payload bytes.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: ByteBuffer,
}

impl Message {
    pub fn decode(frame: ByteBuffer) -> Result<Message> {
        let (header, consumed) = MessageHeader::decode(frame.as_slice())?;
        let payload = frame.slice(consumed, frame.len() - consumed);
        Ok(Message { header, payload })
    }

    pub fn is_ping_back(&self) -> bool {
        self.header.method_id == method_ids::PING_BACK
    }
}

/// Serializes a request message: header, argument count, argument tuple.
/// The returned buffer reserves [`FRAME_PREFIX_LEN`] bytes of left margin
/// for the framer.
pub fn encode_request<Args: Serialize>(
    header: &MessageHeader,
    arg_count: u8,
    args: &Args,
) -> Result<ByteBuffer> {
    let mut out = vec![0u8; FRAME_PREFIX_LEN];
    header.encode_into(&mut out);
    out.push(arg_count);
    out.extend_from_slice(&header.protocol.encode(args)?);
    Ok(ByteBuffer::with_left_margin(out, FRAME_PREFIX_LEN))
}

/// Splits a request payload into its argument count and tuple bytes.
pub fn split_request_payload(payload: &ByteBuffer) -> Result<(u8, ByteBuffer)> {
    if payload.is_empty() {
        return Err(Error::protocol(ProtocolFault::BadHeader, "empty request payload"));
    }
    let argc = payload.as_slice()[0];
    Ok((argc, payload.slice(1, payload.len() - 1)))
}

/// Serializes a reply message carrying a result value.
pub fn encode_reply<R: Serialize>(header: &MessageHeader, result: &R) -> Result<ByteBuffer> {
    let reply = header.reply_header();
    let mut out = vec![0u8; FRAME_PREFIX_LEN];
    reply.encode_into(&mut out);
    out.push(1);
    out.extend_from_slice(&reply.protocol.encode(result)?);
    Ok(ByteBuffer::with_left_margin(out, FRAME_PREFIX_LEN))
}

/// Serializes a reply message around already-encoded result bytes.
pub fn encode_reply_raw(header: &MessageHeader, result_bytes: &[u8]) -> ByteBuffer {
    let reply = header.reply_header();
    let mut out = vec![0u8; FRAME_PREFIX_LEN];
    reply.encode_into(&mut out);
    out.push(1);
    out.extend_from_slice(result_bytes);
    ByteBuffer::with_left_margin(out, FRAME_PREFIX_LEN)
}

/// Serializes a reply message carrying an error.
pub fn encode_error_reply(header: &MessageHeader, err: &Error) -> Result<ByteBuffer> {
    let reply = header.reply_header();
    let mut out = vec![0u8; FRAME_PREFIX_LEN];
    reply.encode_into(&mut out);
    out.push(0);
    let remote = RemoteError::from(err);
    out.extend_from_slice(&reply.protocol.encode(&remote)?);
    Ok(ByteBuffer::with_left_margin(out, FRAME_PREFIX_LEN))
}

/// Serializes a bare ping-back keepalive frame.
pub fn encode_ping_back(protocol: ArchiveProtocol, request_id: u64) -> ByteBuffer {
    let header = MessageHeader::builtin(method_ids::PING_BACK, request_id, protocol);
    let mut out = vec![0u8; FRAME_PREFIX_LEN];
    header.encode_into(&mut out);
    ByteBuffer::with_left_margin(out, FRAME_PREFIX_LEN)
}

/// Decodes a response payload into the expected result type, raising the
/// carried remote error when `result_present == 0`.
pub fn decode_reply<R: DeserializeOwned>(msg: &Message) -> Result<R> {
    let payload = msg.payload.as_slice();
    if payload.is_empty() {
        return Err(Error::protocol(ProtocolFault::BadHeader, "empty response payload"));
    }
    let body = &payload[1..];
    match payload[0] {
        1 => msg.header.protocol.decode(body),
        0 => {
            let remote: RemoteError = msg.header.protocol.decode(body)?;
            Err(remote.into())
        }
        other => Err(Error::protocol(
            ProtocolFault::BadHeader,
            format!("bad result marker {other}"),
        )),
    }
}

/// Writes the binary frame length prefix into the buffer's left margin.
pub fn frame_message(mut message: ByteBuffer) -> Result<ByteBuffer> {
    let len = message.len() as u32;
    message.prepend(&len.to_le_bytes())?;
    Ok(message)
}

/// Attempts to extract one complete frame from the front of `stream_buf`.
/// On success the frame bytes (without the prefix) are returned and the
/// consumed bytes are drained. A zero-length frame returns an empty buffer
/// (chunk separator). Oversize frames are a framing error.
pub fn extract_frame(stream_buf: &mut Vec<u8>, max_len: usize) -> Result<Option<ByteBuffer>> {
    if stream_buf.len() < FRAME_PREFIX_LEN {
        return Ok(None);
    }
    let len = u32::from_le_bytes([stream_buf[0], stream_buf[1], stream_buf[2], stream_buf[3]])
        as usize;
    if len > max_len {
        return Err(Error::framing(format!(
            "incoming message of {len} bytes exceeds limit of {max_len}"
        )));
    }
    if stream_buf.len() < FRAME_PREFIX_LEN + len {
        return Ok(None);
    }
    let frame: Vec<u8> = stream_buf[FRAME_PREFIX_LEN..FRAME_PREFIX_LEN + len].to_vec();
    stream_buf.drain(..FRAME_PREFIX_LEN + len);
    Ok(Some(ByteBuffer::from_vec(frame).into_read_only()))
}
