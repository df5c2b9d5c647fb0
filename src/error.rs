//! # Error Model
//!
//! One error type covers the whole call pipeline. Every fallible operation
//! returns [`Result`], and errors cross the wire only as a serialized
//! [`RemoteError`]. The taxonomy mirrors the layers of the stack:
//!
//! - **Transport**: connect/read/write failures; the connection closes.
//! - **Framing**: malformed length prefix, HTTP parse failure, oversize
//!   message; the connection closes.
//! - **Filter**: filter negotiation or transform failure (compression
//!   corruption, verifier mismatch); the connection closes.
//! - **Protocol**: unknown interface or method, arity mismatch, payload
//!   decode failure. Reported back to the caller; the session stays open.
//! - **Versioning**: the server advises runtime and archive versions; the
//!   client stub retries once with the advised pair.
//! - **Application**: a handler-raised error, carried with its original id.
//! - **Resource**: quota exceeded, connection limit, transfer aborted,
//!   proxy endpoint unavailable.
//! - **Timeout** / **Cancelled**: deadline expiry and explicit cancellation,
//!   both delivered through the same completion path.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Fine-grained protocol faults reported inside [`ErrorKind::Protocol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolFault {
    /// No binding registered under the requested interface name.
    UnknownInterface,
    /// The interface exists but the method id does not.
    UnknownMethod,
    /// The argument count sent by the caller does not match the binding.
    ArityMismatch,
    /// Argument or result bytes failed to decode under the agreed archive.
    Serialization,
    /// The serialization protocol byte is not one this peer supports.
    UnsupportedProtocol,
    /// Header bytes could not be parsed.
    BadHeader,
    /// A legacy built-in that is stubbed out in this runtime.
    LegacyCall,
}

impl fmt::Display for ProtocolFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtocolFault::UnknownInterface => "unknown interface",
            ProtocolFault::UnknownMethod => "unknown method",
            ProtocolFault::ArityMismatch => "arity mismatch",
            ProtocolFault::Serialization => "serialization failure",
            ProtocolFault::UnsupportedProtocol => "unsupported serialization protocol",
            ProtocolFault::BadHeader => "malformed message header",
            ProtocolFault::LegacyCall => "legacy call not supported",
        };
        f.write_str(s)
    }
}

/// Classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connect/read/write failure on the underlying transport.
    Transport,
    /// Wire framing violation (length prefix, HTTP envelope).
    Framing,
    /// Failure inside a transport filter or filter negotiation.
    Filter,
    /// Request could not be dispatched; the session stays open.
    Protocol(ProtocolFault),
    /// Version mismatch; carries the versions advised by the server.
    Versioning { runtime: u32, archive: u32 },
    /// Error raised by a user handler, with its application-assigned id.
    Application { id: u32 },
    /// Quotas, connection limits, aborted transfers, missing endpoints.
    Resource,
    /// A deadline expired before the operation completed.
    Timeout,
    /// The operation was cancelled by the caller.
    Cancelled,
}

/// The crate error type: a kind, a human-readable message, and a retry hint.
///
/// `should_retry` is set only for the closed-by-peer-before-any-data
/// condition, where reissuing the call on a fresh connection is safe.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    should_retry: bool,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            should_retry: false,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn framing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Framing, message)
    }

    pub fn filter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Filter, message)
    }

    pub fn protocol(fault: ProtocolFault, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol(fault), message)
    }

    pub fn versioning(runtime: u32, archive: u32) -> Self {
        Self::new(
            ErrorKind::Versioning { runtime, archive },
            format!("server requires runtime version {runtime}, archive version {archive}"),
        )
    }

    pub fn application(id: u32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Application { id }, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "remote call cancelled")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn should_retry(&self) -> bool {
        self.should_retry
    }

    pub fn with_retry(mut self, should_retry: bool) -> Self {
        self.should_retry = should_retry;
        self
    }

    /// Transport, framing and filter errors leave the connection in an
    /// undefined state; the session closes on them. Everything else is
    /// reportable in-band.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Transport
                | ErrorKind::Framing
                | ErrorKind::Filter
                | ErrorKind::Timeout
                | ErrorKind::Cancelled
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::transport(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::protocol(ProtocolFault::Serialization, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::protocol(ProtocolFault::Serialization, e.to_string())
    }
}

/// Wire representation of an error travelling back to the caller.
///
/// This is what a response frame carries when `result_present == 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for RemoteError {
    fn from(e: &Error) -> Self {
        RemoteError {
            kind: e.kind,
            message: e.message.clone(),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(re: RemoteError) -> Self {
        Error::new(re.kind, re.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_round_trip_preserves_kind() {
        let original = Error::versioning(12, 5);
        let wire = RemoteError::from(&original);
        let bytes = bincode::serialize(&wire).unwrap();
        let decoded: RemoteError = bincode::deserialize(&bytes).unwrap();
        let back = Error::from(decoded);
        assert_eq!(back.kind(), ErrorKind::Versioning { runtime: 12, archive: 5 });
    }

    #[test]
    fn retry_flag_defaults_off() {
        let e = Error::transport("connection reset");
        assert!(!e.should_retry());
        assert!(e.with_retry(true).should_retry());
    }

    #[test]
    fn protocol_errors_are_not_fatal() {
        let e = Error::protocol(ProtocolFault::UnknownMethod, "no method 9");
        assert!(!e.is_fatal_to_connection());
        assert!(Error::framing("bad length").is_fatal_to_connection());
    }
}
