//! Server-side remote call context.
//!
//! A handler receives the call as a [`RemoteCallContext`]. It may decode
//! the arguments and commit a result before returning, or move the
//! context into another task and commit later; the session waits on the
//! completion either way. A context dropped without a commit produces an
//! error reply rather than a hung client.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::warn;

use crate::buffer::ByteBuffer;
use crate::error::{Error, Result};
use crate::protocol::{self, MessageHeader};
use crate::typedmap::TypedMap;

/// Encoded result bytes, or the error to report to the caller.
pub type ReplyResult = std::result::Result<Vec<u8>, Error>;

/// Session-scoped user data, shared by every call context of one session.
pub type SessionData = Arc<Mutex<TypedMap>>;

/// The in-flight server side of one remote call.
pub struct RemoteCallContext {
    header: MessageHeader,
    payload: ByteBuffer,
    session_id: u64,
    session_data: SessionData,
    reply: Option<oneshot::Sender<ReplyResult>>,
}

impl RemoteCallContext {
    pub(crate) fn new(
        header: MessageHeader,
        payload: ByteBuffer,
        session_id: u64,
        session_data: SessionData,
    ) -> (Self, oneshot::Receiver<ReplyResult>) {
        let (tx, rx) = oneshot::channel();
        (
            RemoteCallContext {
                header,
                payload,
                session_id,
                session_data,
                reply: Some(tx),
            },
            rx,
        )
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Typed per-session storage. State placed here survives across calls
    /// on the same connection and is dropped with the session.
    pub fn session_data(&self) -> &SessionData {
        &self.session_data
    }

    /// The argument count sent by the caller.
    pub fn arg_count(&self) -> Result<u8> {
        protocol::split_request_payload(&self.payload).map(|(argc, _)| argc)
    }

    /// Decodes the argument tuple.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T> {
        let (_, bytes) = protocol::split_request_payload(&self.payload)?;
        self.header.protocol.decode(bytes.as_slice())
    }

    /// Completes the call with a result; the session sends the reply.
    pub fn commit<R: Serialize>(mut self, result: &R) -> Result<()> {
        let bytes = self.header.protocol.encode(result)?;
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Ok(bytes));
        }
        Ok(())
    }

    /// Completes the call with an error reply.
    pub fn commit_error(mut self, err: Error) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Err(err));
        }
    }
}

impl Drop for RemoteCallContext {
    fn drop(&mut self) {
        if let Some(tx) = self.reply.take() {
            warn!(
                interface = %self.header.interface,
                method_id = self.header.method_id,
                "call context dropped without commit"
            );
            let _ = tx.send(Err(Error::application(
                0,
                "handler dropped the call without committing a reply",
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ArchiveProtocol, CallMode};

    fn context_for(args: &(String, u32)) -> (RemoteCallContext, oneshot::Receiver<ReplyResult>) {
        let header = MessageHeader {
            runtime_version: 1,
            archive_version: 1,
            protocol: ArchiveProtocol::Binary,
            call_mode: CallMode::Twoway,
            request_id: 5,
            interface: "I_Test".into(),
            method_id: 0,
            ping_back_interval_ms: 0,
        };
        let request = protocol::encode_request(&header, 2, args).unwrap();
        let msg = protocol::Message::decode(request).unwrap();
        RemoteCallContext::new(msg.header, msg.payload, 9, SessionData::default())
    }

    #[tokio::test]
    async fn commit_delivers_encoded_result() {
        let (ctx, rx) = context_for(&("x".into(), 3));
        let args: (String, u32) = ctx.args().unwrap();
        assert_eq!(args, ("x".to_string(), 3));
        ctx.commit(&args.1).unwrap();
        let bytes = rx.await.unwrap().unwrap();
        let result: u32 = ArchiveProtocol::Binary.decode(&bytes).unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn dropping_context_yields_an_error_reply() {
        let (ctx, rx) = context_for(&("x".into(), 3));
        drop(ctx);
        let reply = rx.await.unwrap();
        assert!(reply.is_err());
    }

    #[tokio::test]
    async fn deferred_commit_from_another_task() {
        let (ctx, rx) = context_for(&("hi".into(), 1));
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let _ = ctx.commit(&"late".to_string());
        });
        let bytes = rx.await.unwrap().unwrap();
        let result: String = ArchiveProtocol::Binary.decode(&bytes).unwrap();
        assert_eq!(result, "late");
    }
}
