//! Auxiliary services running alongside the request/reply core: ping-back
//! keepalives, publish/subscribe, file transfer, proxy endpoints, and idle
//! session reaping.

pub mod filetransfer;
pub mod pingback;
pub mod proxy;
pub mod publish;
pub mod session_timeout;

use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds of a process-local monotonic clock. Used for activity
/// timestamps shared across tasks as plain atomics.
pub(crate) fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}
