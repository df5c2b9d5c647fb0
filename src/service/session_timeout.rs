//! Idle session reaping.
//!
//! Sessions register an activity timestamp with the server; this periodic
//! cycle cancels any session whose last read or write is older than the
//! configured inactivity window. The cancelled session unwinds through
//! its own task and releases its resources there.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::info;

use crate::config::Runtime;
use crate::server::SessionRegistry;
use crate::service::now_ms;
use crate::transport::CancelHandle;

/// Periodic reaper over the server's session registry.
pub struct SessionTimeoutService {
    runtime: Runtime,
    sessions: Arc<SessionRegistry>,
}

impl SessionTimeoutService {
    pub fn new(runtime: Runtime, sessions: Arc<SessionRegistry>) -> Self {
        SessionTimeoutService { runtime, sessions }
    }

    pub async fn run(self, shutdown: CancelHandle) {
        let interval = self.runtime.config().reaping_interval;
        let idle_ms = self.runtime.config().session_idle_timeout.as_millis() as u64;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let now = now_ms();
            for handle in self.sessions.snapshot() {
                let last = handle.last_activity_ms.load(Ordering::Relaxed);
                if now.saturating_sub(last) > idle_ms {
                    info!(session_id = handle.id, "reaping idle session");
                    handle.cancel.cancel();
                }
            }
        }
    }
}
