//! Ping-back keepalives for long-running calls.
//!
//! A handler that runs past the client's receive timeout would otherwise
//! look like a dead server. When a request asks for ping-backs, its
//! session registers here; a single background cycle pops expired entries
//! from a deadline min-heap and tells the owning session (over its command
//! channel) to emit a keepalive frame, then re-inserts the entry at
//! `now + interval`. The session stops emitting the moment the request
//! completes and unregisters. Intervals below one second are clamped.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Smallest honored ping-back interval.
pub const MIN_PING_BACK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct Registration {
    request_id: u64,
    interval: Duration,
    tx: mpsc::Sender<u64>,
}

#[derive(PartialEq, Eq)]
struct HeapKey {
    deadline: Instant,
    session_id: u64,
    request_id: u64,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.session_id.cmp(&other.session_id))
            .then(self.request_id.cmp(&other.request_id))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct State {
    registrations: HashMap<u64, Registration>,
    heap: BinaryHeap<Reverse<HeapKey>>,
}

/// Shared ping-back scheduler. One instance per server; the cycle task is
/// spawned when the server starts.
#[derive(Clone, Default)]
pub struct PingBackService {
    state: Arc<Mutex<State>>,
    wakeup: Arc<Notify>,
}

impl PingBackService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the current request of a session. Overwrites any previous
    /// registration for the same session; a session runs one request at a
    /// time.
    pub fn register(
        &self,
        session_id: u64,
        request_id: u64,
        interval: Duration,
        tx: mpsc::Sender<u64>,
    ) {
        let interval = interval.max(MIN_PING_BACK_INTERVAL);
        let mut state = self.state.lock();
        state.registrations.insert(
            session_id,
            Registration {
                request_id,
                interval,
                tx,
            },
        );
        state.heap.push(Reverse(HeapKey {
            deadline: Instant::now() + interval,
            session_id,
            request_id,
        }));
        drop(state);
        debug!(session_id, request_id, ?interval, "ping-back registered");
        self.wakeup.notify_one();
    }

    /// Drops the registration once the request completes. Stale heap
    /// entries are discarded lazily by the cycle.
    pub fn unregister(&self, session_id: u64) {
        self.state.lock().registrations.remove(&session_id);
    }

    /// The background cycle. Runs until `shutdown` resolves.
    pub async fn run(self, shutdown: crate::transport::CancelHandle) {
        loop {
            let next_deadline = {
                let state = self.state.lock();
                state.heap.peek().map(|Reverse(k)| k.deadline)
            };
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = self.wakeup.notified() => continue,
                _ = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {}
            }
            self.fire_due();
        }
    }

    fn fire_due(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        while let Some(Reverse(key)) = state.heap.peek() {
            if key.deadline > now {
                break;
            }
            let Some(Reverse(key)) = state.heap.pop() else {
                break;
            };
            let Some(reg) = state.registrations.get(&key.session_id).cloned() else {
                continue;
            };
            if reg.request_id != key.request_id {
                // The session has moved on to a later request.
                continue;
            }
            trace!(session_id = key.session_id, "ping-back due");
            // The session may have gone away without unregistering; a full
            // or closed channel drops the ping silently.
            let _ = reg.tx.try_send(reg.request_id);
            state.heap.push(Reverse(HeapKey {
                deadline: now + reg.interval,
                session_id: key.session_id,
                request_id: key.request_id,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CancelHandle;

    #[tokio::test(start_paused = true)]
    async fn fires_at_interval_until_unregistered() {
        let service = PingBackService::new();
        let shutdown = CancelHandle::new();
        tokio::spawn(service.clone().run(shutdown.clone()));

        let (tx, mut rx) = mpsc::channel(8);
        service.register(7, 99, Duration::from_secs(1), tx);

        // Two pings arrive on schedule.
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("first ping")
            .expect("channel open");
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("second ping")
            .expect("channel open");

        service.unregister(7);
        let quiet = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(quiet.is_err(), "no pings after unregister");
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn sub_second_intervals_are_clamped() {
        let service = PingBackService::new();
        let shutdown = CancelHandle::new();
        tokio::spawn(service.clone().run(shutdown.clone()));

        let (tx, mut rx) = mpsc::channel(8);
        service.register(1, 1, Duration::from_millis(10), tx);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err(), "clamped interval must not fire early");
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("ping after clamped interval")
            .expect("channel open");
        shutdown.cancel();
    }
}
