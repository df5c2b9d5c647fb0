//! Proxy endpoints: reverse tunnelling through a broker.
//!
//! A back-end that cannot accept inbound connections keeps one outbound
//! connection to a broker and registers an endpoint name on it. Clients
//! direct calls at the broker; for each client the broker queues a fresh
//! request id and completes the back-end's long poll. The back-end dials
//! one new connection per id and offers it with `MakeConnectionAvailable`;
//! the broker pairs that connection with the waiting client and splices
//! the two sockets, after which the client talks straight to the back-end.
//!
//! A back-end that stays away from its long poll past the idle interval is
//! purged; its waiting clients fail with an endpoint-unavailable error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::Client;
use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::protocol::method_ids;
use crate::service::now_ms;
use crate::transport::{CancelHandle, Connection, Endpoint};

/// Outcome of a back-end long poll.
pub enum PollOutcome {
    /// Requests were already queued.
    Ready(Vec<String>),
    /// Nothing queued; the receiver completes when a request arrives or
    /// the poll window lapses (with an empty list).
    Parked(oneshot::Receiver<Vec<String>>),
}

struct EndpointEntry {
    owner_session: u64,
    pending: Vec<String>,
    parked: Option<(u64, oneshot::Sender<Vec<String>>)>,
    parked_generation: u64,
    last_poll_ms: u64,
}

#[derive(Default)]
struct ProxyState {
    entries: HashMap<String, EndpointEntry>,
    waiters: HashMap<(String, String), oneshot::Sender<Connection>>,
}

/// Broker-side registry of proxy endpoints.
#[derive(Clone)]
pub struct ProxyEndpointService {
    runtime: Runtime,
    state: Arc<Mutex<ProxyState>>,
}

impl ProxyEndpointService {
    pub fn new(runtime: Runtime) -> Self {
        ProxyEndpointService {
            runtime,
            state: Arc::new(Mutex::new(ProxyState::default())),
        }
    }

    fn idle_timeout(&self) -> Duration {
        self.runtime.config().proxy_endpoint_idle_timeout
    }

    /// Poll window granted to a parked long poll; re-polling inside the
    /// idle timeout is what keeps the endpoint registered.
    pub fn poll_window(&self) -> Duration {
        (self.idle_timeout() / 2).max(Duration::from_secs(1))
    }

    /// Registers an endpoint name for the owning session.
    pub fn setup_endpoint(&self, session_id: u64, name: &str, password: &str) -> Result<()> {
        if let Some(expected) = &self.runtime.config().proxy_endpoint_password {
            if expected != password {
                return Err(Error::resource("proxy endpoint password rejected"));
            }
        }
        let mut state = self.state.lock();
        state.entries.insert(
            name.to_string(),
            EndpointEntry {
                owner_session: session_id,
                pending: Vec::new(),
                parked: None,
                parked_generation: 0,
                last_poll_ms: now_ms(),
            },
        );
        info!(name, session_id, "proxy endpoint registered");
        Ok(())
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    /// Back-end long poll: returns queued request ids, or parks until one
    /// arrives or the poll window lapses.
    pub fn poll_requests(&self, name: &str) -> Result<PollOutcome> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(name)
            .ok_or_else(|| Error::resource(format!("proxy endpoint {name} is not registered")))?;
        entry.last_poll_ms = now_ms();
        if !entry.pending.is_empty() {
            return Ok(PollOutcome::Ready(std::mem::take(&mut entry.pending)));
        }

        let (tx, rx) = oneshot::channel();
        entry.parked_generation += 1;
        let generation = entry.parked_generation;
        entry.parked = Some((generation, tx));

        // Expire the park after one poll window so the back-end re-polls
        // and the broker sees it alive.
        let service = self.clone();
        let name = name.to_string();
        let window = self.poll_window();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut state = service.state.lock();
            if let Some(entry) = state.entries.get_mut(&name) {
                if let Some((parked_generation, tx)) = entry.parked.take() {
                    if parked_generation == generation {
                        let _ = tx.send(Vec::new());
                    } else {
                        entry.parked = Some((parked_generation, tx));
                    }
                }
            }
        });
        Ok(PollOutcome::Parked(rx))
    }

    /// Client side of the pairing: queues a fresh request id for `name`
    /// and returns it with the receiver that yields the back-connected
    /// stream.
    pub fn begin_client_request(
        &self,
        name: &str,
    ) -> Result<(String, oneshot::Receiver<Connection>)> {
        let mut state = self.state.lock();
        if !state.entries.contains_key(name) {
            return Err(Error::resource(format!(
                "proxy endpoint {name} is unavailable"
            )));
        }
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        state
            .waiters
            .insert((name.to_string(), request_id.clone()), tx);

        let entry = state
            .entries
            .get_mut(name)
            .ok_or_else(|| Error::resource(format!("proxy endpoint {name} is unavailable")))?;
        entry.pending.push(request_id.clone());
        if let Some((_, parked)) = entry.parked.take() {
            let ids = std::mem::take(&mut entry.pending);
            debug!(name, count = ids.len(), "completing parked long poll");
            let _ = parked.send(ids);
        }
        Ok((request_id, rx))
    }

    /// Abandons a pairing after a client-side timeout.
    pub fn abandon_client_request(&self, name: &str, request_id: &str) {
        let mut state = self.state.lock();
        state
            .waiters
            .remove(&(name.to_string(), request_id.to_string()));
        if let Some(entry) = state.entries.get_mut(name) {
            entry.pending.retain(|id| id != request_id);
        }
    }

    /// Pairs a back-connected stream with the waiting client.
    pub fn connection_available(&self, name: &str, request_id: &str, conn: Connection) {
        let waiter = self
            .state
            .lock()
            .waiters
            .remove(&(name.to_string(), request_id.to_string()));
        match waiter {
            Some(tx) => {
                if tx.send(conn).is_err() {
                    warn!(name, request_id, "client left before pairing completed");
                }
            }
            None => warn!(name, request_id, "no client waiting for this connection"),
        }
    }

    /// Drops every endpoint registered by a closing session.
    pub fn session_closed(&self, session_id: u64) {
        let mut state = self.state.lock();
        state.entries.retain(|name, entry| {
            if entry.owner_session == session_id {
                info!(name, "proxy endpoint removed with its session");
                false
            } else {
                true
            }
        });
    }

    /// Periodic purge of endpoints whose back-end stopped polling.
    pub async fn run(self, shutdown: CancelHandle) {
        let interval = self.runtime.config().reaping_interval;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let idle_ms = self.idle_timeout().as_millis() as u64;
            let now = now_ms();
            let mut state = self.state.lock();
            state.entries.retain(|name, entry| {
                let alive = now.saturating_sub(entry.last_poll_ms) <= idle_ms;
                if !alive {
                    warn!(name, "proxy endpoint purged: back-end stopped polling");
                }
                alive
            });
        }
    }
}

/// Handle to a running back-end agent.
pub struct ProxyEndpointAgent {
    name: String,
    cancel: CancelHandle,
}

impl ProxyEndpointAgent {
    /// Registers `name` on the broker and keeps serving reverse
    /// connections with `server` until stopped.
    pub fn start(
        runtime: Runtime,
        broker: Endpoint,
        name: impl Into<String>,
        password: impl Into<String>,
        server: crate::server::Server,
    ) -> ProxyEndpointAgent {
        let name = name.into();
        let password = password.into();
        let cancel = CancelHandle::new();
        let task_cancel = cancel.clone();
        let task_name = name.clone();
        tokio::spawn(async move {
            loop {
                if task_cancel.is_cancelled() {
                    return;
                }
                let result = run_agent(
                    &runtime,
                    broker.clone(),
                    &task_name,
                    &password,
                    &server,
                    &task_cancel,
                )
                .await;
                if task_cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = result {
                    warn!(name = %task_name, error = %e, "proxy agent lost broker; reconnecting");
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
        ProxyEndpointAgent { name, cancel }
    }

    pub fn endpoint_name(&self) -> &str {
        &self.name
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ProxyEndpointAgent {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_agent(
    runtime: &Runtime,
    broker: Endpoint,
    name: &str,
    password: &str,
    server: &crate::server::Server,
    cancel: &CancelHandle,
) -> Result<()> {
    let mut control = Client::new(runtime, broker.clone());
    // The long poll deliberately outlives the default call timeout.
    control.set_call_timeout(runtime.config().proxy_endpoint_idle_timeout);
    control.connect().await?;
    control
        .call::<_, ()>(
            method_ids::BUILTIN_INTERFACE,
            method_ids::SETUP_PROXY_ENDPOINT,
            2,
            &(name.to_string(), password.to_string()),
        )
        .await?;
    info!(name, broker = %broker, "proxy endpoint agent registered");

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let request_ids: Vec<String> = control
            .call(
                method_ids::BUILTIN_INTERFACE,
                method_ids::GET_CONNECTION_REQUESTS,
                0,
                &(),
            )
            .await?;
        for request_id in request_ids {
            debug!(name, request_id, "dialling back for proxied client");
            let runtime = runtime.clone();
            let broker = broker.clone();
            let name = name.to_string();
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    serve_one_reverse_connection(&runtime, broker, &name, &request_id, &server)
                        .await
                {
                    warn!(name, request_id, error = %e, "reverse connection failed");
                }
            });
        }
    }
}

async fn serve_one_reverse_connection(
    runtime: &Runtime,
    broker: Endpoint,
    name: &str,
    request_id: &str,
    server: &crate::server::Server,
) -> Result<()> {
    let mut client = Client::new(runtime, broker.clone());
    client.connect().await?;
    client
        .call::<_, ()>(
            method_ids::BUILTIN_INTERFACE,
            method_ids::MAKE_CONNECTION_AVAILABLE,
            2,
            &(name.to_string(), request_id.to_string()),
        )
        .await?;
    let conn = client
        .take_connection()
        .ok_or_else(|| Error::transport("reverse connection has no stream"))?;
    server.serve_adopted(conn, broker);
    Ok(())
}
