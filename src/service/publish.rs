//! Publish/subscribe over adopted connections.
//!
//! A subscriber connects like any client and issues the built-in
//! subscription request naming a topic; the server adopts that connection
//! into the topic's publisher, which from then on pushes one-way calls to
//! every subscriber. Each published call is serialized once and written
//! concurrently to the fan-out set, bounded by the configured simultaneous
//! publish limit. The periodic timer pings every subscription and harvests
//! the ones with no activity inside twice their ping interval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::ByteBuffer;
use crate::client::Client;
use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::protocol::{self, method_ids, CallMode, MessageHeader};
use crate::service::now_ms;
use crate::transport::{CancelHandle, Connection, Endpoint};

/// Wire request of the `RequestSubscription` built-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub topic: String,
    pub ping_interval_ms: u32,
}

/// Wire reply of the `RequestSubscription` built-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionAck {
    pub ping_interval_ms: u32,
}

/// Invoked with the subscriber's connection id.
pub type SubscriberCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Publisher configuration.
#[derive(Default, Clone)]
pub struct PublisherParams {
    pub topic: String,
    pub on_subscriber_connect: Option<SubscriberCallback>,
    pub on_subscriber_disconnect: Option<SubscriberCallback>,
}

impl PublisherParams {
    pub fn topic(topic: impl Into<String>) -> Self {
        PublisherParams {
            topic: topic.into(),
            ..Default::default()
        }
    }
}

struct SubscriberEntry {
    conn: Arc<AsyncMutex<Connection>>,
    last_activity_ms: Arc<AtomicU64>,
    ping_interval_ms: u32,
}

struct PublisherShared {
    topic: String,
    params: PublisherParams,
    subscribers: AsyncMutex<HashMap<String, SubscriberEntry>>,
    publish_permits: Arc<Semaphore>,
    next_request_id: AtomicU64,
    closed: AtomicBool,
}

impl PublisherShared {
    async fn remove_subscriber(&self, id: &str) {
        let removed = self.subscribers.lock().await.remove(id).is_some();
        if removed {
            debug!(topic = %self.topic, subscriber = id, "subscriber dropped");
            if let Some(cb) = &self.params.on_subscriber_disconnect {
                cb(id);
            }
        }
    }
}

/// A publisher for one topic. Obtained from the server; cheap to clone.
#[derive(Clone)]
pub struct Publisher {
    runtime: Runtime,
    shared: Arc<PublisherShared>,
}

impl Publisher {
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub async fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().await.len()
    }

    /// Publishes one one-way call to every live subscriber. The message is
    /// serialized once; writes run concurrently up to the configured
    /// limit. Returns the number of subscribers the message reached.
    pub async fn publish<Args>(&self, method_id: u32, arg_count: u8, args: &Args) -> Result<usize>
    where
        Args: Serialize + Sync,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::resource("publisher is closed"));
        }
        let cfg = self.runtime.config();
        let header = MessageHeader {
            runtime_version: cfg.runtime_version,
            archive_version: cfg.archive_version,
            protocol: cfg.archive_protocol,
            call_mode: CallMode::Oneway,
            request_id: self.shared.next_request_id.fetch_add(1, Ordering::Relaxed),
            interface: self.shared.topic.clone(),
            method_id,
            ping_back_interval_ms: 0,
        };
        let message = protocol::encode_request(&header, arg_count, args)?;
        Ok(broadcast(&self.shared, message).await)
    }

    /// Closes the publisher and disconnects current subscribers.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let mut subs = self.shared.subscribers.lock().await;
        for (id, entry) in subs.drain() {
            let mut conn = entry.conn.lock().await;
            conn.shutdown().await;
            if let Some(cb) = &self.shared.params.on_subscriber_disconnect {
                cb(&id);
            }
        }
        info!(topic = %self.shared.topic, "publisher closed");
    }
}

/// Sends an already-encoded message to every subscriber concurrently.
/// Failed subscribers are removed. Returns the delivery count.
async fn broadcast(shared: &Arc<PublisherShared>, message: ByteBuffer) -> usize {
    let snapshot: Vec<(String, Arc<AsyncMutex<Connection>>, Arc<AtomicU64>)> = {
        let subs = shared.subscribers.lock().await;
        subs.iter()
            .map(|(id, e)| (id.clone(), e.conn.clone(), e.last_activity_ms.clone()))
            .collect()
    };

    let mut tasks = JoinSet::new();
    for (id, conn, activity) in snapshot {
        let permits = shared.publish_permits.clone();
        let message = message.clone();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            let mut conn = conn.lock().await;
            match conn.send_message(message).await {
                Ok(_) => {
                    activity.store(now_ms(), Ordering::Relaxed);
                    (id, true)
                }
                Err(e) => {
                    warn!(subscriber = %id, error = %e, "publish write failed");
                    (id, false)
                }
            }
        });
    }

    let mut delivered = 0;
    let mut failed = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, true)) => delivered += 1,
            Ok((id, false)) => failed.push(id),
            Err(e) => warn!(error = %e, "publish task panicked"),
        }
    }
    for id in failed {
        shared.remove_subscriber(&id).await;
    }
    delivered
}

/// Server-side registry of publishers, plus the subscription adoption path
/// and the periodic ping/harvest cycle.
#[derive(Clone)]
pub struct PublishingService {
    runtime: Runtime,
    publishers: Arc<RwLock<HashMap<String, Arc<PublisherShared>>>>,
}

impl PublishingService {
    pub fn new(runtime: Runtime) -> Self {
        PublishingService {
            runtime,
            publishers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates (or replaces) the publisher for a topic.
    pub fn create_publisher(&self, params: PublisherParams) -> Result<Publisher> {
        if params.topic.is_empty() {
            return Err(Error::resource("publisher topic must not be empty"));
        }
        let limit = self.runtime.config().simultaneous_publish_limit.max(1);
        let shared = Arc::new(PublisherShared {
            topic: params.topic.clone(),
            params: params.clone(),
            subscribers: AsyncMutex::new(HashMap::new()),
            publish_permits: Arc::new(Semaphore::new(limit)),
            next_request_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        self.publishers
            .write()
            .insert(params.topic.clone(), shared.clone());
        info!(topic = %params.topic, "publisher created");
        Ok(Publisher {
            runtime: self.runtime.clone(),
            shared,
        })
    }

    pub fn has_publisher(&self, topic: &str) -> bool {
        self.publishers.read().contains_key(topic)
    }

    /// The publisher-to-subscriber ping interval granted to subscribers.
    pub fn ping_interval_ms(&self) -> u32 {
        self.runtime.config().publish_ping_interval.as_millis() as u32
    }

    /// Adopts a subscriber connection into a topic's fan-out set. Returns
    /// the subscriber's connection id.
    pub async fn add_subscriber(
        &self,
        topic: &str,
        conn: Connection,
        ping_interval_ms: u32,
    ) -> Result<String> {
        let shared = self
            .publishers
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| Error::resource(format!("no publisher for topic {topic}")))?;
        let id = Uuid::new_v4().to_string();
        let entry = SubscriberEntry {
            conn: Arc::new(AsyncMutex::new(conn)),
            last_activity_ms: Arc::new(AtomicU64::new(now_ms())),
            ping_interval_ms,
        };
        shared.subscribers.lock().await.insert(id.clone(), entry);
        debug!(topic, subscriber = %id, "subscriber adopted");
        if let Some(cb) = &shared.params.on_subscriber_connect {
            cb(&id);
        }
        Ok(id)
    }

    /// Periodic cycle: ping every subscription and harvest the idle ones.
    pub async fn run(self, shutdown: CancelHandle) {
        let interval = self.runtime.config().reaping_interval;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            self.ping_and_harvest().await;
        }
    }

    async fn ping_and_harvest(&self) {
        let publishers: Vec<Arc<PublisherShared>> =
            self.publishers.read().values().cloned().collect();
        let pub_ping_ms = self.ping_interval_ms();

        for shared in publishers {
            let ping = ping_frame(&self.runtime);
            let _ = broadcast(&shared, ping).await;

            // Activity was just refreshed for every reachable subscriber;
            // whoever is still stale is past 2x their ping interval.
            let now = now_ms();
            let stale: Vec<String> = {
                let subs = shared.subscribers.lock().await;
                subs.iter()
                    .filter(|(_, e)| {
                        let allowed = 2 * u64::from(e.ping_interval_ms.max(pub_ping_ms));
                        now.saturating_sub(e.last_activity_ms.load(Ordering::Relaxed)) > allowed
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for id in stale {
                shared.remove_subscriber(&id).await;
            }
        }
    }
}

/// One-way built-in ping frame used as a subscription keepalive.
fn ping_frame(runtime: &Runtime) -> ByteBuffer {
    let cfg = runtime.config();
    let header = MessageHeader {
        runtime_version: cfg.runtime_version,
        archive_version: cfg.archive_version,
        protocol: cfg.archive_protocol,
        call_mode: CallMode::Oneway,
        request_id: 0,
        interface: method_ids::BUILTIN_INTERFACE.to_string(),
        method_id: method_ids::PING,
        ping_back_interval_ms: 0,
    };
    // Encoding a unit tuple cannot fail.
    protocol::encode_request(&header, 0, &()).unwrap_or_else(|_| ByteBuffer::new())
}

/// A live subscription on the subscriber side: the adopted connection is
/// served by a local dispatcher whose bindings carry the topic interface.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    session_cancel: CancelHandle,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stops receiving published messages.
    pub fn close(&self) {
        self.session_cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.session_cancel.cancel();
    }
}

/// Subscribes to `topic` on the publishing server and serves published
/// calls with `dispatcher`'s binding for the topic interface.
pub async fn subscribe(
    runtime: &Runtime,
    endpoint: Endpoint,
    topic: &str,
    dispatcher: &crate::server::Server,
    ping_interval: Duration,
) -> Result<Subscription> {
    let mut client = Client::new(runtime, endpoint);
    client.connect().await?;
    let request = SubscriptionRequest {
        topic: topic.to_string(),
        ping_interval_ms: ping_interval.as_millis() as u32,
    };
    let ack: SubscriptionAck = client
        .call(
            method_ids::BUILTIN_INTERFACE,
            method_ids::REQUEST_SUBSCRIPTION,
            1,
            &(request,),
        )
        .await?;
    debug!(
        topic,
        publisher_ping_ms = ack.ping_interval_ms,
        "subscription accepted"
    );

    let conn = client
        .take_connection()
        .ok_or_else(|| Error::transport("subscription transport has no stream connection"))?;
    let session_cancel = dispatcher.serve_adopted(conn, client.endpoint().clone());
    Ok(Subscription {
        topic: topic.to_string(),
        session_cancel,
    })
}
