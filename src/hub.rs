//! Pub/sub hub: in-process fan-out plus an optional broker bridge.
//!
//! Channels are opaque string keys. Delivery is at-most-once: events reach
//! the subscribers connected at publish time and are otherwise dropped.
//! Each subscription owns a bounded queue (capacity 256); when a slow
//! consumer overflows it, the oldest event is evicted and a per-subscription
//! `dropped` counter is incremented, so one stuck session never blocks the
//! publisher or its siblings.
//!
//! With a broker connected, every publish is mirrored to
//! `safehorizon.evt.<channel>` as a self-describing envelope and a bridge
//! task redelivers remote envelopes to local subscribers. A process's own
//! envelopes are suppressed on re-receipt (origin check plus a short
//! publish-id dedup TTL). Broker absence degrades to local-only delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channel receiving every alert for authority dashboards.
pub const CHANNEL_AUTHORITY: &str = "alerts.authority";

/// Channel receiving system-level notices.
pub const CHANNEL_ADMIN: &str = "admin.system";

/// Channel receiving every broadcast.
pub const CHANNEL_BROADCASTS_ALL: &str = "broadcasts.all";

/// Private per-tourist channel.
pub fn tourist_channel(tourist_id: &str) -> String {
    format!("alerts.tourist.{tourist_id}")
}

/// Per-zone broadcast channel.
pub fn zone_channel(zone_id: i64) -> String {
    format!("broadcasts.zone.{zone_id}")
}

/// Broker subject prefix for mirrored events.
const SUBJECT_PREFIX: &str = "safehorizon.evt.";

/// Per-subscription queue capacity.
const QUEUE_CAPACITY: usize = 256;

/// How long a publish id is remembered for echo suppression.
const DEDUP_TTL: Duration = Duration::from_secs(60);

/// Self-describing envelope mirrored across the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub publish_id: Uuid,
    pub origin: Uuid,
    pub channel: String,
    pub published_at: DateTime<Utc>,
    pub event: serde_json::Value,
}

struct SubscriberQueue {
    queue: Mutex<VecDeque<serde_json::Value>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, event: serde_json::Value) {
        let mut queue = self.queue.lock().expect("subscriber queue poisoned");
        if queue.len() >= QUEUE_CAPACITY {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Handle to one channel subscription. Dropping it without unsubscribing
/// leaks the queue slot until `unsubscribe` is called with its token.
pub struct Subscription {
    id: u64,
    channel: String,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Receive the next event, in publish order. Returns `None` once the
    /// subscription is closed and its queue drained.
    pub async fn recv(&self) -> Option<serde_json::Value> {
        loop {
            {
                let mut queue = self.queue.queue.lock().expect("subscriber queue poisoned");
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking receive for tests and drain loops.
    pub fn try_recv(&self) -> Option<serde_json::Value> {
        self.queue
            .queue
            .lock()
            .expect("subscriber queue poisoned")
            .pop_front()
    }

    /// Events evicted from this subscription's queue due to overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

struct HubInner {
    origin: Uuid,
    subscriptions: Mutex<HashMap<String, Vec<(u64, Arc<SubscriberQueue>)>>>,
    next_id: AtomicU64,
    broker: Option<async_nats::Client>,
    recent_publishes: Mutex<HashMap<Uuid, Instant>>,
    published: AtomicU64,
    delivered: AtomicU64,
}

/// The hub itself. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// A hub with no broker: local-only delivery.
    pub fn local() -> Self {
        Self::with_broker(None)
    }

    pub fn with_broker(broker: Option<async_nats::Client>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                origin: Uuid::new_v4(),
                subscriptions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                broker,
                recent_publishes: Mutex::new(HashMap::new()),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Connect to the broker and return a bridged hub, or a local-only hub
    /// if the broker is unreachable.
    pub async fn connect(broker_url: Option<&str>) -> Self {
        let Some(url) = broker_url else {
            info!("no broker configured; hub delivers locally only");
            return Self::local();
        };
        match async_nats::connect(url).await {
            Ok(client) => {
                info!(%url, "connected to broker");
                let hub = Self::with_broker(Some(client));
                hub.spawn_bridge();
                hub
            }
            Err(err) => {
                warn!(%url, error = %err, "broker unreachable; hub delivers locally only");
                Self::local()
            }
        }
    }

    /// Subscribe to a channel. Events published afterwards are delivered in
    /// publish order until `unsubscribe`.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new());
        self.inner
            .subscriptions
            .lock()
            .expect("subscription table poisoned")
            .entry(channel.to_string())
            .or_default()
            .push((id, queue.clone()));
        Subscription {
            id,
            channel: channel.to_string(),
            queue,
        }
    }

    /// Remove a subscription. Idempotent; after return the handler sees no
    /// new events (already-queued ones can still be drained).
    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut table = self
            .inner
            .subscriptions
            .lock()
            .expect("subscription table poisoned");
        if let Some(entries) = table.get_mut(&subscription.channel) {
            entries.retain(|(id, _)| *id != subscription.id);
            if entries.is_empty() {
                table.remove(&subscription.channel);
            }
        }
        drop(table);
        subscription.queue.close();
    }

    /// Publish an event: local subscribers first, then the broker mirror.
    /// Best-effort on both legs; a broker failure only logs.
    pub async fn publish(&self, channel: &str, event: serde_json::Value) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.dispatch_local(channel, &event);

        if let Some(broker) = &self.inner.broker {
            let envelope = Envelope {
                publish_id: Uuid::new_v4(),
                origin: self.inner.origin,
                channel: channel.to_string(),
                published_at: Utc::now(),
                event,
            };
            self.remember_publish(envelope.publish_id);
            let subject = format!("{SUBJECT_PREFIX}{channel}");
            match serde_json::to_vec(&envelope) {
                Ok(payload) => {
                    if let Err(err) = broker.publish(subject, payload.into()).await {
                        warn!(channel, error = %err, "broker publish failed; local delivery only");
                    }
                }
                Err(err) => warn!(channel, error = %err, "failed to encode envelope"),
            }
        }
    }

    fn dispatch_local(&self, channel: &str, event: &serde_json::Value) {
        let table = self
            .inner
            .subscriptions
            .lock()
            .expect("subscription table poisoned");
        if let Some(entries) = table.get(channel) {
            for (_, queue) in entries {
                queue.push(event.clone());
                self.inner.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn remember_publish(&self, id: Uuid) {
        let mut recent = self
            .inner
            .recent_publishes
            .lock()
            .expect("dedup table poisoned");
        let now = Instant::now();
        recent.retain(|_, seen| now.duration_since(*seen) < DEDUP_TTL);
        recent.insert(id, now);
    }

    fn seen_recently(&self, id: Uuid) -> bool {
        let recent = self
            .inner
            .recent_publishes
            .lock()
            .expect("dedup table poisoned");
        recent
            .get(&id)
            .map(|seen| seen.elapsed() < DEDUP_TTL)
            .unwrap_or(false)
    }

    /// Whether a remote envelope should be dropped instead of delivered.
    fn suppress_remote(&self, envelope: &Envelope) -> bool {
        envelope.origin == self.inner.origin || self.seen_recently(envelope.publish_id)
    }

    /// Deliver a remote envelope to local subscribers, unless it is an echo.
    pub fn dispatch_remote(&self, envelope: Envelope) {
        if self.suppress_remote(&envelope) {
            debug!(channel = %envelope.channel, "suppressed echoed envelope");
            return;
        }
        self.remember_publish(envelope.publish_id);
        self.dispatch_local(&envelope.channel, &envelope.event);
    }

    fn spawn_bridge(&self) {
        let hub = self.clone();
        tokio::spawn(async move {
            let Some(broker) = hub.inner.broker.clone() else {
                return;
            };
            let subject = format!("{SUBJECT_PREFIX}>");
            let mut sub = match broker.subscribe(subject.clone()).await {
                Ok(sub) => sub,
                Err(err) => {
                    warn!(%subject, error = %err, "broker subscribe failed; cross-instance delivery disabled");
                    return;
                }
            };
            info!(%subject, "broker bridge running");
            while let Some(message) = sub.next().await {
                match serde_json::from_slice::<Envelope>(&message.payload) {
                    Ok(envelope) => hub.dispatch_remote(envelope),
                    Err(err) => warn!(error = %err, "dropping undecodable broker message"),
                }
            }
            warn!("broker bridge stream ended");
        });
    }

    /// Number of live subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .subscriptions
            .lock()
            .expect("subscription table poisoned")
            .get(channel)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn published_total(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_order_preserved() {
        let hub = Hub::local();
        let sub = hub.subscribe(CHANNEL_AUTHORITY);

        for i in 0..10 {
            hub.publish(CHANNEL_AUTHORITY, json!({ "seq": i })).await;
        }
        for i in 0..10 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_no_subscriber_drops_event() {
        let hub = Hub::local();
        hub.publish(CHANNEL_AUTHORITY, json!({ "lost": true })).await;

        // Subscribing afterwards sees nothing: at-most-once, no replay
        let sub = hub.subscribe(CHANNEL_AUTHORITY);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_channel_isolation() {
        let hub = Hub::local();
        let authority = hub.subscribe(CHANNEL_AUTHORITY);
        let tourist = hub.subscribe(&tourist_channel("t1"));

        hub.publish(&tourist_channel("t1"), json!({ "for": "t1" })).await;

        assert!(authority.try_recv().is_none());
        assert_eq!(tourist.try_recv().unwrap()["for"], "t1");
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_final() {
        let hub = Hub::local();
        let sub = hub.subscribe(CHANNEL_AUTHORITY);
        assert_eq!(hub.subscriber_count(CHANNEL_AUTHORITY), 1);

        hub.unsubscribe(&sub);
        hub.unsubscribe(&sub);
        assert_eq!(hub.subscriber_count(CHANNEL_AUTHORITY), 0);

        hub.publish(CHANNEL_AUTHORITY, json!({ "late": true })).await;
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_counts() {
        let hub = Hub::local();
        let sub = hub.subscribe(CHANNEL_AUTHORITY);

        for i in 0..(QUEUE_CAPACITY + 10) {
            hub.publish(CHANNEL_AUTHORITY, json!({ "seq": i })).await;
        }

        assert_eq!(sub.dropped(), 10);
        // The oldest 10 were evicted; the head of the queue is seq 10
        assert_eq!(sub.try_recv().unwrap()["seq"], 10);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let hub = Hub::local();
        let slow = hub.subscribe(CHANNEL_AUTHORITY);
        let fast = hub.subscribe(CHANNEL_AUTHORITY);

        for i in 0..(QUEUE_CAPACITY + 5) {
            hub.publish(CHANNEL_AUTHORITY, json!({ "seq": i })).await;
        }

        // The fast consumer still sees a full, in-order window even though
        // the slow one overflowed
        assert!(slow.dropped() > 0);
        assert_eq!(fast.dropped(), slow.dropped());
        assert_eq!(fast.try_recv().unwrap()["seq"], 5);
    }

    #[tokio::test]
    async fn test_remote_echo_suppressed() {
        let hub = Hub::local();
        let sub = hub.subscribe(CHANNEL_AUTHORITY);

        let own = Envelope {
            publish_id: Uuid::new_v4(),
            origin: hub.inner.origin,
            channel: CHANNEL_AUTHORITY.to_string(),
            published_at: Utc::now(),
            event: json!({ "echo": true }),
        };
        hub.dispatch_remote(own);
        assert!(sub.try_recv().is_none());

        let foreign = Envelope {
            publish_id: Uuid::new_v4(),
            origin: Uuid::new_v4(),
            channel: CHANNEL_AUTHORITY.to_string(),
            published_at: Utc::now(),
            event: json!({ "remote": true }),
        };
        hub.dispatch_remote(foreign.clone());
        assert_eq!(sub.try_recv().unwrap()["remote"], true);

        // Redelivery of the same publish id within the TTL is dropped
        hub.dispatch_remote(foreign);
        assert!(sub.try_recv().is_none());
    }
}
