//! The reliable publish/subscribe client.
//!
//! Every process holds one [`MessagingClient`] and passes it explicitly to
//! the components that need the bus.  The client owns a single event loop
//! task which is the only code touching the connection:
//!
//! ```text
//!  publish() ──► OutboundQueue ──┐
//!  subscribe() ─► control frames ┤            ┌─► inbound dispatch ─► Subscription channels
//!                                ├─► event ───┤
//!  heartbeat tick ───────────────┘    loop    └─► reconnect with backoff
//! ```
//!
//! # Guarantees
//!
//! * `publish` never blocks: the message is queued (or dropped per the queue
//!   overflow policy) and the call returns.  [`publish_wait`] suspends until
//!   there is room instead.
//! * While disconnected, messages accumulate in the bounded queue.  Dropping a
//!   low-priority message raises one alert per overflow episode plus a
//!   summary when the episode ends; every lost command/safety message raises
//!   its own critical alert.
//! * On reconnect, every active subscription is restored before the queue is
//!   flushed.
//! * Messages above the compression threshold are gzip-compressed on the
//!   wire; the frame says so, so receivers never guess.
//! * Rate-limited topic classes are deferred, not dropped.
//!
//! [`publish_wait`]: MessagingClient::publish_wait

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldos_types::{
    Alert, AlertKind, Envelope, FieldError, Payload, QoS, ResourceUsage, ServiceState,
    ServiceStatus, Severity,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::codec::{Body, BrokerFrame, ClientFrame, DEFAULT_COMPRESSION_THRESHOLD};
use crate::queue::{OutboundQueue, PushOutcome, QueuedMessage};
use crate::rate_limit::TopicRateLimiter;
use crate::topics::{self, TopicRegistry, TopicTrie, validate_filter, validate_topic_name};
use crate::transport::{Connection, Transport};

/// How often a rate-limited backlog is re-examined.
const RATE_LIMIT_POLL: Duration = Duration::from_millis(50);

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Periodic heartbeat emitted by the client on `system/heartbeat/{id}`.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub service_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Also used as the envelope `sender` and the heartbeat service id.
    pub client_id: String,
    pub queue_capacity: usize,
    pub compression_threshold: usize,
    /// Buffered envelopes per subscription before deliveries are dropped.
    pub subscription_capacity: usize,
    pub reconnect: Backoff,
    /// Low-priority messages older than this are discarded instead of sent.
    pub message_ttl: Duration,
    pub connect_timeout: Duration,
    pub heartbeat: Option<HeartbeatConfig>,
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            queue_capacity: 1000,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            subscription_capacity: 256,
            reconnect: Backoff::default(),
            message_ttl: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            heartbeat: None,
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration, service_type: Option<String>) -> Self {
        self.heartbeat = Some(HeartbeatConfig {
            interval,
            service_type,
        });
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stats
// ────────────────────────────────────────────────────────────────────────────

/// Counters exposed by [`MessagingClient::get_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub sent: u64,
    pub received: u64,
    /// Outbound messages lost to queue overflow.
    pub dropped: u64,
    pub dropped_critical: u64,
    pub reconnects: u64,
    /// Messages currently waiting in the outbound queue.
    pub queued: u64,
    /// Inbound messages that failed envelope validation.
    pub invalid: u64,
    /// Queued messages discarded for exceeding the TTL.
    pub expired: u64,
    /// Times a send was deferred by the rate limiter.
    pub rate_limited: u64,
    /// Inbound deliveries dropped because a subscriber was not keeping up.
    pub delivery_overflow: u64,
    pub connected: bool,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    dropped_critical: AtomicU64,
    reconnects: AtomicU64,
    invalid: AtomicU64,
    expired: AtomicU64,
    rate_limited: AtomicU64,
    delivery_overflow: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ────────────────────────────────────────────────────────────────────────────
// Subscriptions
// ────────────────────────────────────────────────────────────────────────────

/// Receiving end of one subscription.  Dropping it unsubscribes.
pub struct Subscription {
    filter: String,
    rx: mpsc::Receiver<Envelope>,
}

impl Subscription {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Next matching envelope, or `None` once the client is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Envelope>,
}

// ────────────────────────────────────────────────────────────────────────────
// Shared state
// ────────────────────────────────────────────────────────────────────────────

struct ClientState {
    queue: OutboundQueue,
    control: VecDeque<ClientFrame>,
    subscribers: TopicTrie<Subscriber>,
    /// Active filters and their subscriber count.
    filters: BTreeMap<String, usize>,
    next_subscriber: u64,
    last_timestamp: DateTime<Utc>,
    /// Low-priority drops in the current overflow episode.
    overflow: Option<u64>,
    /// Outlives sessions so a reconnect does not refill the buckets.
    limiter: TopicRateLimiter,
    heartbeat_state: ServiceState,
    heartbeat_resources: Option<ResourceUsage>,
    heartbeat_metadata: BTreeMap<String, String>,
}

struct Inner {
    config: ClientConfig,
    registry: Arc<TopicRegistry>,
    transport: Arc<dyn Transport>,
    state: Mutex<ClientState>,
    counters: Counters,
    /// Queue or control frames have work.
    wake: Notify,
    /// Queue space became available.
    space: Notify,
    connected: watch::Sender<bool>,
    alerts: broadcast::Sender<Alert>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Per-process messaging client.  Cheap to clone; clones share one
/// connection and one queue.
#[derive(Clone)]
pub struct MessagingClient {
    inner: Arc<Inner>,
}

impl MessagingClient {
    pub fn new(config: ClientConfig, registry: Arc<TopicRegistry>, transport: Arc<dyn Transport>) -> Self {
        let (connected, _) = watch::channel(false);
        let (alerts, _) = broadcast::channel(256);
        let state = ClientState {
            queue: OutboundQueue::new(config.queue_capacity),
            control: VecDeque::new(),
            subscribers: TopicTrie::new(),
            filters: BTreeMap::new(),
            next_subscriber: 1,
            last_timestamp: DateTime::<Utc>::MIN_UTC,
            overflow: None,
            limiter: TopicRateLimiter::new(),
            heartbeat_state: ServiceState::Healthy,
            heartbeat_resources: None,
            heartbeat_metadata: BTreeMap::new(),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                transport,
                state: Mutex::new(state),
                counters: Counters::default(),
                wake: Notify::new(),
                space: Notify::new(),
                connected,
                alerts,
                shutdown: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.inner.registry
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.inner.lock_state()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the event loop without waiting for a connection.
    ///
    /// Publishes issued before the first connection are queued.  Calling
    /// `start` again is a no-op.
    pub fn start(&self) {
        let mut task = self.inner.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() || self.inner.shutdown.is_cancelled() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(run(inner)));
    }

    /// Start the event loop and wait until the first session is established.
    ///
    /// On timeout the loop keeps retrying in the background; the error only
    /// tells the caller that the broker was not reachable in time.
    pub async fn connect(&self) -> Result<(), FieldError> {
        self.start();
        let mut rx = self.inner.connected.subscribe();
        match tokio::time::timeout(self.inner.config.connect_timeout, rx.wait_for(|c| *c)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(FieldError::Closed),
            Err(_) => Err(FieldError::Connection(format!(
                "no broker session via {} within {:?}",
                self.inner.transport.describe(),
                self.inner.config.connect_timeout
            ))),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Stop the event loop after a best-effort final flush.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // Close subscriber channels.
        let mut state = self.state();
        state.subscribers = TopicTrie::new();
        state.filters.clear();
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Queue `payload` for `topic`.  Never blocks.
    ///
    /// QoS defaults to the registry's recommendation.  Returns the message id,
    /// or [`FieldError::ResourceExhaustion`] when the queue rejected it.
    pub fn publish(&self, topic: &str, payload: Payload, qos: Option<QoS>) -> Result<String, FieldError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(FieldError::Closed);
        }
        validate_topic_name(topic)?;
        let rule = self.inner.registry.resolve_or_default(topic);
        let qos = qos.unwrap_or(rule.qos);

        let mut state = self.state();
        // Per-sender timestamps never go backwards.
        let timestamp = Utc::now().max(state.last_timestamp);
        state.last_timestamp = timestamp;

        let mut envelope = Envelope::new(topic, self.client_id(), payload).with_qos(qos);
        envelope.timestamp = timestamp;
        let id = envelope.id.clone();

        let msg = QueuedMessage {
            envelope,
            qos,
            retain: rule.retained,
            priority: rule.priority,
            bucket: rule.pattern,
            rate_limit_per_minute: rule.rate_limit_per_minute,
            enqueued_at: Instant::now(),
        };
        let outcome = state.queue.push(msg);
        let result = match outcome {
            PushOutcome::Queued => Ok(id),
            PushOutcome::Evicted(victim) => {
                self.inner.record_drop(&mut state, &victim);
                Ok(id)
            }
            PushOutcome::Rejected(rejected) => {
                self.inner.record_drop(&mut state, &rejected);
                Err(FieldError::ResourceExhaustion(format!(
                    "outbound queue full ({} messages), {} dropped",
                    state.queue.capacity(),
                    rejected.envelope.topic
                )))
            }
        };
        drop(state);
        self.inner.wake.notify_one();
        result
    }

    /// Like [`publish`](Self::publish) but suspends while the queue is full.
    pub async fn publish_wait(
        &self,
        topic: &str,
        payload: Payload,
        qos: Option<QoS>,
    ) -> Result<String, FieldError> {
        loop {
            let space = self.inner.space.notified();
            if !self.state().queue.is_full() {
                return self.publish(topic, payload, qos);
            }
            tokio::select! {
                _ = space => {}
                _ = self.inner.shutdown.cancelled() => return Err(FieldError::Closed),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Subscribing
    // -----------------------------------------------------------------------

    /// Subscribe to `filter`.  Envelopes arrive on the returned channel.
    pub fn subscribe(&self, filter: &str) -> Result<Subscription, FieldError> {
        validate_filter(filter)?;
        let (tx, rx) = mpsc::channel(self.inner.config.subscription_capacity.max(1));
        let mut state = self.state();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(filter, Subscriber { id, tx });
        let first = {
            let count = state.filters.entry(filter.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            state.control.push_back(ClientFrame::Subscribe {
                filter: filter.to_string(),
            });
        }
        drop(state);
        self.inner.wake.notify_one();
        debug!(client = %self.client_id(), filter, subscriber = id, "subscribed");
        Ok(Subscription {
            filter: filter.to_string(),
            rx,
        })
    }

    /// Subscribe and run `handler` for every envelope on a dedicated task.
    pub fn subscribe_with<F>(&self, filter: &str, mut handler: F) -> Result<JoinHandle<()>, FieldError>
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        let mut sub = self.subscribe(filter)?;
        Ok(tokio::spawn(async move {
            while let Some(envelope) = sub.recv().await {
                handler(envelope);
            }
        }))
    }

    /// Remove every subscription on exactly `filter`.
    pub fn unsubscribe(&self, filter: &str) {
        let mut state = self.state();
        state.subscribers.remove_where(filter, |_| true);
        if state.filters.remove(filter).is_some() {
            state.control.push_back(ClientFrame::Unsubscribe {
                filter: filter.to_string(),
            });
            drop(state);
            self.inner.wake.notify_one();
        }
    }

    // -----------------------------------------------------------------------
    // Heartbeat
    // -----------------------------------------------------------------------

    /// State reported in subsequent heartbeats.
    pub fn set_heartbeat_state(&self, state: ServiceState) {
        self.state().heartbeat_state = state;
    }

    pub fn set_heartbeat_resources(&self, resources: Option<ResourceUsage>) {
        self.state().heartbeat_resources = resources;
    }

    pub fn set_heartbeat_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state().heartbeat_metadata.insert(key.into(), value.into());
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn get_stats(&self) -> ClientStats {
        let c = &self.inner.counters;
        let queued = self.state().queue.len() as u64;
        ClientStats {
            sent: c.sent.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            dropped_critical: c.dropped_critical.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            queued,
            invalid: c.invalid.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            delivery_overflow: c.delivery_overflow.load(Ordering::Relaxed),
            connected: self.is_connected(),
        }
    }

    /// Local alerts raised by the client (queue overflow and the like).
    pub fn alerts(&self) -> broadcast::Receiver<Alert> {
        self.inner.alerts.subscribe()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Event loop
// ────────────────────────────────────────────────────────────────────────────

enum SessionEnd {
    Shutdown,
    Lost(String),
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn alert(&self, alert: Alert) {
        let _ = self.alerts.send(alert);
    }

    fn record_drop(&self, state: &mut ClientState, msg: &QueuedMessage) {
        bump(&self.counters.dropped);
        if msg.priority.is_droppable() {
            match state.overflow.as_mut() {
                Some(count) => *count += 1,
                None => {
                    state.overflow = Some(1);
                    warn!(client = %self.config.client_id, capacity = state.queue.capacity(),
                        "outbound queue full, dropping low-priority messages");
                    self.alert(
                        Alert::new(
                            Severity::Warning,
                            AlertKind::QueueOverflow,
                            self.config.client_id.clone(),
                            "outbound queue full; dropping oldest low-priority messages",
                        )
                        .with_data(json!({ "capacity": state.queue.capacity() })),
                    );
                }
            }
        } else {
            bump(&self.counters.dropped_critical);
            warn!(client = %self.config.client_id, topic = %msg.envelope.topic,
                "outbound queue full, dropped a {:?} message", msg.priority);
            self.alert(
                Alert::new(
                    Severity::Critical,
                    AlertKind::QueueOverflow,
                    self.config.client_id.clone(),
                    format!("dropped {:?} message on {}", msg.priority, msg.envelope.topic),
                )
                .with_data(json!({
                    "topic": msg.envelope.topic,
                    "message_id": msg.envelope.id,
                    "priority": msg.priority,
                })),
            );
        }
    }

    /// Close the current overflow episode, reporting how much was lost.
    fn finish_overflow_episode(self: &Arc<Self>) {
        let dropped = {
            let mut state = self.lock_state();
            state.overflow.take()
        };
        let Some(dropped) = dropped else {
            return;
        };
        info!(client = %self.config.client_id, dropped, "queue overflow episode ended");
        let alert = Alert::new(
            Severity::Warning,
            AlertKind::QueueOverflow,
            self.config.client_id.clone(),
            format!("{dropped} low-priority messages dropped while the queue was full"),
        )
        .with_data(json!({ "dropped": dropped }));
        self.alert(alert.clone());
        let client = MessagingClient {
            inner: Arc::clone(self),
        };
        if let Err(e) = client.publish(&topics::system_event("queue_overflow"), Payload::Alert(alert), None) {
            warn!(error = %e, "could not publish overflow summary");
        }
    }

    fn heartbeat_envelope_payload(&self, service_type: Option<String>) -> Payload {
        let state = self.lock_state();
        Payload::Status(ServiceStatus {
            service_id: self.config.client_id.clone(),
            state: state.heartbeat_state,
            service_type,
            metadata: state.heartbeat_metadata.clone(),
            resources: state.heartbeat_resources.clone(),
        })
    }

    /// Deliver one inbound envelope to every matching subscriber.
    fn dispatch(&self, topic: &str, body: &Body) {
        let envelope = match body.decode() {
            Ok(env) => env,
            Err(e) => {
                bump(&self.counters.invalid);
                warn!(client = %self.config.client_id, topic, error = %e, "dropping invalid envelope");
                return;
            }
        };
        bump(&self.counters.received);

        let mut state = self.lock_state();
        let mut closed = Vec::new();
        for sub in state.subscribers.matches(topic) {
            match sub.tx.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    bump(&self.counters.delivery_overflow);
                    warn!(client = %self.config.client_id, topic, subscriber = sub.id,
                        "subscriber not keeping up, delivery dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(sub.id),
            }
        }
        if !closed.is_empty() {
            self.prune_closed(&mut state, &closed);
        }
    }

    /// Forget dropped subscriptions, unsubscribing filters nobody uses.
    fn prune_closed(&self, state: &mut ClientState, ids: &[u64]) {
        let filters: Vec<String> = state.filters.keys().cloned().collect();
        for filter in filters {
            let removed = state.subscribers.remove_where(&filter, |s| ids.contains(&s.id));
            if removed == 0 {
                continue;
            }
            let remaining = state.filters.get(&filter).map_or(0, |n| n.saturating_sub(removed));
            if remaining == 0 {
                state.filters.remove(&filter);
                state.control.push_back(ClientFrame::Unsubscribe { filter });
            } else {
                state.filters.insert(filter, remaining);
            }
        }
    }
}

async fn run(inner: Arc<Inner>) {
    let mut attempt: u32 = 0;
    let mut ever_connected = false;
    let client_id = inner.config.client_id.clone();

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        let connect = tokio::time::timeout(
            inner.config.connect_timeout,
            inner.transport.connect(&client_id),
        );
        let result = tokio::select! {
            r = connect => r,
            _ = inner.shutdown.cancelled() => break,
        };

        let failure = match result {
            Ok(Ok(conn)) => {
                if ever_connected {
                    bump(&inner.counters.reconnects);
                }
                ever_connected = true;
                attempt = 0;
                info!(client = %client_id, endpoint = %inner.transport.describe(), "connected to broker");
                match session(&inner, conn).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost(reason) => reason,
                }
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connect timed out".to_string(),
        };

        inner.connected.send_replace(false);
        let delay = inner.config.reconnect.delay(attempt);
        attempt = attempt.saturating_add(1);
        warn!(client = %client_id, reason = %failure, retry_in = ?delay, "broker connection unavailable");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.cancelled() => break,
        }
    }

    inner.connected.send_replace(false);
    debug!(client = %client_id, "event loop stopped");
}

async fn session(inner: &Arc<Inner>, conn: Connection) -> SessionEnd {
    let Connection {
        outbound,
        mut inbound,
    } = conn;

    // Restore subscriptions before anything queued goes out.
    let filters: Vec<String> = {
        let mut state = inner.lock_state();
        state.control.clear();
        state.filters.keys().cloned().collect()
    };
    for filter in filters {
        if outbound.send(ClientFrame::Subscribe { filter }).await.is_err() {
            return SessionEnd::Lost("connection closed while restoring subscriptions".into());
        }
    }
    // The overflow summary goes out once the backlog has drained.
    inner.connected.send_replace(true);

    let mut heartbeat = inner.config.heartbeat.clone().map(|hb| {
        let mut tick = tokio::time::interval(hb.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        (tick, hb.service_type)
    });
    let mut retry = tokio::time::interval(RATE_LIMIT_POLL);
    retry.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let backlog = match flush(inner, &outbound).await {
            Ok(backlog) => backlog,
            Err(()) => return SessionEnd::Lost("send failed".into()),
        };

        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => {
                let _ = tokio::time::timeout(Duration::from_secs(1), flush(inner, &outbound)).await;
                return SessionEnd::Shutdown;
            }
            frame = inbound.recv() => match frame {
                Some(BrokerFrame::Deliver { topic, body, .. }) => inner.dispatch(&topic, &body),
                Some(BrokerFrame::Error { message }) => {
                    warn!(client = %inner.config.client_id, %message, "broker reported an error");
                }
                Some(BrokerFrame::ConnAck { .. }) | Some(BrokerFrame::Pong) => {}
                None => return SessionEnd::Lost("broker closed the session".into()),
            },
            _ = inner.wake.notified() => {}
            _ = async {
                match heartbeat.as_mut() {
                    Some((tick, _)) => { tick.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                let service_type = heartbeat.as_ref().and_then(|(_, t)| t.clone());
                let payload = inner.heartbeat_envelope_payload(service_type);
                let client = MessagingClient { inner: Arc::clone(inner) };
                let topic = topics::heartbeat(&inner.config.client_id);
                if let Err(e) = client.publish(&topic, payload, None) {
                    debug!(error = %e, "heartbeat not queued");
                }
            }
            _ = retry.tick(), if backlog => {}
        }
    }
}

/// Send control frames, then every queued message the rate limiter allows.
///
/// Returns whether a rate-limited backlog remains.  `Err` means the
/// connection is gone; the unsent message has been put back.
async fn flush(inner: &Arc<Inner>, outbound: &mpsc::Sender<ClientFrame>) -> Result<bool, ()> {
    loop {
        let control = inner.lock_state().control.pop_front();
        let Some(frame) = control else { break };
        if let Err(mpsc::error::SendError(frame)) = outbound.send(frame).await {
            inner.lock_state().control.push_front(frame);
            return Err(());
        }
    }

    loop {
        let next = {
            let mut guard = inner.lock_state();
            let state = &mut *guard;
            let expired = state.queue.expire(Instant::now(), inner.config.message_ttl);
            for msg in &expired {
                bump(&inner.counters.expired);
                debug!(topic = %msg.envelope.topic, "queued message expired");
            }
            let mut blocked = HashSet::new();
            let counters = &inner.counters;
            let next = state.queue.next_sendable(
                |m| {
                    let ok = state.limiter.check(&m.bucket, m.rate_limit_per_minute);
                    if !ok {
                        bump(&counters.rate_limited);
                    }
                    ok
                },
                &mut blocked,
            );
            match next {
                Some(msg) => msg,
                None => {
                    let backlog = !state.queue.is_empty();
                    drop(guard);
                    if !backlog {
                        inner.finish_overflow_episode();
                    }
                    return Ok(backlog);
                }
            }
        };

        let body = match Body::encode(&next.envelope, inner.config.compression_threshold) {
            Ok(body) => body,
            Err(e) => {
                bump(&inner.counters.invalid);
                warn!(topic = %next.envelope.topic, error = %e, "could not encode envelope");
                continue;
            }
        };
        let frame = ClientFrame::Publish {
            topic: next.envelope.topic.clone(),
            qos: next.qos,
            retain: next.retain,
            body,
        };
        if outbound.send(frame).await.is_err() {
            inner.lock_state().queue.push_front(next);
            return Err(());
        }
        bump(&inner.counters.sent);
        inner.space.notify_waiters();
    }
}
