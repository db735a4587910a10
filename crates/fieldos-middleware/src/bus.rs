//! In-process broker core.
//!
//! [`MessageBus`] owns the broker's routing state: one session per connected
//! client, the compiled subscription trie and the retained-message store.
//! Both the WebSocket front end ([`BrokerServer`](crate::ws_server::BrokerServer))
//! and [`MemoryTransport`](crate::transport::MemoryTransport) drive it through
//! [`attach`](MessageBus::attach) / [`handle`](MessageBus::handle) /
//! [`detach`](MessageBus::detach).
//!
//! Every session gets its own bounded channel, so a slow subscriber never
//! blocks the others; when its channel is full the delivery is dropped for
//! that subscriber only and logged.
//!
//! Ordering: deliveries for one topic are pushed to each session in the order
//! the broker processed the publishes, and each client's publishes are
//! processed in the order they were sent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use fieldos_types::FieldError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::{Body, BrokerFrame, ClientFrame};
use crate::topics::{TopicTrie, topic_matches, validate_filter, validate_topic_name};

/// Default per-session channel capacity.
const DEFAULT_SESSION_CAPACITY: usize = 4096;

/// A message kept for late subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetainedMessage {
    pub topic: String,
    pub body: Body,
}

struct Session {
    generation: u64,
    tx: mpsc::Sender<BrokerFrame>,
    filters: HashSet<String>,
}

#[derive(Default)]
struct BusState {
    sessions: HashMap<String, Session>,
    subscriptions: TopicTrie<String>,
    retained: BTreeMap<String, Body>,
}

/// Shared broker core.  Wrap in an `Arc` and hand it to every front end.
pub struct MessageBus {
    state: Mutex<BusState>,
    session_capacity: usize,
    next_generation: AtomicU64,
    retained_version: AtomicU64,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_CAPACITY)
    }
}

impl MessageBus {
    pub fn new(session_capacity: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            session_capacity: session_capacity.max(1),
            next_generation: AtomicU64::new(1),
            retained_version: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        // A panic while routing leaves the maps consistent; keep serving.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Attach `client_id`, replacing any previous session with the same id.
    ///
    /// Returns the session generation and the receiver for deliveries.
    pub fn attach(&self, client_id: &str) -> (u64, mpsc::Receiver<BrokerFrame>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.session_capacity);
        let mut state = self.lock();
        if let Some(old) = state.sessions.remove(client_id) {
            debug!(client = client_id, "session taken over by new connection");
            Self::drop_filters(&mut state.subscriptions, client_id, &old.filters);
        }
        state.sessions.insert(
            client_id.to_string(),
            Session {
                generation,
                tx,
                filters: HashSet::new(),
            },
        );
        (generation, rx)
    }

    /// Detach `client_id` if `generation` is still its current session.
    pub fn detach(&self, client_id: &str, generation: u64) {
        let mut state = self.lock();
        let current = state
            .sessions
            .get(client_id)
            .is_some_and(|s| s.generation == generation);
        if current {
            if let Some(session) = state.sessions.remove(client_id) {
                Self::drop_filters(&mut state.subscriptions, client_id, &session.filters);
            }
        }
    }

    /// Drop every session.  Their delivery channels close.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        state.sessions.clear();
        state.subscriptions = TopicTrie::new();
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn drop_filters(trie: &mut TopicTrie<String>, client_id: &str, filters: &HashSet<String>) {
        for filter in filters {
            trie.remove_where(filter, |owner| owner == client_id);
        }
    }

    // -----------------------------------------------------------------------
    // Frame handling
    // -----------------------------------------------------------------------

    /// Apply one client frame on behalf of session (`client_id`, `generation`).
    ///
    /// Returns [`FieldError::Closed`] when the session has been replaced or
    /// dropped; the caller should stop pumping frames for it.
    pub fn handle(&self, client_id: &str, generation: u64, frame: ClientFrame) -> Result<(), FieldError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(session) = state.sessions.get_mut(client_id) else {
            return Err(FieldError::Closed);
        };
        if session.generation != generation {
            return Err(FieldError::Closed);
        }

        match frame {
            ClientFrame::Subscribe { filter } => {
                validate_filter(&filter)?;
                if session.filters.insert(filter.clone()) {
                    state.subscriptions.insert(&filter, client_id.to_string());
                }
                self.replay_retained(state, client_id, &filter);
                Ok(())
            }
            ClientFrame::Unsubscribe { filter } => {
                if session.filters.remove(&filter) {
                    state.subscriptions.remove_where(&filter, |owner| owner == client_id);
                }
                Ok(())
            }
            ClientFrame::Publish { topic, retain, body, .. } => {
                validate_topic_name(&topic)?;
                if retain {
                    state.retained.insert(topic.clone(), body.clone());
                    self.retained_version.fetch_add(1, Ordering::Relaxed);
                }
                Self::route(state, &topic, &body);
                Ok(())
            }
            ClientFrame::Ping => {
                let _ = session.tx.try_send(BrokerFrame::Pong);
                Ok(())
            }
            ClientFrame::Connect { .. } => Err(FieldError::SchemaValidation(
                "connect sent on an established session".into(),
            )),
        }
    }

    /// Publish from inside the broker process.
    pub fn publish(&self, topic: &str, body: Body, retain: bool) -> Result<usize, FieldError> {
        validate_topic_name(topic)?;
        let mut state = self.lock();
        if retain {
            state.retained.insert(topic.to_string(), body.clone());
            self.retained_version.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Self::route(&state, topic, &body))
    }

    fn route(state: &BusState, topic: &str, body: &Body) -> usize {
        let targets: HashSet<&String> = state.subscriptions.matches(topic).into_iter().collect();
        let mut delivered = 0;
        for client_id in targets {
            let Some(session) = state.sessions.get(client_id) else {
                continue;
            };
            let frame = BrokerFrame::Deliver {
                topic: topic.to_string(),
                retained: false,
                body: body.clone(),
            };
            match session.tx.try_send(frame) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = %client_id, topic, "subscriber channel full, delivery dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    fn replay_retained(&self, state: &BusState, client_id: &str, filter: &str) {
        let Some(session) = state.sessions.get(client_id) else {
            return;
        };
        for (topic, body) in state.retained.iter().filter(|(t, _)| topic_matches(filter, t)) {
            let frame = BrokerFrame::Deliver {
                topic: topic.clone(),
                retained: true,
                body: body.clone(),
            };
            if session.tx.try_send(frame).is_err() {
                warn!(client = client_id, topic = %topic, "could not replay retained message");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Retained store
    // -----------------------------------------------------------------------

    /// Incremented whenever the retained store changes.
    pub fn retained_version(&self) -> u64 {
        self.retained_version.load(Ordering::Relaxed)
    }

    pub fn retained(&self, topic: &str) -> Option<Body> {
        self.lock().retained.get(topic).cloned()
    }

    pub fn export_retained(&self) -> Vec<RetainedMessage> {
        self.lock()
            .retained
            .iter()
            .map(|(topic, body)| RetainedMessage {
                topic: topic.clone(),
                body: body.clone(),
            })
            .collect()
    }

    pub fn restore_retained(&self, messages: Vec<RetainedMessage>) {
        let mut state = self.lock();
        for msg in messages {
            state.retained.insert(msg.topic, msg.body);
        }
        self.retained_version.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(s: &str) -> Body {
        Body::Json(s.to_string())
    }

    fn publish(topic: &str, retain: bool, payload: &str) -> ClientFrame {
        ClientFrame::Publish {
            topic: topic.into(),
            qos: fieldos_types::QoS::AtLeastOnce,
            retain,
            body: body(payload),
        }
    }

    #[tokio::test]
    async fn routes_by_wildcard() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MessageBus::default();
        let (gen_a, mut rx_a) = bus.attach("a");
        let (gen_b, _rx_b) = bus.attach("b");

        bus.handle("a", gen_a, ClientFrame::Subscribe { filter: "sensors/+/data".into() })?;
        bus.handle("b", gen_b, publish("sensors/tof/data", false, "1"))?;
        bus.handle("b", gen_b, publish("sensors/tof/status", false, "2"))?;

        match rx_a.recv().await {
            Some(BrokerFrame::Deliver { topic, retained, body: b }) => {
                assert_eq!(topic, "sensors/tof/data");
                assert!(!retained);
                assert_eq!(b, body("1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx_a.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_filters_deliver_once() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MessageBus::default();
        let (g, mut rx) = bus.attach("a");
        bus.handle("a", g, ClientFrame::Subscribe { filter: "safety/#".into() })?;
        bus.handle("a", g, ClientFrame::Subscribe { filter: "safety/alerts/+".into() })?;
        assert_eq!(bus.publish("safety/alerts/fire", body("x"), false)?, 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn retained_replayed_to_late_subscriber() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MessageBus::default();
        bus.publish("system/health", body("old"), true)?;
        bus.publish("system/health", body("new"), true)?;

        let (g, mut rx) = bus.attach("late");
        bus.handle("late", g, ClientFrame::Subscribe { filter: "system/#".into() })?;
        match rx.recv().await {
            Some(BrokerFrame::Deliver { retained, body: b, .. }) => {
                assert!(retained);
                assert_eq!(b, body("new"));
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn takeover_invalidates_old_session() {
        let bus = MessageBus::default();
        let (old, mut old_rx) = bus.attach("svc");
        let (new, _new_rx) = bus.attach("svc");
        assert_ne!(old, new);
        assert!(matches!(
            bus.handle("svc", old, ClientFrame::Ping),
            Err(FieldError::Closed)
        ));
        // Old channel is closed once its sender is dropped.
        assert!(old_rx.recv().await.is_none());

        // Detaching with the stale generation leaves the new session alone.
        bus.detach("svc", old);
        assert_eq!(bus.session_count(), 1);
        bus.detach("svc", new);
        assert_eq!(bus.session_count(), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MessageBus::default();
        let (g, mut rx) = bus.attach("a");
        bus.handle("a", g, ClientFrame::Subscribe { filter: "x/y".into() })?;
        bus.handle("a", g, ClientFrame::Unsubscribe { filter: "x/y".into() })?;
        assert_eq!(bus.publish("x/y", body("1"), false)?, 0);
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn retained_export_restore() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MessageBus::default();
        bus.publish("power/battery", body("80"), true)?;
        let exported = bus.export_retained();

        let fresh = MessageBus::default();
        fresh.restore_retained(exported);
        assert_eq!(fresh.retained("power/battery"), Some(body("80")));
        Ok(())
    }
}
