//! [`ServiceRegistry`] – heartbeat-based presence tracking.
//!
//! Every service's messaging client publishes a heartbeat on
//! `system/heartbeat/{service_id}`.  The registry remembers the latest one
//! per service and classifies the service as:
//!
//! | Presence | Condition |
//! |---|---|
//! | [`Presence::Live`] | a heartbeat arrived within `timeout_factor × interval` |
//! | [`Presence::Stale`] | silent for longer, but still within `stale_grace` |
//! | *(removed)* | silent past the grace period |
//!
//! Stale entries still resolve as dependencies so that a single lost
//! heartbeat does not make dependency resolution flap.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldos_middleware::{MessagingClient, topics};
use fieldos_types::{FieldError, Payload, ResourceUsage, ServiceState, ServiceStatus};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistryConfig {
    /// Expected heartbeat interval for services without their own.
    pub heartbeat_interval: Duration,
    /// Missed-interval multiple after which a service goes stale.
    pub timeout_factor: u32,
    /// How long a stale entry is kept before removal.
    pub stale_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            timeout_factor: 3,
            stale_grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Live,
    Stale,
}

/// What the registry knows about one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceEntry {
    pub service_id: String,
    pub service_type: Option<String>,
    /// State the service reported about itself.
    pub reported_state: ServiceState,
    pub metadata: BTreeMap<String, String>,
    pub resources: Option<ResourceUsage>,
    pub presence: Presence,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(skip)]
    pub last_seen: Instant,
    #[serde(skip)]
    stale_since: Option<Instant>,
}

/// Changes produced by [`ServiceRegistry::sweep`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub went_stale: Vec<String>,
    pub removed: Vec<String>,
}

pub struct ServiceRegistry {
    config: RegistryConfig,
    entries: RwLock<HashMap<String, ServiceEntry>>,
    intervals: RwLock<HashMap<String, Duration>>,
    changed: Notify,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            intervals: RwLock::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Declare the heartbeat interval a particular service uses.
    pub fn expect(&self, service_id: &str, interval: Duration) {
        write(&self.intervals).insert(service_id.to_string(), interval);
    }

    pub fn heartbeat_interval(&self, service_id: &str) -> Duration {
        read(&self.intervals)
            .get(service_id)
            .copied()
            .unwrap_or(self.config.heartbeat_interval)
    }

    /// Silence after which `service_id` is considered gone.
    pub fn heartbeat_timeout(&self, service_id: &str) -> Duration {
        self.heartbeat_interval(service_id) * self.config.timeout_factor.max(1)
    }

    /// Record a heartbeat.  Returns `true` when the service was not known.
    pub fn record_heartbeat(&self, status: &ServiceStatus, sent_at: DateTime<Utc>) -> bool {
        let now = Instant::now();
        let mut entries = write(&self.entries);
        let is_new = match entries.get_mut(&status.service_id) {
            Some(entry) => {
                if entry.presence == Presence::Stale {
                    info!(service = %status.service_id, "service live again");
                }
                entry.reported_state = status.state;
                entry.service_type = status.service_type.clone().or(entry.service_type.take());
                entry.metadata = status.metadata.clone();
                entry.resources = status.resources;
                entry.presence = Presence::Live;
                entry.last_heartbeat_at = sent_at;
                entry.last_seen = now;
                entry.stale_since = None;
                false
            }
            None => {
                info!(service = %status.service_id, state = %status.state, "service registered");
                entries.insert(
                    status.service_id.clone(),
                    ServiceEntry {
                        service_id: status.service_id.clone(),
                        service_type: status.service_type.clone(),
                        reported_state: status.state,
                        metadata: status.metadata.clone(),
                        resources: status.resources,
                        presence: Presence::Live,
                        last_heartbeat_at: sent_at,
                        last_seen: now,
                        stale_since: None,
                    },
                );
                true
            }
        };
        drop(entries);
        self.changed.notify_waiters();
        is_new
    }

    /// Age out silent services.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let timeouts: HashMap<String, Duration> = read(&self.entries)
            .keys()
            .map(|id| (id.clone(), self.heartbeat_timeout(id)))
            .collect();

        let mut entries = write(&self.entries);
        entries.retain(|id, entry| {
            let timeout = timeouts.get(id).copied().unwrap_or(self.config.heartbeat_interval * 3);
            if now.saturating_duration_since(entry.last_seen) <= timeout {
                return true;
            }
            match entry.stale_since {
                None => {
                    warn!(service = %id, ?timeout, "service went stale");
                    entry.presence = Presence::Stale;
                    entry.stale_since = Some(now);
                    report.went_stale.push(id.clone());
                    true
                }
                Some(since) if now.saturating_duration_since(since) > self.config.stale_grace => {
                    info!(service = %id, "stale service removed");
                    report.removed.push(id.clone());
                    false
                }
                Some(_) => true,
            }
        });
        report.went_stale.sort();
        report.removed.sort();
        report
    }

    pub fn lookup(&self, service_id: &str) -> Option<ServiceEntry> {
        read(&self.entries).get(service_id).cloned()
    }

    pub fn is_live(&self, service_id: &str) -> bool {
        read(&self.entries)
            .get(service_id)
            .is_some_and(|e| e.presence == Presence::Live)
    }

    /// Live and reporting `healthy` or `degraded`.
    pub fn is_ready(&self, service_id: &str) -> bool {
        read(&self.entries)
            .get(service_id)
            .is_some_and(|e| e.presence == Presence::Live && e.reported_state.is_ready())
    }

    /// Live services, optionally filtered by type, sorted by id.
    pub fn discover(&self, service_type: Option<&str>) -> Vec<ServiceEntry> {
        let mut found: Vec<ServiceEntry> = read(&self.entries)
            .values()
            .filter(|e| e.presence == Presence::Live)
            .filter(|e| service_type.is_none_or(|t| e.service_type.as_deref() == Some(t)))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        found
    }

    pub fn deregister(&self, service_id: &str) -> bool {
        let removed = write(&self.entries).remove(service_id).is_some();
        if removed {
            debug!(service = %service_id, "service deregistered");
            self.changed.notify_waiters();
        }
        removed
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until `service_id` is ready or `timeout` elapses.
    pub async fn wait_ready(&self, service_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_ready(service_id) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_ready(service_id);
            }
        }
    }

    /// Feed the registry from the heartbeat topic and sweep periodically.
    pub fn spawn_listener(
        self: &Arc<Self>,
        client: &MessagingClient,
        sweep_every: Duration,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, FieldError> {
        let mut heartbeats = client.subscribe(topics::HEARTBEAT_FILTER)?;
        let registry = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_every);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = heartbeats.recv() => match msg {
                        Some(env) => match env.payload {
                            Payload::Status(status) => {
                                registry.record_heartbeat(&status, env.timestamp);
                            }
                            other => debug!(topic = %env.topic, kind = other.kind(), "ignoring non-status heartbeat"),
                        },
                        None => break,
                    },
                    _ = sweep.tick() => {
                        registry.sweep(Instant::now());
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: &str, state: ServiceState, kind: Option<&str>) -> ServiceStatus {
        let mut s = ServiceStatus::new(id, state);
        s.service_type = kind.map(str::to_string);
        s
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(RegistryConfig {
            heartbeat_interval: Duration::from_secs(10),
            timeout_factor: 3,
            stale_grace: Duration::from_secs(20),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn live_then_stale_then_removed() {
        let reg = registry();
        assert!(reg.record_heartbeat(&status("gps", ServiceState::Healthy, None), Utc::now()));
        assert!(reg.is_ready("gps"));

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = reg.sweep(Instant::now());
        assert_eq!(report.went_stale, vec!["gps"]);
        assert!(!reg.is_live("gps"));
        assert!(reg.lookup("gps").is_some());
        assert!(reg.discover(None).is_empty());

        tokio::time::advance(Duration::from_secs(21)).await;
        let report = reg.sweep(Instant::now());
        assert_eq!(report.removed, vec!["gps"]);
        assert!(reg.lookup("gps").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_revives_stale_entry() {
        let reg = registry();
        reg.record_heartbeat(&status("imu", ServiceState::Healthy, None), Utc::now());
        tokio::time::advance(Duration::from_secs(40)).await;
        reg.sweep(Instant::now());
        assert!(!reg.is_live("imu"));

        assert!(!reg.record_heartbeat(&status("imu", ServiceState::Healthy, None), Utc::now()));
        assert!(reg.is_live("imu"));
        assert_eq!(reg.sweep(Instant::now()), SweepReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn per_service_interval_governs_timeout() {
        let reg = registry();
        reg.expect("slow", Duration::from_secs(60));
        reg.record_heartbeat(&status("slow", ServiceState::Healthy, None), Utc::now());
        reg.record_heartbeat(&status("fast", ServiceState::Healthy, None), Utc::now());

        tokio::time::advance(Duration::from_secs(100)).await;
        let report = reg.sweep(Instant::now());
        assert_eq!(report.went_stale, vec!["fast"]);
        assert_eq!(reg.heartbeat_timeout("slow"), Duration::from_secs(180));
    }

    #[test]
    fn discover_filters_by_type() {
        let reg = registry();
        reg.record_heartbeat(&status("cam_front", ServiceState::Healthy, Some("vision")), Utc::now());
        reg.record_heartbeat(&status("cam_rear", ServiceState::Starting, Some("vision")), Utc::now());
        reg.record_heartbeat(&status("gps", ServiceState::Healthy, Some("navigation")), Utc::now());

        let vision: Vec<String> = reg
            .discover(Some("vision"))
            .into_iter()
            .map(|e| e.service_id)
            .collect();
        assert_eq!(vision, vec!["cam_front", "cam_rear"]);
        assert_eq!(reg.discover(None).len(), 3);
        assert!(!reg.is_ready("cam_rear"));
    }

    #[tokio::test]
    async fn wait_ready_wakes_on_heartbeat() {
        let reg = Arc::new(registry());
        let waiter = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.wait_ready("comm", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        reg.record_heartbeat(&status("comm", ServiceState::Starting, None), Utc::now());
        reg.record_heartbeat(&status("comm", ServiceState::Healthy, None), Utc::now());
        assert!(waiter.await.unwrap_or(false));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_times_out() {
        let reg = registry();
        assert!(!reg.wait_ready("ghost", Duration::from_secs(3)).await);
    }
}
