//! Bounded, priority-aware outbound queue.
//!
//! Messages wait here while the client is disconnected or while their topic
//! class is rate limited.  One FIFO lane per [`MessagePriority`]; the total
//! length across lanes never exceeds the capacity.
//!
//! Overflow policy when a message arrives at a full queue:
//!
//! 1. The oldest message of the lowest non-empty *droppable* lane
//!    (telemetry, then standard) is evicted, unless the newcomer is itself
//!    of lower priority than that victim, in which case the newcomer is
//!    rejected.
//! 2. With no droppable message queued, a droppable newcomer is rejected.
//! 3. Otherwise the oldest command message (or, with none queued, the oldest
//!    safety message) is evicted to make room.  The caller must raise an
//!    alert for every command/safety message lost this way.
//!
//! Sending drains the safety lane first and the telemetry lane last.  A topic
//! always maps to one priority, so per-topic publish order is preserved.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use fieldos_types::{Envelope, MessagePriority, QoS};
use tokio::time::Instant;

/// A message waiting to be sent.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub envelope: Envelope,
    pub qos: QoS,
    pub retain: bool,
    pub priority: MessagePriority,
    /// Rate-limit bucket (the pattern of the matching topic rule).
    pub bucket: String,
    pub rate_limit_per_minute: Option<u32>,
    pub enqueued_at: Instant,
}

/// Result of [`OutboundQueue::push`].
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting this older message.
    Evicted(QueuedMessage),
    /// The new message itself was not queued.
    Rejected(QueuedMessage),
}

#[derive(Debug)]
pub struct OutboundQueue {
    lanes: [VecDeque<QueuedMessage>; 4],
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Default::default(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Number of queued messages of `priority`.
    pub fn count(&self, priority: MessagePriority) -> usize {
        self.lanes[priority.index()].len()
    }

    /// Queue `msg`, applying the overflow policy when full.
    ///
    /// Eviction is by priority first and age second: a telemetry newcomer
    /// never displaces a standard message, however old, and is rejected when
    /// the queue holds no telemetry to evict.  Within the victim lane the
    /// oldest message goes.
    pub fn push(&mut self, msg: QueuedMessage) -> PushOutcome {
        if !self.is_full() {
            self.lanes[msg.priority.index()].push_back(msg);
            return PushOutcome::Queued;
        }

        let droppable_victim = [MessagePriority::Telemetry, MessagePriority::Standard]
            .into_iter()
            .find(|p| !self.lanes[p.index()].is_empty());

        let victim_lane = match droppable_victim {
            Some(lane) if msg.priority < lane => return PushOutcome::Rejected(msg),
            Some(lane) => lane,
            None if msg.priority.is_droppable() => return PushOutcome::Rejected(msg),
            None if !self.lanes[MessagePriority::Command.index()].is_empty() => MessagePriority::Command,
            None => MessagePriority::Safety,
        };

        match self.lanes[victim_lane.index()].pop_front() {
            Some(victim) => {
                self.lanes[msg.priority.index()].push_back(msg);
                PushOutcome::Evicted(victim)
            }
            None => PushOutcome::Rejected(msg),
        }
    }

    /// Put a message that failed to send back at the head of its lane.
    pub fn push_front(&mut self, msg: QueuedMessage) {
        self.lanes[msg.priority.index()].push_front(msg);
    }

    /// Remove the next message allowed to go out.
    ///
    /// Lanes are scanned from safety down to telemetry.  `allow` is asked at
    /// most once per bucket per call; once a bucket is refused, every later
    /// message in it is skipped too so per-topic order holds.  Refused
    /// buckets are appended to `blocked`.
    pub fn next_sendable(
        &mut self,
        mut allow: impl FnMut(&QueuedMessage) -> bool,
        blocked: &mut HashSet<String>,
    ) -> Option<QueuedMessage> {
        for lane in self.lanes.iter_mut().rev() {
            let mut found = None;
            for (i, msg) in lane.iter().enumerate() {
                if blocked.contains(&msg.bucket) {
                    continue;
                }
                if allow(msg) {
                    found = Some(i);
                    break;
                }
                blocked.insert(msg.bucket.clone());
            }
            if let Some(i) = found {
                return lane.remove(i);
            }
        }
        None
    }

    /// Drop droppable messages older than `ttl`, returning them.
    pub fn expire(&mut self, now: Instant, ttl: Duration) -> Vec<QueuedMessage> {
        let mut expired = Vec::new();
        for priority in [MessagePriority::Telemetry, MessagePriority::Standard] {
            let lane = &mut self.lanes[priority.index()];
            while lane
                .front()
                .is_some_and(|m| now.saturating_duration_since(m.enqueued_at) > ttl)
            {
                if let Some(msg) = lane.pop_front() {
                    expired.push(msg);
                }
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldos_types::{Payload, SystemEvent};

    fn msg(topic: &str, priority: MessagePriority) -> QueuedMessage {
        QueuedMessage {
            envelope: Envelope::new(
                topic,
                "test",
                Payload::Event(SystemEvent {
                    event_type: "t".into(),
                    message: topic.into(),
                    data: serde_json::Value::Null,
                }),
            ),
            qos: QoS::AtLeastOnce,
            retain: false,
            priority,
            bucket: topic.to_string(),
            rate_limit_per_minute: None,
            enqueued_at: Instant::now(),
        }
    }

    fn topic_of(m: &QueuedMessage) -> &str {
        &m.envelope.topic
    }

    #[test]
    fn evicts_oldest_low_priority_first() {
        let mut q = OutboundQueue::new(3);
        q.push(msg("t1", MessagePriority::Telemetry));
        q.push(msg("s1", MessagePriority::Standard));
        q.push(msg("c1", MessagePriority::Command));

        match q.push(msg("c2", MessagePriority::Command)) {
            PushOutcome::Evicted(v) => assert_eq!(topic_of(&v), "t1"),
            other => panic!("unexpected {other:?}"),
        }
        match q.push(msg("x1", MessagePriority::Safety)) {
            PushOutcome::Evicted(v) => assert_eq!(topic_of(&v), "s1"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn lower_priority_newcomer_is_rejected() {
        let mut q = OutboundQueue::new(2);
        q.push(msg("s1", MessagePriority::Standard));
        q.push(msg("s2", MessagePriority::Standard));
        assert!(matches!(
            q.push(msg("t1", MessagePriority::Telemetry)),
            PushOutcome::Rejected(_)
        ));
        assert_eq!(q.count(MessagePriority::Standard), 2);
    }

    #[test]
    fn telemetry_newcomer_only_displaces_telemetry() {
        let mut q = OutboundQueue::new(3);
        q.push(msg("s1", MessagePriority::Standard));
        q.push(msg("t1", MessagePriority::Telemetry));
        q.push(msg("s2", MessagePriority::Standard));

        // s1 is the oldest entry, but t1 is the one that goes.
        match q.push(msg("t2", MessagePriority::Telemetry)) {
            PushOutcome::Evicted(v) => assert_eq!(topic_of(&v), "t1"),
            other => panic!("unexpected {other:?}"),
        }
        match q.push(msg("t3", MessagePriority::Telemetry)) {
            PushOutcome::Evicted(v) => assert_eq!(topic_of(&v), "t2"),
            other => panic!("unexpected {other:?}"),
        }
        // A standard newcomer clears the telemetry lane before touching s1.
        match q.push(msg("s3", MessagePriority::Standard)) {
            PushOutcome::Evicted(v) => assert_eq!(topic_of(&v), "t3"),
            other => panic!("unexpected {other:?}"),
        }
        match q.push(msg("t4", MessagePriority::Telemetry)) {
            PushOutcome::Rejected(r) => assert_eq!(topic_of(&r), "t4"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(q.count(MessagePriority::Standard), 3);
        assert_eq!(q.count(MessagePriority::Telemetry), 0);
    }

    #[test]
    fn critical_overflow_evicts_oldest_command() {
        let mut q = OutboundQueue::new(2);
        q.push(msg("c1", MessagePriority::Command));
        q.push(msg("x1", MessagePriority::Safety));
        assert!(matches!(
            q.push(msg("t1", MessagePriority::Telemetry)),
            PushOutcome::Rejected(_)
        ));
        match q.push(msg("x2", MessagePriority::Safety)) {
            PushOutcome::Evicted(v) => assert_eq!(topic_of(&v), "c1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn drains_highest_priority_first_in_fifo_order() {
        let mut q = OutboundQueue::new(10);
        for (t, p) in [
            ("t1", MessagePriority::Telemetry),
            ("c1", MessagePriority::Command),
            ("x1", MessagePriority::Safety),
            ("c2", MessagePriority::Command),
        ] {
            q.push(msg(t, p));
        }
        let mut blocked = HashSet::new();
        let order: Vec<String> = std::iter::from_fn(|| q.next_sendable(|_| true, &mut blocked))
            .map(|m| m.envelope.topic)
            .collect();
        assert_eq!(order, vec!["x1", "c1", "c2", "t1"]);
    }

    #[test]
    fn blocked_bucket_is_skipped_without_reordering() {
        let mut q = OutboundQueue::new(10);
        let mut a1 = msg("a1", MessagePriority::Standard);
        a1.bucket = "a".into();
        let mut a2 = msg("a2", MessagePriority::Standard);
        a2.bucket = "a".into();
        q.push(a1);
        q.push(msg("b1", MessagePriority::Standard));
        q.push(a2);

        let mut blocked = HashSet::new();
        let mut asked = 0;
        let next = q.next_sendable(
            |m| {
                asked += 1;
                m.bucket != "a"
            },
            &mut blocked,
        );
        assert_eq!(next.map(|m| m.envelope.topic), Some("b1".to_string()));
        assert_eq!(asked, 2);
        assert!(blocked.contains("a"));
        assert!(q.next_sendable(|_| true, &mut blocked).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_only_droppable_lanes() {
        let mut q = OutboundQueue::new(10);
        q.push(msg("t1", MessagePriority::Telemetry));
        q.push(msg("c1", MessagePriority::Command));
        tokio::time::advance(Duration::from_secs(301)).await;
        q.push(msg("t2", MessagePriority::Telemetry));

        let expired = q.expire(Instant::now(), Duration::from_secs(300));
        assert_eq!(expired.len(), 1);
        assert_eq!(topic_of(&expired[0]), "t1");
        assert_eq!(q.len(), 2);
    }
}
