//! Per-topic-class token buckets.
//!
//! Each bucket is keyed by the pattern of the topic rule that matched, so
//! every topic under `sensors/+/data` shares one budget.  The burst equals the
//! per-minute quota.

use std::collections::HashMap;
use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

#[derive(Default)]
pub struct TopicRateLimiter {
    buckets: HashMap<String, (u32, DefaultDirectRateLimiter)>,
}

impl TopicRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one token from `bucket` if a limit applies.
    ///
    /// Returns `true` when the message may be sent now.  Buckets without a
    /// limit always allow.
    pub fn check(&mut self, bucket: &str, per_minute: Option<u32>) -> bool {
        let Some(limit) = per_minute.and_then(NonZeroU32::new) else {
            return true;
        };
        let stale = self
            .buckets
            .get(bucket)
            .is_some_and(|(current, _)| *current != limit.get());
        if stale || !self.buckets.contains_key(bucket) {
            let limiter = RateLimiter::direct(Quota::per_minute(limit));
            self.buckets.insert(bucket.to_string(), (limit.get(), limiter));
        }
        self.buckets
            .get(bucket)
            .is_none_or(|(_, limiter)| limiter.check().is_ok())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_buckets_always_allow() {
        let mut limiter = TopicRateLimiter::new();
        for _ in 0..10_000 {
            assert!(limiter.check("system/events/+", None));
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn burst_then_refuse() {
        let mut limiter = TopicRateLimiter::new();
        let allowed = (0..20).filter(|_| limiter.check("vision/#", Some(5))).count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn buckets_are_independent() {
        let mut limiter = TopicRateLimiter::new();
        assert!(limiter.check("a", Some(1)));
        assert!(!limiter.check("a", Some(1)));
        assert!(limiter.check("b", Some(1)));
    }
}
