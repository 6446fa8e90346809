//! Bounded in-memory history for stream consumers.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// Caps on how much history a buffer keeps. Both limits apply; whichever
/// bites first wins.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub max_entries: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::minutes(15),
            max_entries: 1000,
        }
    }
}

/// A time-stamped ring of values pruned by the retention policy on every
/// insert. Oldest entries go first.
pub struct HistoryBuffer<T> {
    entries: VecDeque<(DateTime<Utc>, T)>,
    policy: RetentionPolicy,
}

impl<T> HistoryBuffer<T> {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            policy,
        }
    }

    pub fn push(&mut self, value: T) {
        self.push_at(Utc::now(), value);
    }

    pub fn push_at(&mut self, at: DateTime<Utc>, value: T) {
        self.entries.push_back((at, value));
        self.prune(at);
    }

    /// Drop entries older than `max_age` relative to `now`, then enforce the
    /// entry cap.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.policy.max_age;
        let before = self.entries.len();
        while self.entries.front().is_some_and(|(at, _)| *at < cutoff) {
            self.entries.pop_front();
        }
        while self.entries.len() > self.policy.max_entries {
            self.entries.pop_front();
        }
        let dropped = before - self.entries.len();
        if dropped > 0 {
            tracing::trace!(dropped, retained = self.entries.len(), "history pruned");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(DateTime<Utc>, T)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        "2025-06-01T12:00:00Z".parse().unwrap()
    }

    fn policy(age_secs: i64, max_entries: usize) -> RetentionPolicy {
        RetentionPolicy {
            max_age: Duration::seconds(age_secs),
            max_entries,
        }
    }

    #[test]
    fn entry_cap_drops_oldest() {
        let mut buf = HistoryBuffer::new(policy(3600, 3));
        for i in 0..5u32 {
            buf.push_at(t0() + Duration::seconds(i as i64), i);
        }
        assert_eq!(buf.len(), 3);
        let kept: Vec<u32> = buf.iter().map(|(_, v)| *v).collect();
        assert_eq!(kept, vec![2, 3, 4]);
        assert_eq!(buf.latest(), Some(&4));
    }

    #[test]
    fn age_cutoff_drops_stale_entries() {
        let mut buf = HistoryBuffer::new(policy(60, 100));
        buf.push_at(t0(), "old");
        buf.push_at(t0() + Duration::seconds(30), "mid");
        buf.push_at(t0() + Duration::seconds(90), "new");
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.latest(), Some(&"new"));
    }

    #[test]
    fn explicit_prune_applies_age_at_later_time() {
        let mut buf = HistoryBuffer::new(policy(60, 100));
        buf.push_at(t0(), 1);
        buf.push_at(t0() + Duration::seconds(10), 2);
        assert_eq!(buf.len(), 2);
        buf.prune(t0() + Duration::seconds(120));
        assert!(buf.is_empty());
    }
}
