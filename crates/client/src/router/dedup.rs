// Sliding window of recently delivered event keys.
//
// Bounded two ways: entries older than `ttl` are evicted on every check,
// and when `capacity` is exceeded the oldest entry goes first.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    ttl: Duration,
    seen: HashSet<String>,
    order: VecDeque<(Instant, String)>,
}

impl DedupWindow {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { capacity: capacity.max(1), ttl, seen: HashSet::new(), order: VecDeque::new() }
    }

    /// Record `key`. Returns false if it was already inside the window.
    pub fn insert(&mut self, key: String, now: Instant) -> bool {
        self.evict_expired(now);
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.order.push_back((now, key));
        while self.order.len() > self.capacity {
            if let Some((_, oldest)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((at, _)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.ttl {
                break;
            }
            if let Some((_, key)) = self.order.pop_front() {
                self.seen.remove(&key);
            }
        }
    }
}
