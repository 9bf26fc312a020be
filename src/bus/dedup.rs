//! Delivery deduplication
//!
//! Hosts sometimes deliver one logical message twice (directly and through the
//! broker). A receiving context remembers the unique ids it has dispatched and
//! absorbs repeats. Memory is bounded by entry count and by age; the oldest ids
//! are evicted first. The age horizon must exceed the longest delay between two
//! deliveries of the same message.

use crate::bus::envelope::UniqueId;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct SeenIdCache {
    capacity: usize,
    ttl: Duration,
    order: VecDeque<(Instant, UniqueId)>,
    seen: HashSet<UniqueId>,
}

impl SeenIdCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record `uid`. Returns true the first time it is seen, false for a repeat.
    pub fn check_and_record(&mut self, uid: &UniqueId) -> bool {
        self.check_and_record_at(uid, Instant::now())
    }

    fn check_and_record_at(&mut self, uid: &UniqueId, now: Instant) -> bool {
        self.evict_expired(now);
        if self.seen.contains(uid) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some((_, oldest)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back((now, uid.clone()));
        self.seen.insert(uid.clone());
        true
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((at, _)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.ttl {
                break;
            }
            if let Some((_, uid)) = self.order.pop_front() {
                self.seen.remove(&uid);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
