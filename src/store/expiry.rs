//! Expiry bookkeeping
//!
//! One absolute deadline per key, kept apart from the keyspace so TTL state
//! survives value updates and stays cheap to scan. The registry never touches
//! stored values: deciding what removal means is the store's job.

use bytes::Bytes;
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;

type DeadlineMap = HashMap<Bytes, u64, BuildHasherDefault<SipHasher13>>;

/// Per-key absolute expiry deadlines, in milliseconds since the Unix epoch.
#[derive(Debug, Default)]
pub struct ExpiryRegistry {
    deadlines: DeadlineMap,
}

impl ExpiryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        ExpiryRegistry {
            deadlines: DeadlineMap::default(),
        }
    }

    /// Set or replace the deadline for a key.
    pub fn set_expire_at(&mut self, key: Bytes, at_ms: u64) {
        self.deadlines.insert(key, at_ms);
    }

    /// Clear a key's deadline. Returns whether one existed.
    pub fn persist(&mut self, key: &Bytes) -> bool {
        self.deadlines.remove(key).is_some()
    }

    /// Drop bookkeeping for a deleted key.
    pub fn remove(&mut self, key: &Bytes) {
        self.deadlines.remove(key);
    }

    /// The key's deadline, if one is set.
    pub fn deadline(&self, key: &Bytes) -> Option<u64> {
        self.deadlines.get(key).copied()
    }

    /// Whether the key's deadline has passed. Keys without a deadline never
    /// expire; a deadline equal to `now_ms` counts as expired.
    pub fn is_expired(&self, key: &Bytes, now_ms: u64) -> bool {
        match self.deadlines.get(key) {
            Some(&at_ms) => now_ms >= at_ms,
            None => false,
        }
    }

    /// Remaining lifetime of a tracked key, `None` when no deadline is set.
    pub fn ttl_millis(&self, key: &Bytes, now_ms: u64) -> Option<i64> {
        self.deadlines
            .get(key)
            .map(|&at_ms| at_ms.saturating_sub(now_ms) as i64)
    }

    /// Collect every key whose deadline has passed. Scan only: removing the
    /// underlying storage is the caller's responsibility.
    pub fn reap(&self, now_ms: u64) -> Vec<Bytes> {
        self.deadlines
            .iter()
            .filter(|&(_, &at_ms)| now_ms >= at_ms)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of keys with an active deadline.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Whether any key has a deadline.
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
