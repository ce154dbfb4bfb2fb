//! In-memory keyspace for sorted sets
//!
//! This is the single-owner storage engine a shard runs. Every operation
//! resolves key liveness first: a key whose deadline has passed is treated as
//! absent and unlinked on the spot, so expiry is enforced lazily on access
//! and proactively through [`SortedSetStore::reap_expired`]. Unlinking a
//! large set hands the carcass to the drop pool; the key is gone from the
//! map either way before the triggering operation returns.

use bytes::Bytes;
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::reclaim::Teardown;

use super::expiry::ExpiryRegistry;
use super::value::Value;
use super::zset::{Applied, ScoreBound, SortedSet, UpdateMode};

/// Type alias for the keyspace map with SipHash hashing.
type KeyspaceMap = HashMap<Bytes, Value, BuildHasherDefault<SipHasher13>>;

/// Sorted-set keyspace with lazy expiry and deferred reclamation.
#[derive(Debug)]
pub struct SortedSetStore {
    /// The main keyspace
    entries: KeyspaceMap,

    /// Absolute deadlines, co-addressed with `entries` by key
    expiry: ExpiryRegistry,

    /// Where "now" comes from
    clock: Arc<dyn Clock>,

    /// Queue to the background drop pool, if one is attached
    teardown_tx: Option<mpsc::UnboundedSender<Teardown>>,

    /// Cardinality at or above which teardown is deferred
    async_del_threshold: usize,
}

/// Statistics about one store.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Keys in the map, including past-due keys not yet reaped
    pub keys: usize,

    /// Keys carrying a deadline
    pub tracked_expiries: usize,

    /// Approximate heap footprint of stored data
    pub used_memory_bytes: usize,
}

impl SortedSetStore {
    /// Create a store that frees everything inline (no drop pool).
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        SortedSetStore {
            entries: KeyspaceMap::default(),
            expiry: ExpiryRegistry::new(),
            clock,
            teardown_tx: None,
            async_del_threshold: usize::MAX,
        }
    }

    /// Create a store that defers teardown of sets with at least
    /// `async_del_threshold` members to the given queue.
    pub fn with_teardown(
        clock: Arc<dyn Clock>,
        teardown_tx: mpsc::UnboundedSender<Teardown>,
        async_del_threshold: usize,
    ) -> Self {
        SortedSetStore {
            entries: KeyspaceMap::default(),
            expiry: ExpiryRegistry::new(),
            clock,
            teardown_tx: Some(teardown_tx),
            async_del_threshold,
        }
    }

    // --- ZSET command surface ---

    /// ZADD. Returns the number of newly added members, or with `changed`
    /// the number of added-plus-repriced members (CH semantics).
    ///
    /// Scores are validated before anything is touched, so a batch with one
    /// bad score has no partial effect. An XX-only call against an absent
    /// key does not create it.
    pub fn zadd(
        &mut self,
        key: &Bytes,
        pairs: &[(Bytes, f64)],
        mode: UpdateMode,
        changed: bool,
    ) -> Result<i64, StoreError> {
        for (_, score) in pairs {
            if !score.is_finite() {
                return Err(StoreError::InvalidScore);
            }
        }

        self.expunge_if_expired(key);

        let mut added = 0i64;
        let mut touched = 0i64;
        let mut apply = |set: &mut SortedSet| -> Result<(), StoreError> {
            for (member, score) in pairs {
                match set.upsert(member.clone(), *score, mode)? {
                    Applied::Added => {
                        added += 1;
                        touched += 1;
                    }
                    Applied::Updated => touched += 1,
                    Applied::Unchanged | Applied::Rejected => {}
                }
            }
            Ok(())
        };

        match self.entries.get_mut(key) {
            Some(Value::SortedSet(set)) => apply(set)?,
            Some(_) => return Err(StoreError::WrongType),
            None => {
                let mut set = SortedSet::new();
                apply(&mut set)?;
                // Only an effective insert creates the key
                if !set.is_empty() {
                    self.entries.insert(key.clone(), Value::SortedSet(set));
                }
            }
        }

        Ok(if changed { touched } else { added })
    }

    /// ZCARD. Absent or expired keys count zero.
    pub fn zcard(&mut self, key: &Bytes) -> Result<usize, StoreError> {
        Ok(self.live_zset(key)?.map(SortedSet::len).unwrap_or(0))
    }

    /// ZSCORE.
    pub fn zscore(&mut self, key: &Bytes, member: &Bytes) -> Result<Option<f64>, StoreError> {
        Ok(self.live_zset(key)?.and_then(|set| set.score(member)))
    }

    /// ZINCRBY. Creates the key when the increment lands on an absent one.
    pub fn zincrby(&mut self, key: &Bytes, delta: f64, member: &Bytes) -> Result<f64, StoreError> {
        self.expunge_if_expired(key);

        match self.entries.get_mut(key) {
            Some(Value::SortedSet(set)) => set.increment(member.clone(), delta),
            Some(_) => Err(StoreError::WrongType),
            None => {
                let mut set = SortedSet::new();
                let score = set.increment(member.clone(), delta)?;
                self.entries.insert(key.clone(), Value::SortedSet(set));
                Ok(score)
            }
        }
    }

    /// ZREM. Returns the number of members actually removed.
    pub fn zrem(&mut self, key: &Bytes, members: &[Bytes]) -> Result<usize, StoreError> {
        let Some(set) = self.live_zset_mut(key)? else {
            return Ok(0);
        };

        let mut removed = 0;
        for member in members {
            if set.remove(member).is_some() {
                removed += 1;
            }
        }

        let emptied = set.is_empty();
        if emptied {
            self.discard_entry(key);
        }
        Ok(removed)
    }

    /// ZRANGE / ZREVRANGE by rank.
    pub fn zrange(
        &mut self,
        key: &Bytes,
        start: i64,
        stop: i64,
        reverse: bool,
    ) -> Result<Vec<(Bytes, f64)>, StoreError> {
        Ok(self
            .live_zset(key)?
            .map(|set| set.range_by_rank(start, stop, reverse))
            .unwrap_or_default())
    }

    /// ZRANGEBYSCORE / ZREVRANGEBYSCORE.
    pub fn zrange_by_score(
        &mut self,
        key: &Bytes,
        min: ScoreBound,
        max: ScoreBound,
        reverse: bool,
        offset: usize,
        count: Option<usize>,
    ) -> Result<Vec<(Bytes, f64)>, StoreError> {
        Ok(self
            .live_zset(key)?
            .map(|set| set.range_by_score(min, max, reverse, offset, count))
            .unwrap_or_default())
    }

    /// ZCOUNT.
    pub fn zcount(
        &mut self,
        key: &Bytes,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<usize, StoreError> {
        Ok(self
            .live_zset(key)?
            .map(|set| set.count_by_score(min, max))
            .unwrap_or(0))
    }

    /// ZRANK.
    pub fn zrank(&mut self, key: &Bytes, member: &Bytes) -> Result<Option<usize>, StoreError> {
        Ok(self.live_zset(key)?.and_then(|set| set.rank(member)))
    }

    /// ZREMRANGEBYRANK.
    pub fn zremrangebyrank(
        &mut self,
        key: &Bytes,
        start: i64,
        stop: i64,
    ) -> Result<usize, StoreError> {
        let Some(set) = self.live_zset_mut(key)? else {
            return Ok(0);
        };
        let removed = set.remove_by_rank_range(start, stop);
        let emptied = set.is_empty();
        if emptied {
            self.discard_entry(key);
        }
        Ok(removed)
    }

    /// ZREMRANGEBYSCORE.
    pub fn zremrangebyscore(
        &mut self,
        key: &Bytes,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<usize, StoreError> {
        let Some(set) = self.live_zset_mut(key)? else {
            return Ok(0);
        };
        let removed = set.remove_by_score_range(min, max);
        let emptied = set.is_empty();
        if emptied {
            self.discard_entry(key);
        }
        Ok(removed)
    }

    /// ZPOPMIN.
    pub fn zpopmin(&mut self, key: &Bytes, count: usize) -> Result<Vec<(Bytes, f64)>, StoreError> {
        self.pop(key, count, false)
    }

    /// ZPOPMAX.
    pub fn zpopmax(&mut self, key: &Bytes, count: usize) -> Result<Vec<(Bytes, f64)>, StoreError> {
        self.pop(key, count, true)
    }

    // --- Generic key commands ---

    /// Place a value into the keyspace directly, replacing whatever was
    /// there and clearing any deadline. This is the embedding layer's
    /// primitive; the ZSET surface never needs it.
    pub fn insert(&mut self, key: impl Into<Bytes>, value: Value) {
        let key = key.into();
        self.expiry.remove(&key);
        if let Some(old) = self.entries.insert(key.clone(), value) {
            self.dispose(key, old);
        }
    }

    /// DEL. Returns whether the key existed (an already-expired key counts
    /// as absent).
    pub fn del(&mut self, key: &Bytes) -> bool {
        self.expunge_if_expired(key);
        self.discard_entry(key)
    }

    /// EXISTS.
    pub fn exists(&mut self, key: &Bytes) -> bool {
        self.live_value(key).is_some()
    }

    /// TYPE tag: "zset", "string", or "none" for absent/expired keys.
    pub fn key_type(&mut self, key: &Bytes) -> &'static str {
        self.live_value(key).map(Value::type_name).unwrap_or("none")
    }

    /// PEXPIREAT: set an absolute deadline. Returns false when the key is
    /// absent or already expired, and records nothing in that case.
    pub fn expire_at(&mut self, key: &Bytes, at_ms: u64) -> bool {
        if self.live_value(key).is_none() {
            return false;
        }
        self.expiry.set_expire_at(key.clone(), at_ms);
        true
    }

    /// PTTL: remaining milliseconds, -1 for a live key without a deadline,
    /// -2 for an absent or expired key.
    pub fn ttl_millis(&mut self, key: &Bytes) -> i64 {
        if self.live_value(key).is_none() {
            return -2;
        }
        let now_ms = self.clock.now_ms();
        self.expiry.ttl_millis(key, now_ms).unwrap_or(-1)
    }

    /// PERSIST. Returns whether a deadline was cleared.
    pub fn persist(&mut self, key: &Bytes) -> bool {
        if self.live_value(key).is_none() {
            return false;
        }
        self.expiry.persist(key)
    }

    /// Proactive sweep: unlink every key whose deadline has passed. Returns
    /// the number of keys removed.
    pub fn reap_expired(&mut self) -> usize {
        let now_ms = self.clock.now_ms();
        let doomed = self.expiry.reap(now_ms);

        let mut removed = 0;
        for key in doomed {
            if self.discard_entry(&key) {
                removed += 1;
            }
        }
        removed
    }

    /// Number of keys in the map, including past-due keys not yet reaped.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no keys at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate heap footprint of stored data in bytes.
    pub fn memory_usage(&self) -> usize {
        self.entries
            .iter()
            .map(|(key, value)| key.len() + value.memory_usage())
            .sum()
    }

    /// Snapshot of store-level counters.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            keys: self.entries.len(),
            tracked_expiries: self.expiry.len(),
            used_memory_bytes: self.memory_usage(),
        }
    }

    // --- Internals ---

    /// Expire-on-access: if the key's deadline has passed, unlink it now so
    /// the current operation sees it as absent.
    fn expunge_if_expired(&mut self, key: &Bytes) {
        let now_ms = self.clock.now_ms();
        if self.expiry.is_expired(key, now_ms) {
            debug!(?key, "lazily expiring key");
            self.discard_entry(key);
        }
    }

    fn live_value(&mut self, key: &Bytes) -> Option<&Value> {
        self.expunge_if_expired(key);
        self.entries.get(key)
    }

    fn live_zset(&mut self, key: &Bytes) -> Result<Option<&SortedSet>, StoreError> {
        match self.live_value(key) {
            Some(Value::SortedSet(set)) => Ok(Some(set)),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(None),
        }
    }

    fn live_zset_mut(&mut self, key: &Bytes) -> Result<Option<&mut SortedSet>, StoreError> {
        self.expunge_if_expired(key);
        match self.entries.get_mut(key) {
            Some(Value::SortedSet(set)) => Ok(Some(set)),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(None),
        }
    }

    fn pop(
        &mut self,
        key: &Bytes,
        count: usize,
        from_max: bool,
    ) -> Result<Vec<(Bytes, f64)>, StoreError> {
        let Some(set) = self.live_zset_mut(key)? else {
            return Ok(Vec::new());
        };

        let popped = if from_max {
            set.pop_max(count)
        } else {
            set.pop_min(count)
        };

        let emptied = set.is_empty();
        if emptied {
            self.discard_entry(key);
        }
        Ok(popped)
    }

    /// Unlink a key's value and deadline together. The key is invisible to
    /// every subsequent operation as soon as this returns; freeing the value
    /// itself may happen on the drop pool.
    fn discard_entry(&mut self, key: &Bytes) -> bool {
        self.expiry.remove(key);
        match self.entries.remove(key) {
            Some(value) => {
                self.dispose(key.clone(), value);
                true
            }
            None => false,
        }
    }

    fn dispose(&mut self, key: Bytes, value: Value) {
        if let Some(teardown_tx) = &self.teardown_tx {
            if let Value::SortedSet(set) = &value {
                if set.len() >= self.async_del_threshold {
                    debug!(?key, members = set.len(), "deferring teardown to drop pool");
                    if let Err(send_error) = teardown_tx.send(Teardown { key, value }) {
                        // Pool already gone: free inline after all
                        drop(send_error.0);
                    }
                    return;
                }
            }
        }
        // Small values are freed on the spot
    }
}
