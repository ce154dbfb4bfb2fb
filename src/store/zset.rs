//! Sorted set storage (the per-key score index)
//!
//! Members are ordered by `(score, member)`: score ascending, ties broken by
//! byte-wise member comparison. A `BTreeSet` over that composite key gives
//! O(log n) updates and in-order traversal; a sibling `HashMap` gives O(1)
//! member -> score lookups so point queries never touch the tree.

use bytes::Bytes;
use ordered_float::OrderedFloat;
use siphasher::sip::SipHasher13;
use std::collections::{BTreeSet, HashMap};
use std::hash::BuildHasherDefault;
use std::ops::Bound;

use crate::error::StoreError;

/// Member -> score reverse index, hashed the same way as the keyspace.
type MemberMap = HashMap<Bytes, f64, BuildHasherDefault<SipHasher13>>;

/// Composite ordering key: score first, member bytes break ties.
type OrderKey = (OrderedFloat<f64>, Bytes);

/// Update policy for [`SortedSet::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    /// Insert new members and reprice existing ones.
    #[default]
    Always,

    /// NX: insert only; never touch an existing member.
    IfAbsent,

    /// XX: reprice only; never insert a new member.
    IfPresent,
}

/// What a single upsert actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new member was inserted.
    Added,

    /// An existing member moved to a different score.
    Updated,

    /// The member already had exactly this score.
    Unchanged,

    /// The update mode rejected the operation.
    Rejected,
}

/// One end of a score interval.
///
/// `NegInf`/`PosInf` are the "-inf"/"+inf" sentinels; `Excl` is the
/// exclusive "(1.5" form the dispatch layer decodes upstream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    /// No lower limit.
    NegInf,
    /// No upper limit.
    PosInf,
    /// Inclusive finite bound.
    Incl(f64),
    /// Exclusive finite bound.
    Excl(f64),
}

/// A set of unique members, each carrying a score, ordered by
/// `(score, member)`.
#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    by_score: BTreeSet<OrderKey>,
    by_member: MemberMap,
}

impl SortedSet {
    /// Create an empty sorted set.
    pub fn new() -> Self {
        SortedSet {
            by_score: BTreeSet::new(),
            by_member: MemberMap::default(),
        }
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.by_member.len()
    }

    /// Whether the set holds no members.
    pub fn is_empty(&self) -> bool {
        self.by_member.is_empty()
    }

    /// Current score of a member.
    pub fn score(&self, member: &Bytes) -> Option<f64> {
        self.by_member.get(member).copied()
    }

    /// Insert a member or move an existing one to a new score.
    ///
    /// Non-finite scores are rejected before anything is touched. The
    /// returned [`Applied`] lets callers report both added-count and
    /// changed-count (CH) semantics.
    pub fn upsert(
        &mut self,
        member: Bytes,
        score: f64,
        mode: UpdateMode,
    ) -> Result<Applied, StoreError> {
        if !score.is_finite() {
            return Err(StoreError::InvalidScore);
        }

        match self.by_member.get(&member).copied() {
            Some(old) => {
                if mode == UpdateMode::IfAbsent {
                    return Ok(Applied::Rejected);
                }
                if old == score {
                    return Ok(Applied::Unchanged);
                }

                // Reposition: the composite key changes with the score
                self.by_score.remove(&(OrderedFloat(old), member.clone()));
                self.by_score.insert((OrderedFloat(score), member.clone()));
                self.by_member.insert(member, score);
                Ok(Applied::Updated)
            }
            None => {
                if mode == UpdateMode::IfPresent {
                    return Ok(Applied::Rejected);
                }

                self.by_score.insert((OrderedFloat(score), member.clone()));
                self.by_member.insert(member, score);
                Ok(Applied::Added)
            }
        }
    }

    /// Remove a member, returning the score it held.
    pub fn remove(&mut self, member: &Bytes) -> Option<f64> {
        let score = self.by_member.remove(member)?;
        self.by_score.remove(&(OrderedFloat(score), member.clone()));
        Some(score)
    }

    /// Add `delta` to a member's score, treating an absent member as 0.
    ///
    /// Rejects a non-finite delta and a non-finite result (e.g. an increment
    /// that would produce NaN).
    pub fn increment(&mut self, member: Bytes, delta: f64) -> Result<f64, StoreError> {
        if !delta.is_finite() {
            return Err(StoreError::InvalidScore);
        }

        let base = self.by_member.get(&member).copied().unwrap_or(0.0);
        let next = base + delta;
        if !next.is_finite() {
            return Err(StoreError::InvalidScore);
        }

        self.upsert(member, next, UpdateMode::Always)?;
        Ok(next)
    }

    /// Zero-based position of a member in ascending `(score, member)` order.
    pub fn rank(&self, member: &Bytes) -> Option<usize> {
        let score = self.by_member.get(member)?;
        let key = (OrderedFloat(*score), member.clone());
        Some(self.by_score.range(..key).count())
    }

    /// Members in the inclusive rank interval `[start, stop]`.
    ///
    /// Negative indices count from the end (-1 is the last member). With
    /// `reverse`, ranks are taken over the descending order. Out-of-range or
    /// inverted intervals yield an empty vector, never an error.
    pub fn range_by_rank(&self, start: i64, stop: i64, reverse: bool) -> Vec<(Bytes, f64)> {
        let Some((start, stop)) = self.resolve_rank_range(start, stop) else {
            return Vec::new();
        };
        let take = stop - start + 1;

        if reverse {
            self.by_score
                .iter()
                .rev()
                .skip(start)
                .take(take)
                .map(Self::entry)
                .collect()
        } else {
            self.by_score
                .iter()
                .skip(start)
                .take(take)
                .map(Self::entry)
                .collect()
        }
    }

    /// Members whose score falls inside `[min, max]` (bound kinds per
    /// [`ScoreBound`]), with `offset`/`count` applied after the direction is
    /// fixed.
    pub fn range_by_score(
        &self,
        min: ScoreBound,
        max: ScoreBound,
        reverse: bool,
        offset: usize,
        count: Option<usize>,
    ) -> Vec<(Bytes, f64)> {
        let mut matched: Vec<(Bytes, f64)> =
            self.score_iter(min, max).map(Self::entry).collect();
        if reverse {
            matched.reverse();
        }
        matched
            .into_iter()
            .skip(offset)
            .take(count.unwrap_or(usize::MAX))
            .collect()
    }

    /// Number of members whose score falls inside `[min, max]`.
    pub fn count_by_score(&self, min: ScoreBound, max: ScoreBound) -> usize {
        self.score_iter(min, max).count()
    }

    /// Remove every member in the inclusive rank interval; returns the count
    /// removed.
    pub fn remove_by_rank_range(&mut self, start: i64, stop: i64) -> usize {
        let doomed: Vec<Bytes> = self
            .range_by_rank(start, stop, false)
            .into_iter()
            .map(|(member, _)| member)
            .collect();
        for member in &doomed {
            self.remove(member);
        }
        doomed.len()
    }

    /// Remove every member whose score falls inside `[min, max]`; returns the
    /// count removed.
    pub fn remove_by_score_range(&mut self, min: ScoreBound, max: ScoreBound) -> usize {
        let doomed: Vec<Bytes> = self
            .score_iter(min, max)
            .map(|(_, member)| member.clone())
            .collect();
        for member in &doomed {
            self.remove(member);
        }
        doomed.len()
    }

    /// Remove and return the `count` lowest-ranked entries.
    pub fn pop_min(&mut self, count: usize) -> Vec<(Bytes, f64)> {
        let popped: Vec<(Bytes, f64)> =
            self.by_score.iter().take(count).map(Self::entry).collect();
        for (member, _) in &popped {
            self.remove(member);
        }
        popped
    }

    /// Remove and return the `count` highest-ranked entries.
    pub fn pop_max(&mut self, count: usize) -> Vec<(Bytes, f64)> {
        let popped: Vec<(Bytes, f64)> = self
            .by_score
            .iter()
            .rev()
            .take(count)
            .map(Self::entry)
            .collect();
        for (member, _) in &popped {
            self.remove(member);
        }
        popped
    }

    /// Approximate heap footprint in bytes.
    ///
    /// Both indexes reference the member bytes; scores are stored twice.
    pub fn memory_usage(&self) -> usize {
        self.by_member
            .keys()
            .map(|member| 2 * (member.len() + std::mem::size_of::<f64>()))
            .sum()
    }

    fn entry((score, member): &OrderKey) -> (Bytes, f64) {
        (member.clone(), score.0)
    }

    /// Normalize an inclusive `[start, stop]` rank pair with negative-index
    /// support into concrete positions. `None` means the selection is empty.
    fn resolve_rank_range(&self, start: i64, stop: i64) -> Option<(usize, usize)> {
        let len = self.by_score.len() as i64;
        if len == 0 {
            return None;
        }

        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

        if start >= len || stop < 0 || start > stop {
            return None;
        }
        Some((start as usize, stop as usize))
    }

    /// In-order walk of the `[min, max]` score interval.
    ///
    /// Seeks the lower bound through the tree (the empty member is the
    /// smallest possible tie-break, so `Included((score, ""))` lands on the
    /// first entry at that score) and cuts off at the upper bound, keeping
    /// the walk at O(log n + k).
    fn score_iter(
        &self,
        min: ScoreBound,
        max: ScoreBound,
    ) -> impl Iterator<Item = &OrderKey> + '_ {
        let lower: Bound<OrderKey> = match min {
            ScoreBound::NegInf => Bound::Unbounded,
            ScoreBound::PosInf => Bound::Included((OrderedFloat(f64::INFINITY), Bytes::new())),
            ScoreBound::Incl(s) | ScoreBound::Excl(s) => {
                Bound::Included((OrderedFloat(s), Bytes::new()))
            }
        };

        self.by_score
            .range((lower, Bound::Unbounded))
            .skip_while(move |(s, _)| matches!(min, ScoreBound::Excl(m) if s.0 == m))
            .take_while(move |(s, _)| match max {
                ScoreBound::PosInf => true,
                ScoreBound::NegInf => false,
                ScoreBound::Incl(m) => s.0 <= m,
                ScoreBound::Excl(m) => s.0 < m,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn members(entries: &[(Bytes, f64)]) -> Vec<&str> {
        entries
            .iter()
            .map(|(m, _)| std::str::from_utf8(m).unwrap())
            .collect()
    }

    #[test]
    fn test_upsert_and_score() {
        let mut set = SortedSet::new();

        assert_eq!(
            set.upsert(b("a"), 1.0, UpdateMode::Always).unwrap(),
            Applied::Added
        );
        assert_eq!(set.score(&b("a")), Some(1.0));
        assert_eq!(set.len(), 1);

        // Same (member, score): cardinality unchanged, nothing repriced
        assert_eq!(
            set.upsert(b("a"), 1.0, UpdateMode::Always).unwrap(),
            Applied::Unchanged
        );
        assert_eq!(set.len(), 1);

        // New score moves the member
        assert_eq!(
            set.upsert(b("a"), 5.0, UpdateMode::Always).unwrap(),
            Applied::Updated
        );
        assert_eq!(set.score(&b("a")), Some(5.0));
    }

    #[test]
    fn test_upsert_nx_xx() {
        let mut set = SortedSet::new();

        // XX against an absent member does nothing
        assert_eq!(
            set.upsert(b("a"), 1.0, UpdateMode::IfPresent).unwrap(),
            Applied::Rejected
        );
        assert!(set.is_empty());

        set.upsert(b("a"), 1.0, UpdateMode::Always).unwrap();

        // NX never reprices an existing member
        assert_eq!(
            set.upsert(b("a"), 9.0, UpdateMode::IfAbsent).unwrap(),
            Applied::Rejected
        );
        assert_eq!(set.score(&b("a")), Some(1.0));

        // XX reprices it
        assert_eq!(
            set.upsert(b("a"), 3.0, UpdateMode::IfPresent).unwrap(),
            Applied::Updated
        );
        assert_eq!(set.score(&b("a")), Some(3.0));
    }

    #[test]
    fn test_upsert_rejects_non_finite_scores() {
        let mut set = SortedSet::new();
        assert_eq!(
            set.upsert(b("a"), f64::NAN, UpdateMode::Always),
            Err(StoreError::InvalidScore)
        );
        assert_eq!(
            set.upsert(b("a"), f64::INFINITY, UpdateMode::Always),
            Err(StoreError::InvalidScore)
        );
        assert!(set.is_empty());
    }

    #[test]
    fn test_equal_scores_order_by_member_bytes() {
        let mut set = SortedSet::new();
        set.upsert(b("banana"), 1.0, UpdateMode::Always).unwrap();
        set.upsert(b("apple"), 1.0, UpdateMode::Always).unwrap();
        set.upsert(b("cherry"), 1.0, UpdateMode::Always).unwrap();

        let ordered = set.range_by_rank(0, -1, false);
        assert_eq!(members(&ordered), vec!["apple", "banana", "cherry"]);

        // Ranks agree with the traversal
        assert_eq!(set.rank(&b("apple")), Some(0));
        assert_eq!(set.rank(&b("banana")), Some(1));
        assert_eq!(set.rank(&b("cherry")), Some(2));
    }

    #[test]
    fn test_rank() {
        let mut set = SortedSet::new();
        for i in 0..100 {
            set.upsert(b(&i.to_string()), i as f64, UpdateMode::Always)
                .unwrap();
        }
        for i in 0..100u32 {
            assert_eq!(set.rank(&b(&i.to_string())), Some(i as usize));
        }
        assert_eq!(set.rank(&b("missing")), None);
    }

    #[test]
    fn test_range_by_rank_negative_indices() {
        let mut set = SortedSet::new();
        for i in 0..10 {
            set.upsert(b(&format!("m{}", i)), i as f64, UpdateMode::Always)
                .unwrap();
        }

        let all = set.range_by_rank(0, -1, false);
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].0, b("m0"));
        assert_eq!(all[9].0, b("m9"));

        let tail = set.range_by_rank(-3, -1, false);
        assert_eq!(members(&tail), vec!["m7", "m8", "m9"]);

        let clamped = set.range_by_rank(5, 100, false);
        assert_eq!(members(&clamped), vec!["m5", "m6", "m7", "m8", "m9"]);
    }

    #[test]
    fn test_range_by_rank_inverted_is_empty() {
        let mut set = SortedSet::new();
        for i in 0..30 {
            set.upsert(b(&format!("m{:02}", i)), i as f64, UpdateMode::Always)
                .unwrap();
        }
        assert!(set.range_by_rank(20, 10, false).is_empty());
        assert!(set.range_by_rank(-1, -5, false).is_empty());
        assert!(set.range_by_rank(40, 50, false).is_empty());
        assert!(SortedSet::new().range_by_rank(0, -1, false).is_empty());
    }

    #[test]
    fn test_range_by_rank_reverse() {
        let mut set = SortedSet::new();
        for i in 0..10 {
            set.upsert(b(&format!("m{}", i)), i as f64, UpdateMode::Always)
                .unwrap();
        }

        let top = set.range_by_rank(0, 2, true);
        assert_eq!(members(&top), vec!["m9", "m8", "m7"]);

        // Full reverse mirrors the full forward traversal
        let mut reversed = set.range_by_rank(0, -1, true);
        reversed.reverse();
        assert_eq!(reversed, set.range_by_rank(0, -1, false));
    }

    #[test]
    fn test_range_by_score_bounds() {
        let mut set = SortedSet::new();
        for i in 0..10 {
            set.upsert(b(&format!("m{}", i)), i as f64, UpdateMode::Always)
                .unwrap();
        }

        let mid = set.range_by_score(
            ScoreBound::Incl(3.0),
            ScoreBound::Incl(5.0),
            false,
            0,
            None,
        );
        assert_eq!(members(&mid), vec!["m3", "m4", "m5"]);

        // Exclusive bounds trim both ends
        let open = set.range_by_score(
            ScoreBound::Excl(3.0),
            ScoreBound::Excl(5.0),
            false,
            0,
            None,
        );
        assert_eq!(members(&open), vec!["m4"]);

        let everything =
            set.range_by_score(ScoreBound::NegInf, ScoreBound::PosInf, false, 0, None);
        assert_eq!(everything.len(), 10);

        // Inverted interval selects nothing
        let none = set.range_by_score(
            ScoreBound::Incl(0.0),
            ScoreBound::Incl(-1.0),
            false,
            0,
            None,
        );
        assert!(none.is_empty());
    }

    #[test]
    fn test_range_by_score_exclusive_skips_all_ties() {
        let mut set = SortedSet::new();
        set.upsert(b("a"), 1.0, UpdateMode::Always).unwrap();
        set.upsert(b("b"), 1.0, UpdateMode::Always).unwrap();
        set.upsert(b("c"), 2.0, UpdateMode::Always).unwrap();

        let above = set.range_by_score(
            ScoreBound::Excl(1.0),
            ScoreBound::PosInf,
            false,
            0,
            None,
        );
        assert_eq!(members(&above), vec!["c"]);
    }

    #[test]
    fn test_range_by_score_reverse_and_limit() {
        let mut set = SortedSet::new();
        for i in 0..10 {
            set.upsert(b(&format!("m{}", i)), i as f64, UpdateMode::Always)
                .unwrap();
        }

        let rev = set.range_by_score(ScoreBound::NegInf, ScoreBound::PosInf, true, 0, None);
        assert_eq!(rev[0].0, b("m9"));
        assert_eq!(rev[9].0, b("m0"));

        // Offset/count apply after the direction is fixed
        let page = set.range_by_score(ScoreBound::NegInf, ScoreBound::PosInf, true, 2, Some(3));
        assert_eq!(members(&page), vec!["m7", "m6", "m5"]);
    }

    #[test]
    fn test_count_by_score() {
        let mut set = SortedSet::new();
        for i in 0..100 {
            set.upsert(b(&i.to_string()), i as f64, UpdateMode::Always)
                .unwrap();
        }
        assert_eq!(
            set.count_by_score(ScoreBound::Incl(50.0), ScoreBound::Incl(100.0)),
            50
        );
        assert_eq!(
            set.count_by_score(ScoreBound::NegInf, ScoreBound::PosInf),
            100
        );
    }

    #[test]
    fn test_remove() {
        let mut set = SortedSet::new();
        set.upsert(b("a"), 1.0, UpdateMode::Always).unwrap();
        set.upsert(b("z"), 2.0, UpdateMode::Always).unwrap();

        assert_eq!(set.remove(&b("a")), Some(1.0));
        assert_eq!(set.remove(&b("a")), None);
        assert_eq!(set.len(), 1);
        assert_eq!(set.rank(&b("z")), Some(0));
    }

    #[test]
    fn test_remove_by_rank_range() {
        let mut set = SortedSet::new();
        for i in 0..100 {
            set.upsert(b(&format!("m{:03}", i)), i as f64, UpdateMode::Always)
                .unwrap();
        }

        assert_eq!(set.remove_by_rank_range(21, 30), 10);
        assert_eq!(set.remove_by_rank_range(30, 21), 0);
        assert_eq!(set.remove_by_rank_range(0, -1), 90);
        assert!(set.is_empty());
    }

    #[test]
    fn test_remove_by_score_range() {
        let mut set = SortedSet::new();
        for i in 0..100 {
            set.upsert(b(&format!("m{:03}", i)), i as f64, UpdateMode::Always)
                .unwrap();
        }

        assert_eq!(
            set.remove_by_score_range(ScoreBound::Incl(21.0), ScoreBound::Incl(30.0)),
            10
        );
        assert_eq!(
            set.remove_by_score_range(ScoreBound::Incl(30.0), ScoreBound::Incl(21.0)),
            0
        );
        assert_eq!(set.len(), 90);
    }

    #[test]
    fn test_pop_min_max() {
        let mut set = SortedSet::new();
        set.upsert(b("low"), 1.0, UpdateMode::Always).unwrap();
        set.upsert(b("mid"), 2.0, UpdateMode::Always).unwrap();
        set.upsert(b("high"), 3.0, UpdateMode::Always).unwrap();

        assert_eq!(set.pop_min(1), vec![(b("low"), 1.0)]);
        assert_eq!(set.pop_max(1), vec![(b("high"), 3.0)]);
        assert_eq!(set.len(), 1);

        // Asking for more than remains drains the set without error
        assert_eq!(set.pop_min(10), vec![(b("mid"), 2.0)]);
        assert!(set.pop_max(1).is_empty());
    }

    #[test]
    fn test_increment() {
        let mut set = SortedSet::new();
        set.upsert(b("value1"), 3.0, UpdateMode::Always).unwrap();

        assert_eq!(set.increment(b("value1"), -1.2).unwrap(), 1.8);
        assert_eq!(set.score(&b("value1")), Some(1.8));

        // Absent member starts from zero
        assert_eq!(set.increment(b("fresh"), 1.5).unwrap(), 1.5);
        assert_eq!(set.score(&b("fresh")), Some(1.5));
    }

    #[test]
    fn test_increment_rejects_non_finite() {
        let mut set = SortedSet::new();
        assert_eq!(
            set.increment(b("a"), f64::NAN),
            Err(StoreError::InvalidScore)
        );
        assert_eq!(
            set.increment(b("a"), f64::INFINITY),
            Err(StoreError::InvalidScore)
        );

        // An overflowing result is rejected and leaves the score untouched
        set.upsert(b("big"), f64::MAX, UpdateMode::Always).unwrap();
        assert_eq!(
            set.increment(b("big"), f64::MAX),
            Err(StoreError::InvalidScore)
        );
        assert_eq!(set.score(&b("big")), Some(f64::MAX));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn populated(entries: &std::collections::HashMap<String, f64>) -> SortedSet {
            let mut set = SortedSet::new();
            for (member, score) in entries {
                set.upsert(b(member), *score, UpdateMode::Always).unwrap();
            }
            set
        }

        proptest! {
            #[test]
            fn rank_matches_full_traversal(
                entries in proptest::collection::hash_map("[a-z]{1,8}", -1000.0f64..1000.0, 0..64)
            ) {
                let set = populated(&entries);
                for (i, (member, _)) in set.range_by_rank(0, -1, false).iter().enumerate() {
                    prop_assert_eq!(set.rank(member), Some(i));
                }
            }

            #[test]
            fn reverse_traversal_is_mirrored(
                entries in proptest::collection::hash_map("[a-z]{1,8}", -1000.0f64..1000.0, 0..64)
            ) {
                let set = populated(&entries);
                let forward = set.range_by_rank(0, -1, false);
                let mut backward = set.range_by_rank(0, -1, true);
                backward.reverse();
                prop_assert_eq!(forward, backward);
            }

            #[test]
            fn scores_round_trip(
                entries in proptest::collection::hash_map("[a-z]{1,8}", -1000.0f64..1000.0, 0..64)
            ) {
                let set = populated(&entries);
                prop_assert_eq!(set.len(), entries.len());
                for (member, score) in &entries {
                    prop_assert_eq!(set.score(&b(member)), Some(*score));
                }
            }
        }
    }
}
