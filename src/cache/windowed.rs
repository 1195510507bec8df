//! Capacity-bounded, recency-ordered cache with age-based purge
//!
//! `WindowedLru` holds `identity -> CacheEntry` for one distinct counter.
//! Ordering is by last observation, most recent first. That single invariant
//! buys two things at once: eviction past capacity discards the staleness
//! we care least about, and an age purge can walk from the old end and stop
//! at the first survivor.
//!
//! The structure is single-owner; the counter that owns it serialises access
//! behind its own mutex.

use lru::LruCache;
use std::num::NonZeroUsize;

/// Bookkeeping for one identity inside the window.
#[derive(PartialEq, Debug, Clone, Copy, Serialize)]
pub struct CacheEntry {
    /// Occurrences observed during this entry's residency. Always at least 1.
    pub count: u64,
    /// Timestamp of the first observation in this residency, epoch seconds.
    pub first: f64,
    /// Timestamp of the most recent observation. `first <= last` always.
    pub last: f64,
}

/// The bounded cache itself. See the module documentation.
pub struct WindowedLru {
    inner: LruCache<String, CacheEntry>,
}

impl WindowedLru {
    /// Create a `WindowedLru` holding at most `capacity` identities.
    pub fn new(capacity: usize) -> WindowedLru {
        let capacity = NonZeroUsize::new(capacity).expect("cache capacity must be non-zero");
        WindowedLru {
            inner: LruCache::new(capacity),
        }
    }

    /// Record an observation of `id` at time `now`.
    ///
    /// A resident identity has its count bumped, its `last` refreshed and is
    /// moved to the fresh end. A new identity enters as `{1, now, now}`; if
    /// that pushes the cache past capacity the least-recently-observed
    /// identity is evicted silently. A copy of the resulting entry is
    /// returned so the caller can reason about rates without holding any
    /// reference into the cache.
    pub fn add_or_update(&mut self, id: &str, now: f64) -> CacheEntry {
        if let Some(entry) = self.inner.get_mut(id) {
            entry.count += 1;
            entry.last = now;
            *entry
        } else {
            let entry = CacheEntry {
                count: 1,
                first: now,
                last: now,
            };
            self.inner.put(id.to_string(), entry);
            entry
        }
    }

    /// Drop every identity whose last observation is older than
    /// `now - window`, returning how many were dropped.
    ///
    /// The walk starts at the stale end and stops at the first entry inside
    /// the window, which is correct because ordering is by last observation.
    /// Cost is proportional to the number of expired entries, not the cache
    /// size.
    pub fn purge(&mut self, now: f64, window: f64) -> usize {
        let bound = now - window;
        let mut removed = 0;
        loop {
            let expired = match self.inner.peek_lru() {
                Some((_, entry)) => entry.last < bound,
                None => false,
            };
            if !expired {
                break;
            }
            self.inner.pop_lru();
            removed += 1;
        }
        removed
    }

    /// Number of identities currently resident.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when no identities are resident.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterate resident identities, most recently observed first.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &CacheEntry)> {
        self.inner.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::{QuickCheck, TestResult};
    use std::collections::HashMap;

    #[test]
    fn first_observation() {
        let mut lru = WindowedLru::new(16);
        let entry = lru.add_or_update("#1.2.3.4#UA", 10.0);
        assert_eq!(entry.count, 1);
        assert_eq!(entry.first, 10.0);
        assert_eq!(entry.last, 10.0);
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn repeat_observation_bumps_and_freshens() {
        let mut lru = WindowedLru::new(16);
        lru.add_or_update("id", 10.0);
        lru.add_or_update("id", 11.0);
        let entry = lru.add_or_update("id", 12.5);
        assert_eq!(entry.count, 3);
        assert_eq!(entry.first, 10.0);
        assert_eq!(entry.last, 12.5);
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn eviction_is_silent_and_by_recency() {
        let mut lru = WindowedLru::new(2);
        lru.add_or_update("a", 1.0);
        lru.add_or_update("b", 2.0);
        // touching a makes b the stale end
        lru.add_or_update("a", 3.0);
        lru.add_or_update("c", 4.0);
        assert_eq!(lru.len(), 2);
        let ids: Vec<&str> = lru.entries().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        // b re-enters as a fresh residency
        let entry = lru.add_or_update("b", 5.0);
        assert_eq!(entry.count, 1);
        assert_eq!(entry.first, 5.0);
    }

    #[test]
    fn purge_removes_only_expired() {
        let mut lru = WindowedLru::new(16);
        lru.add_or_update("a", 0.0);
        lru.add_or_update("b", 10.0);
        lru.add_or_update("c", 20.0);
        let removed = lru.purge(25.0, 10.0);
        assert_eq!(removed, 2);
        assert_eq!(lru.len(), 1);
        let ids: Vec<&str> = lru.entries().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[test]
    fn purge_short_circuits_at_first_survivor() {
        let mut lru = WindowedLru::new(16);
        lru.add_or_update("a", 0.0);
        lru.add_or_update("b", 20.0);
        lru.add_or_update("a", 21.0);
        // stale end is b@20; bound is 20.5 so b goes, then the walk stops at
        // a@21 without inspecting anything else
        let removed = lru.purge(30.5, 10.0);
        assert_eq!(removed, 1);
        let ids: Vec<&str> = lru.entries().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn purge_empty_is_a_noop() {
        let mut lru = WindowedLru::new(16);
        assert_eq!(lru.purge(100.0, 10.0), 0);
        assert!(lru.is_empty());
    }

    // For any sequence of observations over a small id space -- no
    // evictions possible -- each resident entry's count is exactly the
    // number of observations of its id, first/last bracket its observation
    // times and last carries the latest one.
    #[test]
    fn entry_bookkeeping_is_exact_without_eviction() {
        fn inner(steps: Vec<(u8, u16)>) -> TestResult {
            let mut lru = WindowedLru::new(16);
            let mut expected: HashMap<String, (u64, f64, f64)> = HashMap::new();
            let mut t = 0.0;
            for &(id, delta) in &steps {
                t += f64::from(delta) / 1000.0;
                let id = format!("id-{}", id % 8);
                let entry = lru.add_or_update(&id, t);
                let slot = expected.entry(id).or_insert((0, t, t));
                slot.0 += 1;
                slot.2 = t;
                assert_eq!(entry.count, slot.0);
                assert_eq!(entry.first, slot.1);
                assert_eq!(entry.last, slot.2);
                assert!(entry.first <= entry.last);
            }
            assert_eq!(lru.len(), expected.len());
            for (id, entry) in lru.entries() {
                let &(count, first, last) = expected.get(id).expect("unexpected resident id");
                assert_eq!(entry.count, count);
                assert_eq!(entry.first, first);
                assert_eq!(entry.last, last);
            }
            TestResult::passed()
        }
        QuickCheck::new()
            .tests(1000)
            .max_tests(10000)
            .quickcheck(inner as fn(Vec<(u8, u16)>) -> TestResult);
    }

    // Size never exceeds capacity no matter the id space.
    #[test]
    fn capacity_is_a_hard_bound() {
        fn inner(ids: Vec<u16>) -> TestResult {
            let mut lru = WindowedLru::new(4);
            for (i, id) in ids.iter().enumerate() {
                lru.add_or_update(&format!("id-{}", id), i as f64);
                if lru.len() > 4 {
                    return TestResult::failed();
                }
            }
            TestResult::passed()
        }
        QuickCheck::new()
            .tests(1000)
            .max_tests(10000)
            .quickcheck(inner as fn(Vec<u16>) -> TestResult);
    }

    // After purge(now, window) every survivor satisfies last >= now - window.
    #[test]
    fn purge_respects_the_bound() {
        fn inner(steps: Vec<(u8, u16)>, window_ms: u16) -> TestResult {
            let mut lru = WindowedLru::new(16);
            let mut t = 0.0;
            for &(id, delta) in &steps {
                t += f64::from(delta) / 1000.0;
                lru.add_or_update(&format!("id-{}", id % 8), t);
            }
            let window = f64::from(window_ms) / 1000.0;
            lru.purge(t, window);
            for (_, entry) in lru.entries() {
                if entry.last < t - window {
                    return TestResult::failed();
                }
            }
            TestResult::passed()
        }
        QuickCheck::new()
            .tests(1000)
            .max_tests(10000)
            .quickcheck(inner as fn(Vec<(u8, u16)>, u16) -> TestResult);
    }
}
