//! Per-endpoint rate limits.
//!
//! Absent endpoints imply the configured default. Once running, the only
//! mutation path besides the bulk loader is [`LimitTable::increase`], which is
//! an atomic read-then-clamped-write on a single key.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Result of an [`LimitTable::increase`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increase {
    /// Rate before the call (the default when the endpoint was absent).
    pub previous: u32,
    /// Rate after the call.
    pub current: u32,
}

impl Increase {
    /// True if the rate actually moved.
    pub fn changed(&self) -> bool {
        self.current != self.previous
    }
}

/// Concurrent endpoint → requests-per-second table.
#[derive(Debug)]
pub struct LimitTable {
    default_rps: u32,
    limits: DashMap<String, u32>,
}

impl LimitTable {
    /// Create an empty table whose absent entries mean `default_rps`.
    pub fn new(default_rps: u32) -> Self {
        Self { default_rps, limits: DashMap::new() }
    }

    /// The rate implied for endpoints without an entry.
    pub fn default_rps(&self) -> u32 {
        self.default_rps
    }

    /// Current rate for `endpoint`, if one has been recorded.
    pub fn get(&self, endpoint: &str) -> Option<u32> {
        self.limits.get(endpoint).map(|r| *r)
    }

    /// Current rate, recording the default first if the endpoint is new.
    ///
    /// Used on client creation so every endpoint that has seen traffic shows
    /// up in dumps and snapshots.
    pub fn get_or_default(&self, endpoint: &str) -> u32 {
        if let Some(rate) = self.limits.get(endpoint) {
            return *rate;
        }
        *self.limits.entry(endpoint.to_string()).or_insert(self.default_rps)
    }

    /// Overwrite the rate for `endpoint`.
    pub fn set(&self, endpoint: impl Into<String>, rate: u32) {
        self.limits.insert(endpoint.into(), rate);
    }

    /// Apply `entries` one at a time without clearing first.
    ///
    /// Endpoints not present in `entries` keep whatever they had.
    pub fn bulk_replace<I, K>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, u32)>,
        K: Into<String>,
    {
        for (endpoint, rate) in entries {
            self.set(endpoint, rate);
        }
    }

    /// Raise `endpoint` by `step`, never past `max_cap`.
    ///
    /// The read and the write happen under the same shard lock, so concurrent
    /// callers each see the other's result rather than compounding from a
    /// stale value. A rate already at or above `max_cap` is left alone.
    pub fn increase(&self, endpoint: &str, max_cap: u32, step: u32) -> Increase {
        match self.limits.entry(endpoint.to_string()) {
            Entry::Occupied(mut occupied) => {
                let previous = *occupied.get();
                let current = raised(previous, max_cap, step);
                if current != previous {
                    occupied.insert(current);
                }
                Increase { previous, current }
            }
            Entry::Vacant(vacant) => {
                let previous = self.default_rps;
                let current = raised(previous, max_cap, step);
                vacant.insert(current);
                Increase { previous, current }
            }
        }
    }

    /// Lower every rate above `max` to `max`. Returns how many entries moved.
    pub fn clamp_max(&self, max: u32) -> usize {
        let mut lowered = 0;
        for mut entry in self.limits.iter_mut() {
            if *entry.value() > max {
                *entry.value_mut() = max;
                lowered += 1;
            }
        }
        lowered
    }

    /// Remove every entry, returning all endpoints to the default.
    pub fn clear(&self) {
        self.limits.clear();
    }

    /// Number of endpoints with a recorded rate.
    pub fn len(&self) -> usize {
        self.limits.len()
    }

    /// True if no endpoint has a recorded rate.
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Point-in-time copy of every recorded rate, sorted by endpoint.
    pub fn snapshot(&self) -> BTreeMap<String, u32> {
        self.limits.iter().map(|r| (r.key().clone(), *r.value())).collect()
    }
}

fn raised(previous: u32, max_cap: u32, step: u32) -> u32 {
    if previous >= max_cap {
        previous
    } else {
        previous.saturating_add(step).min(max_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn absent_endpoint_has_no_entry_until_defaulted() {
        let table = LimitTable::new(5);
        assert_eq!(table.get("/a"), None);
        assert_eq!(table.get_or_default("/a"), 5);
        assert_eq!(table.get("/a"), Some(5));
    }

    #[test]
    fn increase_steps_and_clamps() {
        let table = LimitTable::new(5);
        table.set("/a", 13);
        assert_eq!(table.increase("/a", 15, 1), Increase { previous: 13, current: 14 });
        assert_eq!(table.increase("/a", 15, 4), Increase { previous: 14, current: 15 });
        let capped = table.increase("/a", 15, 4);
        assert!(!capped.changed());
        assert_eq!(table.get("/a"), Some(15));
    }

    #[test]
    fn increase_leaves_rates_above_cap_alone() {
        let table = LimitTable::new(5);
        table.set("/a", 40);
        assert!(!table.increase("/a", 15, 1).changed());
        assert_eq!(table.get("/a"), Some(40));
    }

    #[test]
    fn increase_starts_from_default_when_absent() {
        let table = LimitTable::new(5);
        assert_eq!(table.increase("/new", 15, 2), Increase { previous: 5, current: 7 });
    }

    #[test]
    fn clamp_max_lowers_only_rates_above() {
        let table = LimitTable::new(5);
        table.bulk_replace([("/a", 15u32), ("/b", 8), ("/c", 6)]);
        assert_eq!(table.clamp_max(8), 1);
        assert_eq!(table.snapshot(), BTreeMap::from([("/a".into(), 8), ("/b".into(), 8), ("/c".into(), 6)]));
        assert_eq!(table.clamp_max(8), 0);
    }

    #[test]
    fn bulk_replace_does_not_clear() {
        let table = LimitTable::new(5);
        table.set("/kept", 9);
        table.bulk_replace([("/a", 10u32), ("/b", 11u32)]);
        assert_eq!(table.get("/kept"), Some(9));
        assert_eq!(table.get("/a"), Some(10));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn concurrent_increases_never_exceed_cap() {
        let table = Arc::new(LimitTable::new(1));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let t = table.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        t.increase("/hot", 50, 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.get("/hot"), Some(50));
    }

    #[test]
    fn concurrent_increases_apply_each_step_once() {
        let table = Arc::new(LimitTable::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = table.clone();
                std::thread::spawn(move || t.increase("/e", u32::MAX, 1))
            })
            .collect();
        let mut observed: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap().current).collect();
        observed.sort_unstable();
        assert_eq!(observed, (1..=8).collect::<Vec<_>>(), "no two callers read the same previous value");
    }

    #[test]
    fn snapshot_is_sorted() {
        let table = LimitTable::new(5);
        table.set("/b", 2);
        table.set("/a", 1);
        let keys: Vec<_> = table.snapshot().into_keys().collect();
        assert_eq!(keys, vec!["/a".to_string(), "/b".to_string()]);
    }
}
