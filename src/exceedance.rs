//! Distinct denied clients per endpoint, for the current monitoring window.

use dashmap::DashMap;
use std::collections::HashSet;
use std::net::IpAddr;

/// Denials recorded for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exceedance {
    /// Endpoint the denials were for.
    pub endpoint: String,
    /// Distinct client addresses, sorted.
    pub addresses: Vec<IpAddr>,
}

impl Exceedance {
    /// Number of distinct addresses.
    pub fn count(&self) -> usize {
        self.addresses.len()
    }
}

/// Tracks which clients were denied, per endpoint.
///
/// Repeated denials of one address count once; the same address denied on two
/// endpoints counts once for each.
#[derive(Debug, Default)]
pub struct ExceedanceTracker {
    sets: DashMap<String, HashSet<IpAddr>>,
}

impl ExceedanceTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `addr` was denied on `endpoint`. Idempotent.
    pub fn record_exceed(&self, endpoint: &str, addr: IpAddr) {
        if let Some(mut set) = self.sets.get_mut(endpoint) {
            set.insert(addr);
            return;
        }
        self.sets.entry(endpoint.to_string()).or_default().insert(addr);
    }

    /// Distinct count and addresses for `endpoint`, without clearing.
    pub fn snapshot(&self, endpoint: &str) -> (usize, Vec<IpAddr>) {
        match self.sets.get(endpoint) {
            Some(set) => {
                let addresses = sorted(set.iter().copied());
                (addresses.len(), addresses)
            }
            None => (0, Vec::new()),
        }
    }

    /// Remove and return every non-empty set.
    ///
    /// Each endpoint is taken out atomically; a denial recorded while the
    /// drain is in progress lands either in the returned set or in a fresh
    /// one for the next window, never nowhere.
    pub fn drain(&self) -> Vec<Exceedance> {
        let endpoints: Vec<String> = self.sets.iter().map(|r| r.key().clone()).collect();
        let mut drained: Vec<Exceedance> = endpoints
            .into_iter()
            .filter_map(|endpoint| self.sets.remove(&endpoint))
            .filter(|(_, set)| !set.is_empty())
            .map(|(endpoint, set)| Exceedance { endpoint, addresses: sorted(set) })
            .collect();
        drained.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        drained
    }

    /// Forget every recorded denial.
    pub fn clear_all(&self) {
        self.sets.clear();
    }

    /// True if nothing has been recorded this window.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

fn sorted(addrs: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
    let mut v: Vec<IpAddr> = addrs.into_iter().collect();
    v.sort_unstable();
    v
}
