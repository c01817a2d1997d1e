//! Registry of per-(client, endpoint) token buckets.
//!
//! Lookups of existing clients touch only one shard of the map. Creating a
//! client takes the shared side of a creation gate and [`ClientRegistry::reset_all`]
//! takes the exclusive side, so a bucket built from a rate read before a
//! reset can never be inserted after it.

use crate::limits::LimitTable;
use crate::token_bucket::TokenBucket;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Opaque identity of one client on one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Build the key for `addr` calling `endpoint`.
    pub fn new(addr: IpAddr, endpoint: &str) -> Self {
        Self(format!("{addr}@{endpoint}"))
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Granted/denied counters for one client entry.
#[derive(Debug, Default)]
pub struct RequestCounters {
    granted: AtomicU64,
    denied: AtomicU64,
}

impl RequestCounters {
    /// Count one granted admission.
    pub fn record_granted(&self) {
        self.granted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one denied admission.
    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    /// Granted admissions so far.
    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }

    /// Denied admissions so far.
    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct ClientEntry {
    addr: IpAddr,
    endpoint: String,
    bucket: Arc<TokenBucket>,
    counters: Arc<RequestCounters>,
    last_seen: Instant,
}

impl ClientEntry {
    fn handle(&self) -> ClientHandle {
        ClientHandle { bucket: self.bucket.clone(), counters: self.counters.clone() }
    }
}

/// What a caller gets back from [`ClientRegistry::get_or_create`].
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// The client's bucket.
    pub bucket: Arc<TokenBucket>,
    /// The client's counters.
    pub counters: Arc<RequestCounters>,
}

/// Read-only view of one client entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStats {
    /// Client key.
    pub key: String,
    /// Client network address.
    pub address: IpAddr,
    /// Endpoint the entry is scoped to.
    pub endpoint: String,
    /// Rate the bucket was created with.
    pub rate: f64,
    /// Granted admissions since the entry was created.
    pub granted: u64,
    /// Denied admissions since the entry was created.
    pub denied: u64,
    /// Milliseconds since the entry was last used.
    pub idle_ms: u64,
}

/// Owns every client entry.
#[derive(Debug)]
pub struct ClientRegistry {
    limits: Arc<LimitTable>,
    entries: DashMap<ClientKey, ClientEntry>,
    creation: RwLock<()>,
}

impl ClientRegistry {
    /// Create an empty registry reading initial rates from `limits`.
    pub fn new(limits: Arc<LimitTable>) -> Self {
        Self { limits, entries: DashMap::new(), creation: RwLock::new(()) }
    }

    /// Look up the client's bucket, creating it at the endpoint's current rate
    /// if it does not exist yet.
    ///
    /// An existing bucket keeps the rate it was created with even if the
    /// endpoint's limit has since changed.
    pub fn get_or_create(&self, addr: IpAddr, endpoint: &str) -> ClientHandle {
        let key = ClientKey::new(addr, endpoint);
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.last_seen = now;
            return entry.handle();
        }

        let _gate = self.creation.read().unwrap_or_else(PoisonError::into_inner);
        let mut entry = self.entries.entry(key).or_insert_with(|| {
            let rate = self.limits.get_or_default(endpoint);
            ClientEntry {
                addr,
                endpoint: endpoint.to_string(),
                bucket: Arc::new(TokenBucket::per_second(rate)),
                counters: Arc::new(RequestCounters::default()),
                last_seen: now,
            }
        });
        entry.last_seen = now;
        entry.handle()
    }

    /// Remove every entry unused for longer than `ttl`. Returns how many went.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|key, entry| {
            if now.saturating_duration_since(entry.last_seen) > ttl {
                debug!(target: "floodgate::registry", client = %key, "evicting idle client");
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove every entry. Returns how many went.
    pub fn reset_all(&self) -> usize {
        let _gate = self.creation.write().unwrap_or_else(PoisonError::into_inner);
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    /// True if an entry exists for `addr` on `endpoint`.
    pub fn contains(&self, addr: IpAddr, endpoint: &str) -> bool {
        self.entries.contains_key(&ClientKey::new(addr, endpoint))
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no client is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stats for every tracked client, sorted by key.
    pub fn stats(&self) -> Vec<ClientStats> {
        let now = Instant::now();
        let mut stats: Vec<ClientStats> = self
            .entries
            .iter()
            .map(|r| {
                let entry = r.value();
                ClientStats {
                    key: r.key().to_string(),
                    address: entry.addr,
                    endpoint: entry.endpoint.clone(),
                    rate: entry.bucket.rate(),
                    granted: entry.counters.granted(),
                    denied: entry.counters.denied(),
                    idle_ms: u64::try_from(now.saturating_duration_since(entry.last_seen).as_millis())
                        .unwrap_or(u64::MAX),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }
}
