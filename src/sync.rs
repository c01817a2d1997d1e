//! Endpoint-limit synchronization with the external store.
//!
//! At startup the whole persisted record is fetched in one round trip and
//! parsed by a bounded pool of workers; a malformed entry is logged and
//! skipped without affecting the others. While running, the table is dumped
//! back on a fixed interval as one batched write. Consecutive dump failures
//! push the next attempt out with jittered exponential backoff.

use crate::backoff::SyncBackoff;
use crate::config::StoreSettings;
use crate::error::{MalformedPersistedValue, StoreError};
use crate::limits::LimitTable;
use crate::policy::PolicyHandle;
use crate::registry::ClientRegistry;
use crate::store::{Fields, LimitStore};
use crate::tasks::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Outcome of a bulk load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Entries written into the limit table.
    pub applied: usize,
    /// Entries skipped as malformed.
    pub skipped: usize,
}

/// Parse one persisted limit. Only positive integers are accepted.
pub fn parse_limit(endpoint: &str, raw: &str) -> Result<u32, MalformedPersistedValue> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|rate| *rate > 0)
        .ok_or_else(|| MalformedPersistedValue { endpoint: endpoint.to_string(), raw: raw.to_string() })
}

/// Loads and dumps the limit table against one store record.
#[derive(Debug)]
pub struct LimitSync {
    store: Arc<dyn LimitStore>,
    limits: Arc<LimitTable>,
    settings: StoreSettings,
    policy: Option<PolicyHandle>,
}

impl LimitSync {
    /// Sync `limits` with the record described by `settings`.
    pub fn new(store: Arc<dyn LimitStore>, limits: Arc<LimitTable>, settings: StoreSettings) -> Self {
        Self { store, limits, settings, policy: None }
    }

    /// Clamp loaded values into `[floor, ceiling]` of `policy`, read at load time.
    pub fn with_policy(mut self, policy: PolicyHandle) -> Self {
        self.policy = Some(policy);
        self
    }

    fn bounds(&self) -> Option<(u32, u32)> {
        self.policy.as_ref().map(|policy| {
            let floor = policy.floor_rps();
            (floor, policy.get().global_max_rps.max(floor))
        })
    }

    /// The store this sync writes to.
    pub fn store(&self) -> &Arc<dyn LimitStore> {
        &self.store
    }

    /// Store settings in effect.
    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Make sure the limits record exists so dumps have a target.
    pub async fn ensure_record(&self) -> Result<(), StoreError> {
        self.store.ensure_exists(&self.settings.limits_key).await
    }

    /// Fetch the persisted record and apply every well-formed entry.
    ///
    /// Entries are set one at a time; nothing is cleared first. Returns once
    /// every worker has finished.
    pub async fn load(&self) -> Result<LoadReport, StoreError> {
        let raw = self.store.bulk_read(&self.settings.limits_key).await?;
        let total = raw.len();
        let pool = Arc::new(Semaphore::new(self.settings.load_workers.max(1)));
        let bounds = self.bounds();
        let mut workers = JoinSet::new();

        for (endpoint, value) in raw {
            let Ok(permit) = pool.clone().acquire_owned().await else {
                break;
            };
            let limits = self.limits.clone();
            workers.spawn(async move {
                let _permit = permit;
                match parse_limit(&endpoint, &value) {
                    Ok(rate) => {
                        let applied = match bounds {
                            Some((floor, ceiling)) => rate.clamp(floor, ceiling),
                            None => rate,
                        };
                        if applied != rate {
                            debug!(
                                target: "floodgate::sync",
                                endpoint = %endpoint,
                                rate,
                                applied,
                                "clamped loaded limit"
                            );
                        }
                        limits.set(endpoint, applied);
                        true
                    }
                    Err(e) => {
                        warn!(target: "floodgate::sync", error = %e, "skipping persisted limit");
                        false
                    }
                }
            });
        }

        let mut report = LoadReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(true) => report.applied += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(target: "floodgate::sync", error = %e, "limit parse worker failed");
                    report.skipped += 1;
                }
            }
        }
        info!(
            target: "floodgate::sync",
            key = %self.settings.limits_key,
            total,
            applied = report.applied,
            skipped = report.skipped,
            "loaded endpoint limits"
        );
        Ok(report)
    }

    /// Write the whole table as one batched call. Returns how many entries were sent.
    ///
    /// An empty table writes nothing.
    pub async fn dump(&self) -> Result<usize, StoreError> {
        let fields: Fields =
            self.limits.snapshot().into_iter().map(|(endpoint, rate)| (endpoint, rate.to_string())).collect();
        if fields.is_empty() {
            return Ok(0);
        }
        let count = fields.len();
        self.store.bulk_write(&self.settings.limits_key, fields, self.settings.dump_ttl).await?;
        Ok(count)
    }

    /// Dump on every interval tick until shutdown.
    pub async fn run_dumps(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let interval = self.settings.dump_interval;
        let backoff = SyncBackoff::for_interval(interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        info!(target: "floodgate::sync", every = ?interval, key = %self.settings.limits_key, "dumping endpoint limits");

        let mut failures = 0usize;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }
            match self.dump().await {
                Ok(count) => {
                    if failures > 0 {
                        info!(target: "floodgate::sync", failures, "limit dump recovered");
                    }
                    failures = 0;
                    debug!(target: "floodgate::sync", count, "dumped endpoint limits");
                }
                Err(e) => {
                    failures += 1;
                    let delay = backoff.jittered(failures);
                    warn!(
                        target: "floodgate::sync",
                        error = %e,
                        failures,
                        delay = ?delay,
                        "failed to dump endpoint limits"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => break,
                    }
                }
            }
        }
    }
}

/// Clear every limit and client, then reload from the store if there is one.
///
/// Clients that arrive while the load is in flight are built at the default
/// rate, so the registry is reset again once the loaded limits are in place.
pub async fn reload(limits: &LimitTable, registry: &ClientRegistry, sync: Option<&LimitSync>) {
    limits.clear();
    let reset = registry.reset_all();
    info!(target: "floodgate::sync", reset, "cleared endpoint limits and clients");
    let Some(sync) = sync else {
        return;
    };
    match sync.load().await {
        Ok(_) => {
            let reset = registry.reset_all();
            debug!(target: "floodgate::sync", reset, "reset clients created during reload");
        }
        Err(e) => {
            warn!(target: "floodgate::sync", error = %e, "reload from store failed, running on defaults");
        }
    }
}

/// Run [`reload`] on every interval tick until shutdown.
pub async fn run_reloads(
    limits: Arc<LimitTable>,
    registry: Arc<ClientRegistry>,
    sync: Option<Arc<LimitSync>>,
    every: Duration,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait() => break,
        }
        reload(&limits, &registry, sync.as_deref()).await;
    }
}
