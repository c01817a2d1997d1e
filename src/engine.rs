//! The admission façade.
//!
//! [`AdmissionEngine`] wires the limit table, client registry, exceedance
//! tracker and controller together and answers one question per request:
//! may this client call this endpoint now?
//!
//! ```rust
//! use floodgate::{Admission, AdmissionEngine, Settings};
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (engine, tasks) = AdmissionEngine::builder(Settings::default()).start().await;
//! let client = IpAddr::V4(Ipv4Addr::LOCALHOST);
//! assert_eq!(engine.admit(client, "/orders").await, Admission::Allow);
//! tasks.shutdown().await;
//! # }
//! ```

use crate::config::Settings;
use crate::controller::AdaptiveController;
use crate::eviction::run_eviction;
use crate::exceedance::ExceedanceTracker;
use crate::limits::LimitTable;
use crate::policy::{AdaptivePolicy, PolicyHandle};
use crate::registry::ClientRegistry;
use crate::snapshot::EngineSnapshot;
use crate::store::LimitStore;
use crate::sync::{run_reloads, LimitSync};
use crate::tasks::BackgroundTasks;
use crate::token_bucket::Acquire;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Admission {
    /// Forward the request.
    Allow,
    /// Reject the request.
    Deny,
}

impl Admission {
    /// True for [`Admission::Allow`].
    pub fn is_allowed(self) -> bool {
        matches!(self, Admission::Allow)
    }
}

/// Per-client, per-endpoint admission control.
///
/// Cloning is cheap; every clone shares the same state.
#[derive(Debug, Clone)]
pub struct AdmissionEngine {
    settings: Arc<Settings>,
    limits: Arc<LimitTable>,
    registry: Arc<ClientRegistry>,
    tracker: Arc<ExceedanceTracker>,
    policy: Option<PolicyHandle>,
    sync: Option<Arc<LimitSync>>,
}

impl AdmissionEngine {
    /// Memory-only engine with no background tasks.
    ///
    /// Idle clients are never evicted and limits never adapt unless the caller
    /// drives them; use [`AdmissionEngine::builder`] for a running engine.
    pub fn new(settings: Settings) -> Self {
        let limits = Arc::new(LimitTable::new(settings.default_rps));
        let registry = Arc::new(ClientRegistry::new(limits.clone()));
        let policy = settings.adaptive.map(|adaptive| {
            let policy = PolicyHandle::new(
                AdaptivePolicy {
                    ip_threshold: adaptive.ip_threshold,
                    increase_step: adaptive.increase_step,
                    global_max_rps: settings.global_max_rps,
                },
                settings.default_rps,
            );
            let (limits, registry) = (limits.clone(), registry.clone());
            policy.on_ceiling_lowered(move |max| {
                let lowered = limits.clamp_max(max);
                if lowered > 0 {
                    let reset = registry.reset_all();
                    info!(
                        target: "floodgate::engine",
                        max,
                        lowered,
                        reset,
                        "ceiling lowered, clamped endpoint limits"
                    );
                }
            });
            policy
        });
        Self {
            settings: Arc::new(settings),
            limits,
            registry,
            tracker: Arc::new(ExceedanceTracker::new()),
            policy,
            sync: None,
        }
    }

    /// Start configuring a running engine.
    pub fn builder(settings: Settings) -> EngineBuilder {
        EngineBuilder { settings, store: None }
    }

    /// Decide whether `addr` may call `endpoint` now.
    ///
    /// Waits at most the configured `max_wait` for the client's bucket to
    /// refill. A denial is recorded for the adaptive controller when adaptive
    /// mode is on.
    pub async fn admit(&self, addr: IpAddr, endpoint: &str) -> Admission {
        let client = self.registry.get_or_create(addr, endpoint);
        match client.bucket.acquire_within(self.settings.max_wait).await {
            Acquire::Granted => {
                client.counters.record_granted();
                Admission::Allow
            }
            Acquire::TimedOut => {
                client.counters.record_denied();
                if self.policy.is_some() {
                    self.tracker.record_exceed(endpoint, addr);
                }
                trace!(target: "floodgate::engine", client = %addr, endpoint, "denied");
                Admission::Deny
            }
        }
    }

    /// Current limit for `endpoint`, without recording the default.
    pub fn limit(&self, endpoint: &str) -> u32 {
        self.limits.get(endpoint).unwrap_or(self.limits.default_rps())
    }

    /// The shared limit table.
    pub fn limits(&self) -> &Arc<LimitTable> {
        &self.limits
    }

    /// The shared client registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// The shared exceedance tracker.
    pub fn tracker(&self) -> &Arc<ExceedanceTracker> {
        &self.tracker
    }

    /// Live adaptive policy, if adaptive mode is on.
    pub fn policy(&self) -> Option<&PolicyHandle> {
        self.policy.as_ref()
    }

    /// Resolved settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// True when limits are not synced with an external store.
    pub fn is_memory_only(&self) -> bool {
        self.sync.is_none()
    }

    /// A controller over this engine's state, if adaptive mode is on.
    pub fn controller(&self) -> Option<AdaptiveController> {
        let policy = self.policy.clone()?;
        let controller =
            AdaptiveController::new(self.limits.clone(), self.registry.clone(), self.tracker.clone(), policy);
        Some(match (&self.sync, self.settings.store.as_ref()) {
            (Some(sync), Some(store)) if store.audit => {
                controller.with_audit(sync.store().clone(), store.log_key_prefix.clone())
            }
            _ => controller,
        })
    }

    /// Snapshot limits, policy and per-client counters.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            default_rps: self.limits.default_rps(),
            memory_only: self.is_memory_only(),
            adaptive: self.policy.as_ref().map(PolicyHandle::get),
            limits: self.limits.snapshot(),
            clients: self.registry.stats(),
        }
    }

    /// Forget every adapted limit, client and pending denial.
    pub fn reset_to_defaults(&self) {
        self.limits.clear();
        let clients = self.registry.reset_all();
        self.tracker.clear_all();
        info!(target: "floodgate::engine", clients, "reset to default limits");
    }
}

/// Builder returned by [`AdmissionEngine::builder`].
#[derive(Debug)]
pub struct EngineBuilder {
    settings: Settings,
    store: Option<Arc<dyn LimitStore>>,
}

impl EngineBuilder {
    /// Share limits through `store`. Ignored unless the store is enabled in settings.
    pub fn store(mut self, store: Arc<dyn LimitStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Load persisted limits and start the background loops.
    ///
    /// Never fails: if the store cannot be read the engine runs memory-only
    /// for its whole life.
    pub async fn start(self) -> (AdmissionEngine, BackgroundTasks) {
        let store_settings = self.settings.store.clone();
        let mut engine = AdmissionEngine::new(self.settings);

        match (store_settings, self.store) {
            (Some(store_settings), Some(store)) => {
                let mut sync = LimitSync::new(store, engine.limits.clone(), store_settings);
                if let Some(policy) = &engine.policy {
                    sync = sync.with_policy(policy.clone());
                }
                match connect(&sync).await {
                    Ok(()) => engine.sync = Some(Arc::new(sync)),
                    Err(e) => {
                        warn!(target: "floodgate::engine", error = %e, "store unavailable, running memory-only");
                    }
                }
            }
            (Some(_), None) => {
                warn!(target: "floodgate::engine", "store enabled but no store supplied, running memory-only");
            }
            (None, _) => debug!(target: "floodgate::engine", "store disabled, running memory-only"),
        }

        let mut tasks = BackgroundTasks::new();
        let settings = engine.settings.clone();
        tasks.spawn(
            "eviction",
            run_eviction(engine.registry.clone(), settings.eviction_ttl, settings.eviction_interval, tasks.signal()),
        );
        if let Some(sync) = engine.sync.clone() {
            tasks.spawn("dump", sync.run_dumps(tasks.signal()));
        }
        if let (Some(controller), Some(adaptive)) = (engine.controller(), settings.adaptive) {
            tasks.spawn("controller", controller.run(adaptive.window, tasks.signal()));
        }
        if let Some(every) = settings.reload_interval {
            tasks.spawn(
                "reload",
                run_reloads(engine.limits.clone(), engine.registry.clone(), engine.sync.clone(), every, tasks.signal()),
            );
        }
        info!(
            target: "floodgate::engine",
            default_rps = settings.default_rps,
            adaptive = settings.adaptive.is_some(),
            memory_only = engine.is_memory_only(),
            tasks = ?tasks.names(),
            "admission engine started"
        );
        (engine, tasks)
    }
}

async fn connect(sync: &LimitSync) -> Result<(), crate::error::StoreError> {
    sync.load().await?;
    sync.ensure_record().await
}
