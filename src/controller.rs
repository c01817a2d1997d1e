//! Adaptive limit controller.
//!
//! Once per window the controller drains the [`ExceedanceTracker`]. Every
//! endpoint whose distinct denied-address count reaches the policy threshold
//! gets its limit raised by one step, never past the global ceiling. When any
//! limit actually changes, every tracked client is dropped so the next request
//! builds a bucket at the new rate.
//!
//! Limits only ever go up. An endpoint at the ceiling stays there and further
//! breaches are dropped without a reset.

use crate::exceedance::{Exceedance, ExceedanceTracker};
use crate::limits::LimitTable;
use crate::policy::PolicyHandle;
use crate::registry::ClientRegistry;
use crate::store::{Fields, LimitStore};
use crate::tasks::ShutdownSignal;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// A limit raised by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitChange {
    /// Endpoint whose limit moved.
    pub endpoint: String,
    /// Rate before the tick.
    pub previous: u32,
    /// Rate after the tick.
    pub current: u32,
    /// Distinct addresses denied during the window, sorted.
    pub addresses: Vec<IpAddr>,
    /// RFC 3339 wall-clock time of the change.
    pub timestamp: String,
}

impl LimitChange {
    /// Audit log fields for this change.
    pub fn to_fields(&self) -> Fields {
        let ips: Vec<String> = self.addresses.iter().map(ToString::to_string).collect();
        Fields::from([
            ("rate_limit_log".to_string(), self.endpoint.clone()),
            ("timestamp".to_string(), self.timestamp.clone()),
            ("previous_limit".to_string(), self.previous.to_string()),
            ("new_limit".to_string(), self.current.to_string()),
            ("exceeding_ips".to_string(), ips.join(",")),
        ])
    }
}

#[derive(Debug, Clone)]
struct AuditSink {
    store: Arc<dyn LimitStore>,
    log_key_prefix: String,
}

/// Raises endpoint limits under sustained denial pressure.
#[derive(Debug, Clone)]
pub struct AdaptiveController {
    limits: Arc<LimitTable>,
    registry: Arc<ClientRegistry>,
    tracker: Arc<ExceedanceTracker>,
    policy: PolicyHandle,
    audit: Option<AuditSink>,
}

impl AdaptiveController {
    /// Controller over the shared engine state.
    pub fn new(
        limits: Arc<LimitTable>,
        registry: Arc<ClientRegistry>,
        tracker: Arc<ExceedanceTracker>,
        policy: PolicyHandle,
    ) -> Self {
        Self { limits, registry, tracker, policy, audit: None }
    }

    /// Append every change to `<log_key_prefix><endpoint>` in `store`.
    pub fn with_audit(mut self, store: Arc<dyn LimitStore>, log_key_prefix: impl Into<String>) -> Self {
        self.audit = Some(AuditSink { store, log_key_prefix: log_key_prefix.into() });
        self
    }

    /// The live policy this controller reads on every tick.
    pub fn policy(&self) -> &PolicyHandle {
        &self.policy
    }

    /// Process one window. Returns the limits that changed.
    ///
    /// The tracker is empty afterwards whether or not anything changed.
    pub fn tick(&self) -> Vec<LimitChange> {
        let policy = self.policy.get();
        let mut changes = Vec::new();

        for Exceedance { endpoint, addresses } in self.tracker.drain() {
            if addresses.len() < policy.ip_threshold {
                debug!(
                    target: "floodgate::controller",
                    endpoint = %endpoint,
                    distinct = addresses.len(),
                    threshold = policy.ip_threshold,
                    "below threshold"
                );
                continue;
            }
            let increase = self.limits.increase(&endpoint, policy.global_max_rps, policy.increase_step);
            if !increase.changed() {
                debug!(
                    target: "floodgate::controller",
                    endpoint = %endpoint,
                    rate = increase.current,
                    "limit already at ceiling"
                );
                continue;
            }
            changes.push(LimitChange {
                endpoint,
                previous: increase.previous,
                current: increase.current,
                addresses,
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            });
        }

        if changes.is_empty() {
            return changes;
        }
        // The ceiling may have been lowered while this tick was raising rates.
        let latest = self.policy.get().global_max_rps;
        if latest < policy.global_max_rps {
            self.limits.clamp_max(latest);
        }
        let reset = self.registry.reset_all();
        for change in &changes {
            info!(
                target: "floodgate::controller",
                endpoint = %change.endpoint,
                previous = change.previous,
                current = change.current,
                distinct = change.addresses.len(),
                "raised endpoint limit"
            );
        }
        info!(target: "floodgate::controller", reset, "reset all clients after limit change");
        self.emit_audit(&changes);
        changes
    }

    fn emit_audit(&self, changes: &[LimitChange]) {
        let Some(audit) = self.audit.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(target: "floodgate::controller", "no runtime available, dropping audit records");
            return;
        };
        let records: Vec<(String, Fields)> = changes
            .iter()
            .map(|c| (format!("{}{}", audit.log_key_prefix, c.endpoint), c.to_fields()))
            .collect();
        runtime.spawn(async move {
            for (key, fields) in records {
                if let Err(e) = audit.store.append(&key, fields).await {
                    warn!(target: "floodgate::controller", key = %key, error = %e, "failed to append audit record");
                }
            }
        });
    }

    /// Tick every `window` until shutdown.
    pub async fn run(self, window: Duration, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        info!(target: "floodgate::controller", window = ?window, "adaptive controller running");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }
            self.tick();
        }
    }
}
