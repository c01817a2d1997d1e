//! Periodic removal of idle clients.

use crate::registry::ClientRegistry;
use crate::tasks::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Sweep `registry` every `interval`, dropping clients idle longer than `ttl`.
///
/// The first sweep happens one full interval after start.
pub async fn run_eviction(
    registry: Arc<ClientRegistry>,
    ttl: Duration,
    interval: Duration,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    info!(target: "floodgate::eviction", ttl = ?ttl, every = ?interval, "evicting idle clients");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait() => break,
        }
        let removed = registry.evict_idle(ttl);
        if removed > 0 {
            info!(target: "floodgate::eviction", removed, remaining = registry.len(), "evicted idle clients");
        } else {
            debug!(target: "floodgate::eviction", remaining = registry.len(), "no idle clients");
        }
    }
}
