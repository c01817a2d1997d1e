//! Live-updatable adaptive policy.
//!
//! Reads are a lock-free `ArcSwap` load, so the controller takes one
//! consistent snapshot per tick while operators retune it concurrently.
//! Lowering the ceiling notifies the owner so recorded rates can follow it down.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::{Arc, OnceLock};

/// Knobs the adaptive controller applies on each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdaptivePolicy {
    /// Distinct denied addresses per window that trigger an increase.
    pub ip_threshold: usize,
    /// Amount added to an endpoint's rate per breach.
    pub increase_step: u32,
    /// Ceiling no endpoint rate is raised past.
    pub global_max_rps: u32,
}

impl AdaptivePolicy {
    fn normalized(mut self, floor_rps: u32) -> Self {
        self.ip_threshold = self.ip_threshold.max(1);
        self.increase_step = self.increase_step.max(1);
        self.global_max_rps = self.global_max_rps.max(floor_rps);
        self
    }
}

type CeilingHook = Box<dyn Fn(u32) + Send + Sync>;

struct Shared {
    current: ArcSwap<AdaptivePolicy>,
    on_lowered: OnceLock<CeilingHook>,
}

/// Shared handle to the current [`AdaptivePolicy`].
///
/// Every value stored through the handle is normalized: threshold and step are
/// at least one and the ceiling is never below the default rate.
#[derive(Clone)]
pub struct PolicyHandle {
    shared: Arc<Shared>,
    floor_rps: u32,
}

impl std::fmt::Debug for PolicyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyHandle")
            .field("policy", &self.get())
            .field("floor_rps", &self.floor_rps)
            .field("on_lowered", &self.shared.on_lowered.get().map(|_| "<hook>"))
            .finish()
    }
}

impl PolicyHandle {
    /// Create a handle whose ceiling can never drop below `floor_rps`.
    pub fn new(policy: AdaptivePolicy, floor_rps: u32) -> Self {
        let shared = Shared {
            current: ArcSwap::from_pointee(policy.normalized(floor_rps)),
            on_lowered: OnceLock::new(),
        };
        Self { shared: Arc::new(shared), floor_rps }
    }

    /// Lowest value the ceiling can take.
    pub fn floor_rps(&self) -> u32 {
        self.floor_rps
    }

    /// Snapshot the current policy.
    pub fn get(&self) -> AdaptivePolicy {
        **self.shared.current.load()
    }

    /// Call `hook` with the new ceiling whenever a `set` or `update` lowers it.
    ///
    /// Only the first hook installed on a policy (across all clones) is kept;
    /// returns false if one was already present.
    pub fn on_ceiling_lowered<F>(&self, hook: F) -> bool
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.shared.on_lowered.set(Box::new(hook)).is_ok()
    }

    /// Replace the policy.
    pub fn set(&self, policy: AdaptivePolicy) {
        let next = policy.normalized(self.floor_rps);
        let previous = self.shared.current.swap(Arc::new(next));
        self.ceiling_moved(previous.global_max_rps, next.global_max_rps);
    }

    /// Update via closure.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(AdaptivePolicy) -> AdaptivePolicy,
    {
        let floor = self.floor_rps;
        let previous = self.shared.current.rcu(|cur| Arc::new(f(**cur).normalized(floor)));
        self.ceiling_moved(previous.global_max_rps, self.get().global_max_rps);
    }

    fn ceiling_moved(&self, previous: u32, current: u32) {
        if current < previous {
            if let Some(hook) = self.shared.on_lowered.get() {
                hook(current);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AdaptivePolicy {
        AdaptivePolicy { ip_threshold: 2, increase_step: 1, global_max_rps: 15 }
    }

    #[test]
    fn get_set_update() {
        let handle = PolicyHandle::new(policy(), 5);
        assert_eq!(handle.get(), policy());

        handle.set(AdaptivePolicy { ip_threshold: 4, ..policy() });
        assert_eq!(handle.get().ip_threshold, 4);

        handle.update(|p| AdaptivePolicy { global_max_rps: p.global_max_rps + 5, ..p });
        assert_eq!(handle.get().global_max_rps, 20);
    }

    #[test]
    fn values_are_normalized() {
        let handle = PolicyHandle::new(
            AdaptivePolicy { ip_threshold: 0, increase_step: 0, global_max_rps: 1 },
            5,
        );
        assert_eq!(handle.get(), AdaptivePolicy { ip_threshold: 1, increase_step: 1, global_max_rps: 5 });
    }

    #[test]
    fn clones_share_state() {
        let a = PolicyHandle::new(policy(), 5);
        let b = a.clone();
        b.set(AdaptivePolicy { increase_step: 3, ..policy() });
        assert_eq!(a.get().increase_step, 3);
    }

    #[test]
    fn hook_fires_only_when_ceiling_drops() {
        use std::sync::Mutex;

        let handle = PolicyHandle::new(policy(), 5);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        assert!(handle.on_ceiling_lowered(move |max| sink.lock().unwrap().push(max)));
        assert!(!handle.clone().on_ceiling_lowered(|_| {}), "one hook per policy");

        handle.set(AdaptivePolicy { global_max_rps: 20, ..policy() });
        handle.set(AdaptivePolicy { ip_threshold: 9, global_max_rps: 20, ..policy() });
        handle.set(AdaptivePolicy { global_max_rps: 8, ..policy() });
        handle.clone().update(|p| AdaptivePolicy { global_max_rps: p.global_max_rps.saturating_sub(10), ..p });

        // Normalized up to the floor.
        assert_eq!(*seen.lock().unwrap(), vec![8, 5]);
    }
}
