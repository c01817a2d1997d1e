//! Configuration with every recognized option enumerated.
//!
//! [`Config`] is what callers deserialize or fill in; every field is optional.
//! [`Config::resolve`] runs once, applies the documented defaults to anything
//! unset or non-positive, fixes inconsistent combinations, and produces the
//! read-only [`Settings`] the engine runs on. Resolution never fails.
//!
//! | option | default |
//! |---|---|
//! | `default_rps` | 5 |
//! | `global_max_rps` | 15 (never below `default_rps`) |
//! | `max_wait_ms` | 3000 (explicit `0` decides immediately) |
//! | `adaptive.enabled` | false |
//! | `adaptive.window_ms` | 60000 |
//! | `adaptive.ip_threshold` | 2 |
//! | `adaptive.increase_step` | 1 |
//! | `eviction.ttl_ms` | 5000 (always shorter than the interval) |
//! | `eviction.interval_ms` | 60000 |
//! | `store.enabled` | false |
//! | `store.limits_key` | `"ratelimits"` |
//! | `store.log_key_prefix` | `"ratelimit_log_"` |
//! | `store.dump_interval_ms` | 10000 |
//! | `store.dump_ttl_ms` | unset (no expiry) |
//! | `store.load_workers` | 10 |
//! | `store.audit` | true |
//! | `reload.interval_ms` | unset (disabled) |

use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Default requests per second for endpoints without a recorded limit.
pub const DEFAULT_RPS: u32 = 5;
/// Default ceiling for adaptive increases.
pub const DEFAULT_GLOBAL_MAX_RPS: u32 = 15;
/// Default bound on how long an admission may wait for a permit.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(3);
/// Default monitoring window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Default distinct-address threshold.
pub const DEFAULT_IP_THRESHOLD: usize = 2;
/// Default per-breach increase.
pub const DEFAULT_INCREASE_STEP: u32 = 1;
/// Default idle time after which a client is evicted.
pub const DEFAULT_EVICTION_TTL: Duration = Duration::from_secs(5);
/// Default eviction sweep interval.
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(60);
/// Default store record holding endpoint limits.
pub const DEFAULT_LIMITS_KEY: &str = "ratelimits";
/// Default prefix for per-endpoint audit logs.
pub const DEFAULT_LOG_KEY_PREFIX: &str = "ratelimit_log_";
/// Default dump interval.
pub const DEFAULT_DUMP_INTERVAL: Duration = Duration::from_secs(10);
/// Default number of concurrent parse workers during bulk load.
pub const DEFAULT_LOAD_WORKERS: usize = 10;

/// Raw configuration; see the module docs for defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rate for endpoints without a recorded limit.
    pub default_rps: Option<i64>,
    /// Ceiling for adaptive increases.
    pub global_max_rps: Option<i64>,
    /// Bound on the wait for a permit, in milliseconds.
    pub max_wait_ms: Option<i64>,
    /// Adaptive mode.
    pub adaptive: AdaptiveConfig,
    /// Idle-client eviction.
    pub eviction: EvictionConfig,
    /// External store.
    pub store: StoreConfig,
    /// Periodic clear-and-reload.
    pub reload: ReloadConfig,
}

/// Raw adaptive-mode options.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Turn adaptive mode on.
    pub enabled: bool,
    /// Monitoring window in milliseconds.
    pub window_ms: Option<i64>,
    /// Distinct denied addresses that trigger an increase.
    pub ip_threshold: Option<i64>,
    /// Amount added per breach.
    pub increase_step: Option<i64>,
}

/// Raw eviction options.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Idle time before eviction, in milliseconds.
    pub ttl_ms: Option<i64>,
    /// Sweep interval in milliseconds.
    pub interval_ms: Option<i64>,
}

/// Raw external-store options.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Use the external store.
    pub enabled: bool,
    /// Record holding endpoint limits.
    pub limits_key: Option<String>,
    /// Prefix of the per-endpoint audit log keys.
    pub log_key_prefix: Option<String>,
    /// Dump interval in milliseconds.
    pub dump_interval_ms: Option<i64>,
    /// Expiry of the dumped record in milliseconds; unset or `0` never expires.
    pub dump_ttl_ms: Option<i64>,
    /// Concurrent parse workers during bulk load.
    pub load_workers: Option<i64>,
    /// Append an audit entry on every limit increase.
    pub audit: Option<bool>,
}

/// Raw periodic-reload options.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Interval in milliseconds; unset or `0` disables reloading.
    pub interval_ms: Option<i64>,
}

/// Fully resolved, read-only settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Rate for endpoints without a recorded limit.
    pub default_rps: u32,
    /// Ceiling for adaptive increases, never below `default_rps`.
    pub global_max_rps: u32,
    /// Bound on the wait for a permit.
    pub max_wait: Duration,
    /// Adaptive mode; `None` when disabled.
    pub adaptive: Option<AdaptiveSettings>,
    /// Idle time before a client is evicted.
    pub eviction_ttl: Duration,
    /// Eviction sweep interval.
    pub eviction_interval: Duration,
    /// External store; `None` for memory-only operation.
    pub store: Option<StoreSettings>,
    /// Periodic clear-and-reload interval, if enabled.
    pub reload_interval: Option<Duration>,
}

/// Resolved adaptive-mode settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveSettings {
    /// Monitoring window.
    pub window: Duration,
    /// Distinct denied addresses that trigger an increase.
    pub ip_threshold: usize,
    /// Amount added per breach.
    pub increase_step: u32,
}

/// Resolved external-store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// Record holding endpoint limits.
    pub limits_key: String,
    /// Prefix of the per-endpoint audit log keys.
    pub log_key_prefix: String,
    /// Dump interval.
    pub dump_interval: Duration,
    /// Expiry of the dumped record.
    pub dump_ttl: Option<Duration>,
    /// Concurrent parse workers during bulk load.
    pub load_workers: usize,
    /// Append an audit entry on every limit increase.
    pub audit: bool,
}

impl StoreSettings {
    /// Audit log key for `endpoint`.
    pub fn log_key(&self, endpoint: &str) -> String {
        format!("{}{}", self.log_key_prefix, endpoint)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Config::default().resolve()
    }
}

impl Config {
    /// Apply defaults and produce [`Settings`].
    pub fn resolve(&self) -> Settings {
        let default_rps = to_u32(positive("default_rps", self.default_rps, u64::from(DEFAULT_RPS)));
        let mut global_max_rps =
            to_u32(positive("global_max_rps", self.global_max_rps, u64::from(DEFAULT_GLOBAL_MAX_RPS)));
        if global_max_rps < default_rps {
            warn!(
                target: "floodgate::config",
                global_max_rps,
                default_rps,
                "global_max_rps below default_rps, raising it to default_rps"
            );
            global_max_rps = default_rps;
        }

        let max_wait = match self.max_wait_ms {
            Some(ms) if ms >= 0 => Duration::from_millis(ms as u64),
            other => millis("max_wait_ms", other, DEFAULT_MAX_WAIT),
        };

        let adaptive = self.adaptive.enabled.then(|| AdaptiveSettings {
            window: millis("adaptive.window_ms", self.adaptive.window_ms, DEFAULT_WINDOW),
            ip_threshold: to_usize(positive(
                "adaptive.ip_threshold",
                self.adaptive.ip_threshold,
                DEFAULT_IP_THRESHOLD as u64,
            )),
            increase_step: to_u32(positive(
                "adaptive.increase_step",
                self.adaptive.increase_step,
                u64::from(DEFAULT_INCREASE_STEP),
            )),
        });

        let eviction_interval =
            millis("eviction.interval_ms", self.eviction.interval_ms, DEFAULT_EVICTION_INTERVAL);
        let mut eviction_ttl = millis("eviction.ttl_ms", self.eviction.ttl_ms, DEFAULT_EVICTION_TTL);
        if eviction_ttl >= eviction_interval {
            let corrected = eviction_interval / 2;
            warn!(
                target: "floodgate::config",
                ttl = ?eviction_ttl,
                interval = ?eviction_interval,
                corrected = ?corrected,
                "eviction ttl must be shorter than the sweep interval"
            );
            eviction_ttl = corrected;
        }

        let store = self.store.enabled.then(|| StoreSettings {
            limits_key: non_empty("store.limits_key", self.store.limits_key.as_deref(), DEFAULT_LIMITS_KEY),
            log_key_prefix: self
                .store
                .log_key_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_KEY_PREFIX.to_string()),
            dump_interval: millis("store.dump_interval_ms", self.store.dump_interval_ms, DEFAULT_DUMP_INTERVAL),
            dump_ttl: optional_millis("store.dump_ttl_ms", self.store.dump_ttl_ms),
            load_workers: to_usize(positive(
                "store.load_workers",
                self.store.load_workers,
                DEFAULT_LOAD_WORKERS as u64,
            )),
            audit: self.store.audit.unwrap_or(true),
        });

        Settings {
            default_rps,
            global_max_rps,
            max_wait,
            adaptive,
            eviction_ttl,
            eviction_interval,
            store,
            reload_interval: optional_millis("reload.interval_ms", self.reload.interval_ms),
        }
    }
}

fn positive(option: &'static str, value: Option<i64>, default: u64) -> u64 {
    match value {
        Some(v) if v > 0 => v as u64,
        Some(v) => {
            warn!(target: "floodgate::config", option, value = v, default, "non-positive value, using default");
            default
        }
        None => {
            debug!(target: "floodgate::config", option, default, "unset, using default");
            default
        }
    }
}

fn millis(option: &'static str, value: Option<i64>, default: Duration) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(positive(option, value, default_ms))
}

fn optional_millis(option: &'static str, value: Option<i64>) -> Option<Duration> {
    match value {
        Some(v) if v > 0 => Some(Duration::from_millis(v as u64)),
        Some(v) if v < 0 => {
            warn!(target: "floodgate::config", option, value = v, "negative value, treating as disabled");
            None
        }
        _ => None,
    }
}

fn non_empty(option: &'static str, value: Option<&str>, default: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        Some(_) => {
            warn!(target: "floodgate::config", option, default, "empty value, using default");
            default.to_string()
        }
        None => default.to_string(),
    }
}

fn to_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

fn to_usize(v: u64) -> usize {
    usize::try_from(v).unwrap_or(usize::MAX)
}
