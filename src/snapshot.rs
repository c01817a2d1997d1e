//! Point-in-time view of engine state for diagnostics endpoints.

use crate::policy::AdaptivePolicy;
use crate::registry::ClientStats;
use serde::Serialize;
use std::collections::BTreeMap;

/// Serializable engine state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    /// Rate applied to endpoints without an explicit limit.
    pub default_rps: u32,
    /// True when no external store is in use.
    pub memory_only: bool,
    /// Current adaptive policy, if adaptive mode is on.
    pub adaptive: Option<AdaptivePolicy>,
    /// Explicit endpoint limits.
    pub limits: BTreeMap<String, u32>,
    /// Every tracked client, sorted by key.
    pub clients: Vec<ClientStats>,
}

impl EngineSnapshot {
    /// Total requests granted across tracked clients.
    pub fn total_granted(&self) -> u64 {
        self.clients.iter().map(|c| c.granted).sum()
    }

    /// Total requests denied across tracked clients.
    pub fn total_denied(&self) -> u64 {
        self.clients.iter().map(|c| c.denied).sum()
    }

    /// Render as a JSON document.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn serializes_limits_and_clients() {
        let snapshot = EngineSnapshot {
            default_rps: 5,
            memory_only: true,
            adaptive: None,
            limits: BTreeMap::from([("/a".to_string(), 7)]),
            clients: vec![ClientStats {
                key: "127.0.0.1@/a".into(),
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                endpoint: "/a".into(),
                rate: 7.0,
                granted: 3,
                denied: 2,
                idle_ms: 0,
            }],
        };
        assert_eq!(snapshot.total_granted(), 3);
        assert_eq!(snapshot.total_denied(), 2);

        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json_string().unwrap()).unwrap();
        assert_eq!(json["limits"]["/a"], 7);
        assert_eq!(json["adaptive"], serde_json::Value::Null);
        assert_eq!(json["clients"][0]["address"], "127.0.0.1");
    }
}
