use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tide_transport::{Endpoint, TransportKind};

/// Logical name of a destination (vehicle, station, relay node).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TargetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Where and how to reach a destination without a relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectRoute {
    pub endpoint: Endpoint,
    pub kind: TransportKind,
}

impl DirectRoute {
    pub fn stream(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            kind: TransportKind::Stream,
        }
    }

    pub fn datagram(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            kind: TransportKind::Datagram,
        }
    }
}

/// A relay endpoint and the destinations it says it can reach.
///
/// Discovered outside the router and only read by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCapability {
    pub relay: Endpoint,
    pub reachable: BTreeSet<TargetId>,
}

impl RelayCapability {
    pub fn new<I, T>(relay: Endpoint, reachable: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TargetId>,
    {
        Self {
            relay,
            reachable: reachable.into_iter().map(Into::into).collect(),
        }
    }

    pub fn reaches(&self, target: &TargetId) -> bool {
        self.reachable.contains(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_id_round_trips_through_msgpack() {
        let id = TargetId::from("lauv-xplore-1");
        assert_eq!(id.to_string(), "lauv-xplore-1");
        let packed = rmp_serde::to_vec(&id).unwrap();
        let back: TargetId = rmp_serde::from_slice(&packed).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn capability_membership() {
        let cap = RelayCapability::new(Endpoint::new("10.0.0.9", 7011), ["a", "b"]);
        assert!(cap.reaches(&"a".into()));
        assert!(!cap.reaches(&"c".into()));
    }
}
