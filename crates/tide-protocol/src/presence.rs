//! Reachability input of the router.
//!
//! The router never discovers peers itself; it asks a [`PresenceSource`]
//! which destinations have a direct route, which are currently active and
//! which relays advertise them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tide_transport::Endpoint;

use crate::types::{DirectRoute, RelayCapability, TargetId};

pub trait PresenceSource: Send + Sync {
    /// Configured direct route, whether or not it currently works.
    fn direct_route(&self, target: &TargetId) -> Option<DirectRoute>;

    /// Whether the destination was recently heard from directly.
    fn is_active_direct(&self, target: &TargetId) -> bool;

    /// Relays advertising `target`, in preference order.
    fn relays_for(&self, target: &TargetId) -> Vec<Endpoint>;
}

impl<P: PresenceSource + ?Sized> PresenceSource for Arc<P> {
    fn direct_route(&self, target: &TargetId) -> Option<DirectRoute> {
        (**self).direct_route(target)
    }

    fn is_active_direct(&self, target: &TargetId) -> bool {
        (**self).is_active_direct(target)
    }

    fn relays_for(&self, target: &TargetId) -> Vec<Endpoint> {
        (**self).relays_for(target)
    }
}

/// In-memory presence tables, filled by the caller.
#[derive(Debug, Default)]
pub struct StaticPresence {
    routes: RwLock<HashMap<TargetId, DirectRoute>>,
    active: RwLock<HashSet<TargetId>>,
    relays: RwLock<Vec<RelayCapability>>,
}

impl StaticPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_route(&self, target: impl Into<TargetId>, route: DirectRoute) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target.into(), route);
    }

    pub fn remove_route(&self, target: &TargetId) -> Option<DirectRoute> {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(target)
    }

    pub fn set_active(&self, target: impl Into<TargetId>, active: bool) {
        let mut set = self.active.write().unwrap_or_else(PoisonError::into_inner);
        let target = target.into();
        if active {
            set.insert(target);
        } else {
            set.remove(&target);
        }
    }

    /// Add a relay, replacing an earlier capability of the same endpoint.
    pub fn add_relay(&self, capability: RelayCapability) {
        let mut relays = self.relays.write().unwrap_or_else(PoisonError::into_inner);
        match relays.iter_mut().find(|c| c.relay == capability.relay) {
            Some(existing) => *existing = capability,
            None => relays.push(capability),
        }
    }

    pub fn remove_relay(&self, relay: &Endpoint) -> bool {
        let mut relays = self.relays.write().unwrap_or_else(PoisonError::into_inner);
        let before = relays.len();
        relays.retain(|c| &c.relay != relay);
        relays.len() != before
    }
}

impl PresenceSource for StaticPresence {
    fn direct_route(&self, target: &TargetId) -> Option<DirectRoute> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .cloned()
    }

    fn is_active_direct(&self, target: &TargetId) -> bool {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(target)
    }

    fn relays_for(&self, target: &TargetId) -> Vec<Endpoint> {
        self.relays
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.reaches(target))
            .map(|c| c.relay.clone())
            .collect()
    }
}
