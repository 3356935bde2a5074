//! Remote presence store.
//!
//! Maps service name → presence for every peer currently resolved on the
//! link. Single writer (the discovery adapter's event task), many readers;
//! iteration is over snapshots so readers never hold the lock across
//! user callbacks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use salut_core::LLPresence;

use crate::DiscoveryObserver;

/// Notified when presences appear, change, or leave the link.
pub trait PresenceListener: Send + Sync {
    fn presence_new(&self, presence: &LLPresence);
    fn presence_removed(&self, presence: &LLPresence);
    fn presence_updated(&self, presence: &LLPresence);
}

#[derive(Default)]
pub struct PresenceStore {
    presences: RwLock<HashMap<String, LLPresence>>,
    listeners: RwLock<Vec<Arc<dyn PresenceListener>>>,
}

impl PresenceStore {
    pub fn new() -> PresenceStore {
        PresenceStore::default()
    }

    pub fn get(&self, service_name: &str) -> Option<LLPresence> {
        self.presences
            .read()
            .expect("presence store poisoned")
            .get(service_name)
            .cloned()
    }

    pub fn contains(&self, service_name: &str) -> bool {
        self.presences
            .read()
            .expect("presence store poisoned")
            .contains_key(service_name)
    }

    /// Snapshot of all known presences.
    pub fn snapshot(&self) -> Vec<LLPresence> {
        self.presences
            .read()
            .expect("presence store poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.presences.read().expect("presence store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or update a resolved presence, notifying listeners with the
    /// appropriate event.
    pub fn publish(&self, presence: LLPresence) {
        let is_new = {
            let mut map = self.presences.write().expect("presence store poisoned");
            map.insert(presence.service_name().to_string(), presence.clone())
                .is_none()
        };
        let listeners = self.listeners_snapshot();
        for l in &listeners {
            if is_new {
                l.presence_new(&presence);
            } else {
                l.presence_updated(&presence);
            }
        }
        tracing::debug!(
            peer = presence.service_name(),
            new = is_new,
            "presence published"
        );
    }

    /// Drop a presence (service left the link or cache eviction).
    pub fn remove(&self, service_name: &str) -> Option<LLPresence> {
        let removed = self
            .presences
            .write()
            .expect("presence store poisoned")
            .remove(service_name);
        if let Some(presence) = &removed {
            for l in &self.listeners_snapshot() {
                l.presence_removed(presence);
            }
            tracing::debug!(peer = service_name, "presence removed");
        }
        removed
    }

    pub fn add_listener(&self, listener: Arc<dyn PresenceListener>) {
        self.listeners
            .write()
            .expect("presence listeners poisoned")
            .push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn PresenceListener>) {
        self.listeners
            .write()
            .expect("presence listeners poisoned")
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn PresenceListener>> {
        self.listeners
            .read()
            .expect("presence listeners poisoned")
            .clone()
    }
}

/// The store is the canonical sink for discovery events: a resolved
/// service becomes a visible presence, a removed service disappears.
/// Un-resolved services are not published (name-only is useless to the
/// session layer).
impl DiscoveryObserver for PresenceStore {
    fn service_added(&self, name: &str) {
        tracing::trace!(peer = name, "service found, awaiting resolution");
    }

    fn service_removed(&self, name: &str) {
        self.remove(name);
    }

    fn service_resolved(&self, presence: LLPresence) {
        self.publish(presence);
    }
}
