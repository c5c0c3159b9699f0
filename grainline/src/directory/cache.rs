use std::cell::RefCell;
use std::collections::HashMap;

use crate::cluster::{ClusterView, SiloAddress};
use crate::identity::ActorIdentity;

/// Router-side cache of resolved locations.
///
/// Entries are hints: a silo that no longer hosts the grain answers
/// `NotMine`, and the router then invalidates and re-resolves.
#[derive(Debug, Default)]
pub struct DirectoryCache {
    entries: RefCell<HashMap<ActorIdentity, SiloAddress>>,
}

impl DirectoryCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached location.
    pub fn get(&self, identity: &ActorIdentity) -> Option<SiloAddress> {
        self.entries.borrow().get(identity).cloned()
    }

    /// Remember where `identity` lives.
    pub fn insert(&self, identity: ActorIdentity, silo: SiloAddress) {
        self.entries.borrow_mut().insert(identity, silo);
    }

    /// Forget `identity`.
    pub fn invalidate(&self, identity: &ActorIdentity) {
        self.entries.borrow_mut().remove(identity);
    }

    /// Forget every location `view` proves dead.
    pub fn retain_live(&self, view: &ClusterView) {
        self.entries
            .borrow_mut()
            .retain(|_, silo| !view.is_known_dead(silo));
    }

    /// Number of cached locations.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}
