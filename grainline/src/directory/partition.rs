use std::cell::RefCell;
use std::collections::HashMap;

use super::{DirectoryEntry, DirectoryError, GrainDirectory, RegisterOutcome};
use crate::cluster::{ClusterView, SiloAddress};
use crate::identity::ActorIdentity;

/// Compare-and-set map from identity to activation.
///
/// Every operation takes the caller's latest [`ClusterView`]; entries on
/// silos that view proves dead are dropped on sight.
#[derive(Debug, Default)]
pub struct DirectoryPartition {
    entries: RefCell<HashMap<ActorIdentity, DirectoryEntry>>,
}

impl DirectoryPartition {
    /// Empty partition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, live or not.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Live entry for `identity`.
    pub fn resolve(&self, identity: &ActorIdentity, view: &ClusterView) -> Option<DirectoryEntry> {
        let mut entries = self.entries.borrow_mut();
        match entries.get(identity) {
            Some(entry) if view.is_known_dead(&entry.silo) => {
                tracing::debug!(identity = %identity, silo = %entry.silo, "purging entry of dead silo");
                entries.remove(identity);
                None
            }
            other => other.cloned(),
        }
    }

    /// Store `entry` unless a different live entry exists.
    pub fn try_register(&self, entry: DirectoryEntry, view: &ClusterView) -> RegisterOutcome {
        let mut entries = self.entries.borrow_mut();
        if let Some(existing) = entries.get(&entry.identity) {
            if *existing == entry {
                return RegisterOutcome::Registered(entry);
            }
            if !view.is_known_dead(&existing.silo) {
                return RegisterOutcome::Conflict(existing.clone());
            }
            tracing::debug!(
                identity = %entry.identity,
                dead = %existing.silo,
                "replacing entry of dead silo"
            );
        }
        entries.insert(entry.identity.clone(), entry.clone());
        RegisterOutcome::Registered(entry)
    }

    /// Remove `entry` if it is the stored one.
    pub fn unregister(&self, entry: &DirectoryEntry) -> bool {
        let mut entries = self.entries.borrow_mut();
        if entries.get(&entry.identity) == Some(entry) {
            entries.remove(&entry.identity);
            true
        } else {
            false
        }
    }

    /// Remove the entries of `silo` and of its earlier incarnations.
    pub fn unregister_silo(&self, silo: &SiloAddress) -> usize {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|_, e| !(e.silo.node == silo.node && e.silo.incarnation <= silo.incarnation));
        before - entries.len()
    }

    /// Drop every entry `view` proves dead.
    pub fn purge_dead(&self, view: &ClusterView) -> usize {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|_, e| !view.is_known_dead(&e.silo));
        before - entries.len()
    }

    /// Remove and return the entries matching `pred`.
    pub fn drain_where(&self, mut pred: impl FnMut(&DirectoryEntry) -> bool) -> Vec<DirectoryEntry> {
        let mut entries = self.entries.borrow_mut();
        let moved: Vec<ActorIdentity> = entries
            .values()
            .filter(|e| pred(e))
            .map(|e| e.identity.clone())
            .collect();
        moved.iter().filter_map(|id| entries.remove(id)).collect()
    }
}

/// One partition shared by every silo of a process.
#[derive(Debug, Default)]
pub struct LocalDirectory {
    partition: DirectoryPartition,
    view: RefCell<ClusterView>,
}

impl LocalDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.partition.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.partition.is_empty()
    }
}

#[async_trait::async_trait(?Send)]
impl GrainDirectory for LocalDirectory {
    async fn resolve(&self, identity: &ActorIdentity) -> Result<Option<DirectoryEntry>, DirectoryError> {
        Ok(self.partition.resolve(identity, &self.view.borrow()))
    }

    async fn try_register(&self, entry: DirectoryEntry) -> Result<RegisterOutcome, DirectoryError> {
        Ok(self.partition.try_register(entry, &self.view.borrow()))
    }

    async fn unregister(&self, entry: &DirectoryEntry) -> Result<(), DirectoryError> {
        self.partition.unregister(entry);
        Ok(())
    }

    async fn unregister_silo(&self, silo: &SiloAddress) -> Result<usize, DirectoryError> {
        Ok(self.partition.unregister_silo(silo))
    }

    async fn on_view_change(&self, view: &ClusterView) {
        if view.version() <= self.view.borrow().version() {
            return;
        }
        *self.view.borrow_mut() = view.clone();
        let purged = self.partition.purge_dead(view);
        if purged > 0 {
            tracing::debug!(version = %view.version(), purged, "directory purged dead silos");
        }
    }
}
