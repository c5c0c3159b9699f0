use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::{
    DirectoryEntry, DirectoryError, DirectoryPartition, DirectoryRequest, DirectoryResponse,
    GrainDirectory, HashRing, RegisterOutcome,
};
use crate::cluster::{ClusterView, SiloAddress};
use crate::identity::ActorIdentity;
use crate::transport::{NodeRequest, NodeResponse, Transport};

/// Directory partitioned over the active silos with a consistent-hash ring.
///
/// ```text
///   resolve(shortener/s:ABC123)
///        │ stable_hash ─> ring ─> owner silo B
///        ▼
///   silo A ──DirectoryRequest::Resolve──> silo B partition
/// ```
///
/// When the view changes, each silo rebuilds its ring, purges entries of
/// dead silos and hands the entries it no longer owns to their new owner.
/// The new owner keeps the first live registration it holds; handed-off
/// entries that lose are sent back to their host as a
/// [`NodeRequest::Evict`] so the duplicate activation goes away.
///
/// A partition only stores registrations for identities its own ring
/// assigns to it. A registration sent with a stale ring is answered
/// [`DirectoryError::NotOwner`] and retried once at the owner named in the
/// reply.
///
/// A partition that lived on a crashed silo is lost with it. Hosts rebuild
/// it by re-registering their activations once the ring has changed (see
/// `ActivationManager::reconcile`).
#[derive(Debug)]
pub struct DistributedDirectory {
    local: SiloAddress,
    transport: Rc<dyn Transport>,
    partition: DirectoryPartition,
    ring: RefCell<RingState>,
}

#[derive(Debug, Default)]
struct RingState {
    view: ClusterView,
    ring: HashRing,
}

impl DistributedDirectory {
    /// Directory for silo `local`. Owns nothing until the first view arrives.
    pub fn new(local: SiloAddress, transport: Rc<dyn Transport>) -> Self {
        Self {
            local,
            transport,
            partition: DirectoryPartition::new(),
            ring: RefCell::new(RingState::default()),
        }
    }

    /// Entries held by this silo's partition.
    pub fn local_entries(&self) -> usize {
        self.partition.len()
    }

    fn owner(&self, identity: &ActorIdentity) -> Result<SiloAddress, DirectoryError> {
        self.ring
            .borrow()
            .ring
            .owner(identity.stable_hash())
            .cloned()
            .ok_or(DirectoryError::NoOwner)
    }

    fn view(&self) -> ClusterView {
        self.ring.borrow().view.clone()
    }

    async fn remote(&self, owner: &SiloAddress, request: DirectoryRequest) -> Result<DirectoryResponse, DirectoryError> {
        let response = self
            .transport
            .request(owner.endpoint, NodeRequest::Directory(request))
            .await
            .map_err(|e| DirectoryError::Unreachable {
                owner: owner.clone(),
                reason: e.to_string(),
            })?;
        match response {
            NodeResponse::Directory(DirectoryResponse::Error(e)) => Err(e),
            NodeResponse::Directory(reply) => Ok(reply),
            other => Err(DirectoryError::Protocol(format!("{other:?}"))),
        }
    }

    async fn register_at(&self, owner: &SiloAddress, entry: DirectoryEntry) -> Result<RegisterOutcome, DirectoryError> {
        match self.remote(owner, DirectoryRequest::Register(entry)).await? {
            DirectoryResponse::Registered(outcome) => Ok(outcome),
            other => Err(DirectoryError::Protocol(format!("{other:?}"))),
        }
    }

    fn serve_locally(&self, request: DirectoryRequest) -> DirectoryResponse {
        let view = self.view();
        match request {
            DirectoryRequest::Resolve(identity) => {
                DirectoryResponse::Resolved(self.partition.resolve(&identity, &view))
            }
            DirectoryRequest::Register(entry) => match self.owner(&entry.identity) {
                Ok(owner) if owner != self.local => DirectoryResponse::Error(DirectoryError::NotOwner { owner }),
                _ => DirectoryResponse::Registered(self.partition.try_register(entry, &view)),
            },
            DirectoryRequest::Unregister(entry) => {
                self.partition.unregister(&entry);
                DirectoryResponse::Done
            }
            DirectoryRequest::Handoff(entries) => {
                let received = entries.len();
                let rejected: Vec<DirectoryEntry> = entries
                    .into_iter()
                    .filter(|e| !self.partition.try_register(e.clone(), &view).is_registered())
                    .collect();
                tracing::debug!(
                    silo = %self.local,
                    received,
                    rejected = rejected.len(),
                    "directory handoff received"
                );
                DirectoryResponse::HandedOff(rejected)
            }
        }
    }

    async fn hand_off(&self, view: &ClusterView) {
        let moved = {
            let state = self.ring.borrow();
            if state.ring.is_empty() {
                return;
            }
            let local = &self.local;
            self.partition
                .drain_where(|e| state.ring.owner(e.identity.stable_hash()) != Some(local))
        };
        if moved.is_empty() {
            return;
        }
        let mut by_owner: HashMap<SiloAddress, Vec<DirectoryEntry>> = HashMap::new();
        for entry in moved {
            if let Ok(owner) = self.owner(&entry.identity) {
                by_owner.entry(owner).or_default().push(entry);
            }
        }
        let mut rejected = Vec::new();
        for (owner, entries) in by_owner {
            let count = entries.len();
            match self.remote(&owner, DirectoryRequest::Handoff(entries.clone())).await {
                Ok(DirectoryResponse::HandedOff(lost)) => {
                    tracing::debug!(to = %owner, count, rejected = lost.len(), "directory entries handed off");
                    rejected.extend(lost);
                }
                Ok(other) => {
                    tracing::warn!(to = %owner, reply = ?other, "unexpected handoff reply");
                }
                Err(e) => {
                    tracing::warn!(to = %owner, count, error = %e, "directory handoff failed, keeping entries");
                    for entry in entries {
                        self.partition.try_register(entry, view);
                    }
                }
            }
        }
        self.evict(rejected).await;
    }

    /// Tell the hosts of `entries` to drop those activations.
    async fn evict(&self, entries: Vec<DirectoryEntry>) {
        let mut by_host: HashMap<SiloAddress, Vec<DirectoryEntry>> = HashMap::new();
        for entry in entries {
            by_host.entry(entry.silo.clone()).or_default().push(entry);
        }
        for (host, entries) in by_host {
            let count = entries.len();
            match self.transport.request(host.endpoint, NodeRequest::Evict(entries)).await {
                Ok(NodeResponse::Evicted(evicted)) => {
                    tracing::info!(host = %host, count, evicted, "evicted duplicate activations");
                }
                Ok(other) => tracing::warn!(host = %host, reply = ?other, "unexpected eviction reply"),
                Err(e) => tracing::warn!(host = %host, count, error = %e, "could not evict duplicate activations"),
            }
        }
    }
}

#[async_trait::async_trait(?Send)]
impl GrainDirectory for DistributedDirectory {
    async fn resolve(&self, identity: &ActorIdentity) -> Result<Option<DirectoryEntry>, DirectoryError> {
        let owner = self.owner(identity)?;
        if owner == self.local {
            return Ok(self.partition.resolve(identity, &self.view()));
        }
        match self.remote(&owner, DirectoryRequest::Resolve(identity.clone())).await? {
            DirectoryResponse::Resolved(entry) => Ok(entry),
            other => Err(DirectoryError::Protocol(format!("{other:?}"))),
        }
    }

    async fn try_register(&self, entry: DirectoryEntry) -> Result<RegisterOutcome, DirectoryError> {
        let owner = self.owner(&entry.identity)?;
        if owner == self.local {
            return Ok(self.partition.try_register(entry, &self.view()));
        }
        match self.register_at(&owner, entry.clone()).await {
            Err(DirectoryError::NotOwner { owner: hint }) if hint != self.local && hint != owner => {
                tracing::debug!(identity = %entry.identity, from = %owner, to = %hint, "partition moved, registering at its owner");
                self.register_at(&hint, entry).await
            }
            other => other,
        }
    }

    async fn unregister(&self, entry: &DirectoryEntry) -> Result<(), DirectoryError> {
        let owner = self.owner(&entry.identity)?;
        if owner == self.local {
            self.partition.unregister(entry);
            return Ok(());
        }
        self.remote(&owner, DirectoryRequest::Unregister(entry.clone()))
            .await
            .map(|_| ())
    }

    async fn unregister_silo(&self, silo: &SiloAddress) -> Result<usize, DirectoryError> {
        Ok(self.partition.unregister_silo(silo))
    }

    async fn on_view_change(&self, view: &ClusterView) {
        {
            let mut state = self.ring.borrow_mut();
            if view.version() <= state.view.version() {
                return;
            }
            state.view = view.clone();
            state.ring = HashRing::from_view(view);
        }
        let purged = self.partition.purge_dead(view);
        if purged > 0 {
            tracing::debug!(silo = %self.local, version = %view.version(), purged, "directory purged dead silos");
        }
        self.hand_off(view).await;
    }

    async fn serve(&self, request: DirectoryRequest) -> DirectoryResponse {
        self.serve_locally(request)
    }
}
