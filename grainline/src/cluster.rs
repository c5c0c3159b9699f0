//! Cluster topology types shared by membership, directory and placement.
//!
//! A [`ClusterView`] is an immutable, versioned snapshot of every silo the
//! membership table knows about. Silos are never removed from a view, only
//! moved to [`NodeStatus::Dead`], so a stale incarnation can always be told
//! apart from a silo that was never seen.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Stable name of a silo, taken from its configuration.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The node name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// One incarnation of a silo: name, endpoint and start counter.
///
/// A silo that restarts keeps its [`NodeId`] but gets a higher incarnation,
/// which is how directory entries from the previous process are recognised
/// as dead.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiloAddress {
    /// Node name.
    pub node: NodeId,
    /// Endpoint the silo's transport listens on.
    pub endpoint: SocketAddr,
    /// Monotonic per-node start counter.
    pub incarnation: u64,
}

impl SiloAddress {
    /// Create a silo address.
    pub fn new(node: impl Into<NodeId>, endpoint: SocketAddr, incarnation: u64) -> Self {
        Self {
            node: node.into(),
            endpoint,
            incarnation,
        }
    }
}

impl From<String> for NodeId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.node, self.endpoint, self.incarnation)
    }
}

/// Membership status of a silo incarnation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Registered but not yet accepting placements.
    Joining,
    /// Eligible for placement and directory ownership.
    Active,
    /// Draining activations before shutdown.
    Leaving,
    /// Gone. Terminal for this incarnation.
    Dead,
}

impl NodeStatus {
    /// Anything but `Dead`.
    pub fn is_live(self) -> bool {
        !matches!(self, NodeStatus::Dead)
    }
}

/// A silo as recorded in the membership table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Which incarnation this record describes.
    pub address: SiloAddress,
    /// Current status.
    pub status: NodeStatus,
    /// Activation count reported with the last heartbeat.
    pub load: usize,
}

impl NodeDescriptor {
    /// A fresh record with zero load.
    pub fn new(address: SiloAddress, status: NodeStatus) -> Self {
        Self {
            address,
            status,
            load: 0,
        }
    }
}

/// Monotonic version of the membership table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MembershipVersion(pub u64);

impl MembershipVersion {
    /// The following version.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MembershipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Versioned snapshot of the membership table.
///
/// Nodes are kept ordered by [`NodeId`] so every consumer iterates them in
/// the same order and tie-breaks agree across silos.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    version: MembershipVersion,
    nodes: BTreeMap<NodeId, NodeDescriptor>,
}

impl ClusterView {
    /// Empty view at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a view from parts.
    pub fn from_nodes(
        version: MembershipVersion,
        nodes: impl IntoIterator<Item = NodeDescriptor>,
    ) -> Self {
        Self {
            version,
            nodes: nodes
                .into_iter()
                .map(|d| (d.address.node.clone(), d))
                .collect(),
        }
    }

    /// Version of this snapshot.
    pub fn version(&self) -> MembershipVersion {
        self.version
    }

    /// The record for a node, whatever its status.
    pub fn get(&self, node: &NodeId) -> Option<&NodeDescriptor> {
        self.nodes.get(node)
    }

    /// Every record, ordered by node id.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    /// Records in `Active` state, ordered by node id.
    pub fn active_nodes(&self) -> Vec<&NodeDescriptor> {
        self.nodes
            .values()
            .filter(|d| d.status == NodeStatus::Active)
            .collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no silo has ever joined.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether this incarnation is recorded and not dead.
    pub fn is_live(&self, address: &SiloAddress) -> bool {
        self.nodes.get(&address.node).is_some_and(|d| {
            d.address.incarnation == address.incarnation && d.status.is_live()
        })
    }

    /// Whether the view proves this incarnation is gone.
    ///
    /// True when the node is recorded `Dead`, or when a newer incarnation of
    /// the same node has joined. An address the view has never heard of is
    /// not provably dead: the view may simply be lagging.
    pub fn is_known_dead(&self, address: &SiloAddress) -> bool {
        match self.nodes.get(&address.node) {
            Some(d) if d.address.incarnation > address.incarnation => true,
            Some(d) if d.address.incarnation == address.incarnation => {
                d.status == NodeStatus::Dead
            }
            _ => false,
        }
    }

    pub(crate) fn insert(&mut self, descriptor: NodeDescriptor) {
        self.nodes.insert(descriptor.address.node.clone(), descriptor);
    }

    pub(crate) fn get_mut(&mut self, node: &NodeId) -> Option<&mut NodeDescriptor> {
        self.nodes.get_mut(node)
    }

    pub(crate) fn bump(&mut self) {
        self.version = self.version.next();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// `127.0.0.1:<port>`
    pub fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    pub fn silo(name: &str, port: u16, incarnation: u64) -> SiloAddress {
        SiloAddress::new(name, endpoint(port), incarnation)
    }

    pub fn view(nodes: &[(SiloAddress, NodeStatus, usize)]) -> ClusterView {
        ClusterView::from_nodes(
            MembershipVersion(1),
            nodes.iter().map(|(a, s, l)| NodeDescriptor {
                address: a.clone(),
                status: *s,
                load: *l,
            }),
        )
    }
}
