use std::collections::BTreeMap;

use crate::cluster::{ClusterView, SiloAddress};
use crate::identity::fnv1a;

/// Points each active silo places on the ring.
pub const VIRTUAL_NODES: usize = 30;

/// Consistent-hash ring assigning directory partitions to active silos.
///
/// Built only from `Active` silos of a view, so every silo holding the same
/// view computes the same owners.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: BTreeMap<u64, SiloAddress>,
}

impl HashRing {
    /// Ring over the active silos of `view`.
    pub fn from_view(view: &ClusterView) -> Self {
        let mut points = BTreeMap::new();
        for node in view.active_nodes() {
            let address = &node.address;
            for vnode in 0..VIRTUAL_NODES {
                let key = format!("{}#{}#{}", address.node, address.incarnation, vnode);
                points.insert(fnv1a(key.as_bytes()), address.clone());
            }
        }
        Self { points }
    }

    /// Silo owning `hash`: the first point at or after it, wrapping around.
    pub fn owner(&self, hash: u64) -> Option<&SiloAddress> {
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, silo)| silo)
    }

    /// True when no silo is active.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_support::{silo, view};
    use crate::cluster::NodeStatus;
    use crate::identity::ActorIdentity;

    #[test]
    fn empty_ring_has_no_owner() {
        assert!(HashRing::default().owner(42).is_none());
    }

    #[test]
    fn only_active_silos_own_partitions() {
        let a = silo("a", 1, 1);
        let b = silo("b", 2, 1);
        let ring = HashRing::from_view(&view(&[(a.clone(), NodeStatus::Active, 0), (b, NodeStatus::Joining, 0)]));
        for key in 0..50i64 {
            let hash = ActorIdentity::new("counter", key).stable_hash();
            assert_eq!(ring.owner(hash), Some(&a));
        }
    }

    #[test]
    fn removing_a_silo_only_moves_its_identities() {
        let a = silo("a", 1, 1);
        let b = silo("b", 2, 1);
        let c = silo("c", 3, 1);
        let full = HashRing::from_view(&view(&[
            (a.clone(), NodeStatus::Active, 0),
            (b.clone(), NodeStatus::Active, 0),
            (c.clone(), NodeStatus::Active, 0),
        ]));
        let without_c = HashRing::from_view(&view(&[
            (a.clone(), NodeStatus::Active, 0),
            (b.clone(), NodeStatus::Active, 0),
            (c.clone(), NodeStatus::Dead, 0),
        ]));
        let mut owned_by_c = 0;
        for key in 0..500i64 {
            let hash = ActorIdentity::new("counter", key).stable_hash();
            let before = full.owner(hash).cloned();
            let after = without_c.owner(hash).cloned();
            if before.as_ref() == Some(&c) {
                owned_by_c += 1;
            } else {
                assert_eq!(before, after);
            }
        }
        assert!(owned_by_c > 0);
    }
}
