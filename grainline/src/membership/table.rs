use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::{MembershipError, MembershipProvider};
use crate::cluster::{ClusterView, NodeDescriptor, NodeId, NodeStatus, SiloAddress};

/// The membership table.
///
/// Shared between silos through `Rc` in a single process, or hosted by a
/// seed silo and reached through [`SeedMembership`](super::SeedMembership).
/// Load updates change the table but not its version; only status and
/// incarnation changes publish a new view.
#[derive(Debug)]
pub struct SharedMembership {
    inner: RefCell<Table>,
    publisher: watch::Sender<ClusterView>,
}

#[derive(Debug, Default)]
struct Table {
    view: ClusterView,
    last_heartbeat: HashMap<NodeId, Instant>,
}

impl SharedMembership {
    /// Empty table at version 0.
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(ClusterView::new());
        Self {
            inner: RefCell::new(Table::default()),
            publisher,
        }
    }

    fn publish(&self, view: &ClusterView) {
        tracing::debug!(version = %view.version(), nodes = view.len(), "membership view published");
        self.publisher.send_replace(view.clone());
    }

    fn matching<'a>(
        view: &'a mut ClusterView,
        address: &SiloAddress,
    ) -> Result<&'a mut NodeDescriptor, MembershipError> {
        let record = view
            .get_mut(&address.node)
            .ok_or_else(|| MembershipError::UnknownNode(address.node.clone()))?;
        if record.address.incarnation > address.incarnation {
            return Err(MembershipError::DeclaredDead(address.clone()));
        }
        if record.address.incarnation < address.incarnation {
            return Err(MembershipError::UnknownNode(address.node.clone()));
        }
        Ok(record)
    }
}

impl Default for SharedMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait(?Send)]
impl MembershipProvider for SharedMembership {
    async fn join(&self, descriptor: NodeDescriptor) -> Result<ClusterView, MembershipError> {
        let view = {
            let mut table = self.inner.borrow_mut();
            if let Some(existing) = table.view.get(&descriptor.address.node) {
                if existing.address.incarnation >= descriptor.address.incarnation {
                    return Err(MembershipError::StaleIncarnation {
                        node: descriptor.address.node.clone(),
                        current: existing.address.incarnation,
                        attempted: descriptor.address.incarnation,
                    });
                }
                tracing::info!(
                    node = %descriptor.address.node,
                    old = existing.address.incarnation,
                    new = descriptor.address.incarnation,
                    "silo restarted, previous incarnation superseded"
                );
            }
            table
                .last_heartbeat
                .insert(descriptor.address.node.clone(), Instant::now());
            tracing::info!(silo = %descriptor.address, status = ?descriptor.status, "silo joined");
            table.view.insert(descriptor);
            table.view.bump();
            table.view.clone()
        };
        self.publish(&view);
        Ok(view)
    }

    async fn current_view(&self) -> Result<ClusterView, MembershipError> {
        Ok(self.inner.borrow().view.clone())
    }

    fn subscribe(&self) -> watch::Receiver<ClusterView> {
        self.publisher.subscribe()
    }

    async fn heartbeat(&self, address: &SiloAddress, load: usize) -> Result<(), MembershipError> {
        let mut table = self.inner.borrow_mut();
        let record = Self::matching(&mut table.view, address)?;
        if record.status == NodeStatus::Dead {
            return Err(MembershipError::DeclaredDead(address.clone()));
        }
        record.load = load;
        table
            .last_heartbeat
            .insert(address.node.clone(), Instant::now());
        Ok(())
    }

    async fn update_status(
        &self,
        address: &SiloAddress,
        status: NodeStatus,
    ) -> Result<ClusterView, MembershipError> {
        let view = {
            let mut table = self.inner.borrow_mut();
            let record = Self::matching(&mut table.view, address)?;
            if record.status == status {
                return Ok(table.view.clone());
            }
            if record.status == NodeStatus::Dead {
                return Err(MembershipError::DeclaredDead(address.clone()));
            }
            tracing::info!(silo = %address, from = ?record.status, to = ?status, "silo status changed");
            record.status = status;
            if status == NodeStatus::Dead {
                record.load = 0;
            }
            table.view.bump();
            table.view.clone()
        };
        self.publish(&view);
        Ok(view)
    }

    async fn check_liveness(&self, timeout: Duration) -> Result<Vec<SiloAddress>, MembershipError> {
        let now = Instant::now();
        let (declared, view) = {
            let mut table = self.inner.borrow_mut();
            let Table {
                view,
                last_heartbeat,
            } = &mut *table;
            let expired: Vec<NodeId> = view
                .nodes()
                .filter(|d| d.status.is_live())
                .filter(|d| {
                    last_heartbeat
                        .get(&d.address.node)
                        .map_or(true, |last| now.duration_since(*last) > timeout)
                })
                .map(|d| d.address.node.clone())
                .collect();
            if expired.is_empty() {
                return Ok(Vec::new());
            }
            let mut declared = Vec::with_capacity(expired.len());
            for node in expired {
                if let Some(record) = view.get_mut(&node) {
                    tracing::warn!(silo = %record.address, "heartbeats missed, declaring silo dead");
                    record.status = NodeStatus::Dead;
                    record.load = 0;
                    declared.push(record.address.clone());
                }
            }
            view.bump();
            (declared, view.clone())
        };
        self.publish(&view);
        Ok(declared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_support::silo;
    use crate::cluster::MembershipVersion;

    #[tokio::test(start_paused = true)]
    async fn join_and_status_changes_bump_version() {
        let table = SharedMembership::new();
        let a = silo("a", 1, 1);
        let v1 = table
            .join(NodeDescriptor::new(a.clone(), NodeStatus::Joining))
            .await
            .expect("join");
        let v2 = table.update_status(&a, NodeStatus::Active).await.expect("activate");
        assert!(v2.version() > v1.version());
        assert_eq!(v2.active_nodes().len(), 1);

        // No-op transition keeps the version.
        let v3 = table.update_status(&a, NodeStatus::Active).await.expect("same");
        assert_eq!(v3.version(), v2.version());
    }

    #[tokio::test(start_paused = true)]
    async fn load_updates_do_not_publish() {
        let table = SharedMembership::new();
        let a = silo("a", 1, 1);
        table.join(NodeDescriptor::new(a.clone(), NodeStatus::Active)).await.expect("join");
        let before = table.current_view().await.expect("view").version();
        table.heartbeat(&a, 17).await.expect("heartbeat");
        let view = table.current_view().await.expect("view");
        assert_eq!(view.version(), before);
        assert_eq!(view.get(&a.node).map(|d| d.load), Some(17));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_silo_is_declared_dead_after_timeout() {
        let table = SharedMembership::new();
        let a = silo("a", 1, 1);
        let b = silo("b", 2, 1);
        for s in [&a, &b] {
            table.join(NodeDescriptor::new(s.clone(), NodeStatus::Active)).await.expect("join");
        }
        let mut watcher = table.subscribe();
        watcher.borrow_and_update();

        tokio::time::advance(Duration::from_millis(250)).await;
        table.heartbeat(&a, 0).await.expect("a alive");
        assert!(table.check_liveness(Duration::from_millis(300)).await.expect("sweep").is_empty());

        tokio::time::advance(Duration::from_millis(100)).await;
        let declared = table.check_liveness(Duration::from_millis(300)).await.expect("sweep");
        assert_eq!(declared, vec![b.clone()]);

        assert!(watcher.has_changed().expect("open"));
        let view = watcher.borrow_and_update().clone();
        assert!(view.is_known_dead(&b));
        assert!(view.is_live(&a));

        let err = table.heartbeat(&b, 0).await.expect_err("dead silo");
        assert_eq!(err, MembershipError::DeclaredDead(b.clone()));
        let err = table.update_status(&b, NodeStatus::Active).await.expect_err("terminal");
        assert_eq!(err, MembershipError::DeclaredDead(b));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_supersedes_old_incarnation() {
        let table = SharedMembership::new();
        let old = silo("a", 1, 1);
        let new = silo("a", 1, 2);
        table.join(NodeDescriptor::new(old.clone(), NodeStatus::Active)).await.expect("join");
        let view = table.join(NodeDescriptor::new(new.clone(), NodeStatus::Joining)).await.expect("rejoin");
        assert!(view.is_known_dead(&old));
        assert_eq!(view.version(), MembershipVersion(2));

        let err = table
            .join(NodeDescriptor::new(old.clone(), NodeStatus::Joining))
            .await
            .expect_err("stale");
        assert!(matches!(err, MembershipError::StaleIncarnation { current: 2, attempted: 1, .. }));
        assert_eq!(
            table.heartbeat(&old, 0).await.expect_err("superseded"),
            MembershipError::DeclaredDead(old)
        );
    }
}
