//! Joining, failure detection and seed-hosted membership.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use grainline::membership::{SeedMembership, SharedMembership};
use grainline::prelude::*;
use grainline::NodeStatus;

use crate::common::{endpoint, memory_persistence, run_local, silo_config, TestCluster};
use crate::grains;

#[tokio::test(start_paused = true)]
async fn started_silos_are_active_in_one_view() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;

        let view = cluster.silo(0).view();
        assert_eq!(view.active_nodes().len(), 2);
        assert!(view.is_live(cluster.silo(1).address()));
        assert_eq!(view.version(), cluster.silo(1).view().version());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn silent_silo_is_declared_dead() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let b = cluster.silo(1).address().clone();

        cluster.silo(1).kill();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cluster.silo(0).view().is_live(&b), "two missed beats are tolerated");

        tokio::time::sleep(Duration::from_secs(3)).await;
        let view = cluster.silo(0).view();
        assert!(view.is_known_dead(&b));
        assert_eq!(view.active_nodes().len(), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn restarted_silo_replaces_its_old_incarnation() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let old = cluster.silo(1).address().clone();
        cluster.silo(1).kill();

        let new = cluster.add_silo("b", 7002).await.address().clone();
        assert!(new.incarnation > old.incarnation);
        let view = cluster.silo(0).view();
        assert!(view.is_known_dead(&old));
        assert!(view.is_live(&new));
        assert_eq!(view.active_nodes().len(), 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn graceful_shutdown_ends_dead() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let b = cluster.silo(1).address().clone();

        cluster.silo(1).shutdown().await.expect("shutdown");
        let status = cluster.silo(0).view().get(&b.node).map(|node| node.status);
        assert_eq!(status, Some(NodeStatus::Dead));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn silo_joins_through_a_seed() {
    run_local(async {
        let network = LocalNetwork::new();
        let activations = Rc::new(Cell::new(0));

        let seed_cluster = ClusterConfig::builder()
            .membership(Rc::new(SharedMembership::new()))
            .registry(grains::registry("memory", &activations))
            .persistence(memory_persistence())
            .build()
            .expect("seed cluster");
        let seed = Silo::builder(silo_config("seed"))
            .cluster(seed_cluster)
            .transport(network.endpoint(endpoint(7001)))
            .incarnation(1)
            .host_membership()
            .start()
            .await
            .expect("seed starts");

        let transport = network.endpoint(endpoint(7002));
        let remote_cluster = ClusterConfig::builder()
            .membership(Rc::new(SeedMembership::new(transport.clone(), endpoint(7001))))
            .registry(grains::registry("memory", &activations))
            .persistence(memory_persistence())
            .build()
            .expect("remote cluster");
        let remote = Silo::builder(silo_config("remote"))
            .cluster(remote_cluster)
            .transport(transport)
            .incarnation(1)
            .start()
            .await
            .expect("remote joins through the seed");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(seed.view().active_nodes().len(), 2);
        assert_eq!(remote.view().active_nodes().len(), 2);
        assert_eq!(remote.view().version(), seed.view().version());

        // Calls from the remote silo work whichever silo hosts the grain.
        for key in 0..4i64 {
            let counter = ActorIdentity::new("counter", key);
            let total: i64 = remote.router().call(&counter, "add", &key).await.expect("add");
            assert_eq!(total, key);
        }

        seed.kill();
        let err = remote
            .router()
            .call::<_, i64>(&ActorIdentity::new("counter", 99i64), "add", &1i64)
            .await
            .expect_err("no membership, no placement");
        assert!(matches!(err, RuntimeError::Unavailable(_)), "{err:?}");
    })
    .await;
}
