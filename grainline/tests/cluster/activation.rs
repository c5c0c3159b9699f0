//! Single activation, idle collection and requested deactivation.

use std::time::Duration;

use futures::future::join_all;
use grainline::activation::ActivationState;
use grainline::prelude::*;
use grainline::transport::{InvokeRequest, NodeResponse};
use grainline::ActivationEpoch;

use crate::common::{run_local, silo_config, TestCluster};

#[tokio::test(start_paused = true)]
async fn concurrent_first_messages_share_one_activation() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let counter = ActorIdentity::new("counter", 7i64);

        let calls = (0..20).map(|i| {
            let router = cluster.silo(i % 2).router().clone();
            let counter = counter.clone();
            async move { router.call::<_, i64>(&counter, "add", &1i64).await }
        });
        let results = join_all(calls).await;
        assert!(results.iter().all(Result::is_ok), "calls failed: {results:?}");

        let total: i64 = cluster.silo(0).router().call(&counter, "get", &()).await.expect("get");
        assert_eq!(total, 20);
        assert_eq!(cluster.activations.get(), 1);
        assert_eq!(cluster.hosts_of(&counter), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn racing_local_placements_keep_one_winner() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let zzz = ActorIdentity::new("local-counter", "ZZZ");

        // Both silos place the grain on themselves; only one may keep it.
        let (from_a, from_b) = tokio::join!(
            cluster.silo(0).router().call::<_, i64>(&zzz, "add", &1i64),
            cluster.silo(1).router().call::<_, i64>(&zzz, "add", &1i64),
        );
        from_a.expect("call from a");
        from_b.expect("call from b");

        assert_eq!(cluster.activations.get(), 1, "the loser must not construct the grain");
        assert_eq!(cluster.hosts_of(&zzz), 1);
        let total: i64 = cluster.silo(1).router().call(&zzz, "get", &()).await.expect("get");
        assert_eq!(total, 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn resolving_an_active_grain_is_stable() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let counter = ActorIdentity::new("counter", 1i64);

        let _: i64 = cluster.silo(0).router().call(&counter, "add", &1i64).await.expect("activate");
        let first = cluster.silo(0).directory().resolve(&counter).await.expect("resolve");
        let second = cluster.silo(1).directory().resolve(&counter).await.expect("resolve");
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(cluster.silo(0).router().cached_location(&counter), first.map(|e| e.silo));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn idle_activation_is_collected_and_reloaded() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        let config = SiloConfig {
            idle_timeout: Duration::from_secs(5),
            ..silo_config("a")
        };
        cluster.add_silo_with(config, 7001).await;
        let counter = ActorIdentity::new("counter", 3i64);
        let router = cluster.silo(0).router().clone();

        let _: i64 = router.call(&counter, "add", &5i64).await.expect("add");
        assert_eq!(cluster.silo(0).activation_count(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(cluster.silo(0).activation_count(), 0, "idle grain should be gone");

        // Deactivation flushed the dirty value; the new activation reads it.
        let total: i64 = router.call(&counter, "get", &()).await.expect("get");
        assert_eq!(total, 5);
        assert_eq!(cluster.activations.get(), 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn busy_grain_is_not_collected() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        let config = SiloConfig {
            idle_timeout: Duration::from_secs(5),
            ..silo_config("a")
        };
        cluster.add_silo_with(config, 7001).await;
        let counter = ActorIdentity::new("counter", 4i64);
        let router = cluster.silo(0).router().clone();

        let slept: u64 = router.call(&counter, "sleep", &8_000u64).await.expect("long call");
        assert_eq!(slept, 8_000);
        assert_eq!(cluster.activations.get(), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn message_after_requested_deactivation_reactivates() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        let counter = ActorIdentity::new("counter", 9i64);
        let router = cluster.silo(0).router().clone();

        let _: i64 = router.call(&counter, "add", &2i64).await.expect("add");
        let (retired, added) = tokio::join!(
            router.call::<_, ()>(&counter, "retire", &()),
            router.call::<_, i64>(&counter, "add", &3i64),
        );
        retired.expect("retire");
        assert_eq!(added.expect("add after retire"), 5);
        assert_eq!(cluster.activations.get(), 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn explicit_deactivation_flushes_and_unregisters() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        let counter = ActorIdentity::new("counter", 11i64);
        let silo = cluster.silo(0);

        let _: i64 = silo.router().call(&counter, "add", &4i64).await.expect("add");
        assert_eq!(silo.activations().state_of(&counter), Some(ActivationState::Valid));
        assert!(silo.activations().deactivate(&counter, DeactivationReason::Requested).await);
        assert_eq!(silo.activations().state_of(&counter), None);
        assert_eq!(silo.directory().resolve(&counter).await.expect("resolve"), None);

        let stored = cluster
            .cluster
            .persistence()
            .load(&counter, "memory")
            .await
            .expect("load")
            .expect("flushed");
        assert_eq!(stored.version, 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn evicted_duplicate_goes_away_without_flushing() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        let counter = ActorIdentity::new("counter", 12i64);
        let silo = cluster.silo(0);

        let _: i64 = silo.router().call(&counter, "add", &4i64).await.expect("add");
        let entry = silo.directory().resolve(&counter).await.expect("resolve").expect("registered");

        let mut other_epoch = entry.clone();
        other_epoch.epoch = ActivationEpoch(entry.epoch.0 + 100);
        assert_eq!(silo.activations().evict(&[other_epoch]), 0, "another activation's entry");
        assert_eq!(silo.activations().evict(&[entry]), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(silo.activations().state_of(&counter), None);
        let stored = cluster.cluster.persistence().load(&counter, "memory").await.expect("load");
        assert!(stored.is_none(), "duplicate state must not be written");
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn silo_not_owning_a_grain_answers_not_mine() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let counter = ActorIdentity::new("local-counter", 1i64);

        let _: i64 = cluster.silo(1).router().call(&counter, "add", &1i64).await.expect("add");
        let response = cluster
            .silo(0)
            .activations()
            .deliver(InvokeRequest {
                target: counter.clone(),
                method: "get".into(),
                payload: encode(&()).expect("encode"),
                forward_count: 0,
            })
            .await;
        assert_eq!(
            response,
            NodeResponse::NotMine {
                owner: Some(cluster.silo(1).address().clone())
            }
        );
        assert_eq!(cluster.activations.get(), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn unknown_kind_is_rejected_before_activation() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        let ghost = ActorIdentity::new("ghost", "x");

        let err = cluster.silo(0).router().send(&ghost, "get", Vec::new()).await.expect_err("unknown kind");
        assert!(matches!(err, RuntimeError::InvalidRequest(_)), "{err:?}");
        assert_eq!(cluster.silo(0).activation_count(), 0);
        assert_eq!(cluster.silo(0).directory().resolve(&ghost).await.expect("resolve"), None);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn grains_call_each_other_through_the_router() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let relay = ActorIdentity::new("counter", 100i64);
        let target = ActorIdentity::new("counter", 200i64);

        let total: i64 = cluster.silo(0).router().call(&relay, "relay", &(200i64, 6i64)).await.expect("relay");
        assert_eq!(total, 6);
        let total: i64 = cluster.silo(1).router().call(&target, "get", &()).await.expect("get");
        assert_eq!(total, 6);
    })
    .await;
}
