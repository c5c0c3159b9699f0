//! Deadlines, retry-once and reassignment after a crash.

use std::time::Duration;

use grainline::activation::ActivationState;
use grainline::prelude::*;
use grainline::transport::{InvokeRequest, NodeResponse};
use grainline::MembershipProvider;

use crate::common::{run_local, TestCluster};

#[tokio::test(start_paused = true)]
async fn call_past_its_deadline_times_out() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        let router = cluster.silo(0).router().clone();
        let slow = ActorIdentity::new("counter", 1i64);

        let payload = encode(&5_000u64).expect("encode");
        let err = router
            .send_with_deadline(&slow, "sleep", payload, Duration::from_millis(100))
            .await
            .expect_err("deadline");
        assert!(matches!(err, RuntimeError::Timeout(_)), "{err:?}");

        let other = ActorIdentity::new("counter", 2i64);
        let total: i64 = router.call(&other, "add", &1i64).await.expect("other grains still served");
        assert_eq!(total, 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn grain_errors_are_returned_without_retry() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        let router = cluster.silo(0).router().clone();
        let code = ActorIdentity::new("urlShortener", "NOPE00");

        let err = router.call::<_, String>(&code, "get", &()).await.expect_err("nothing stored");
        assert!(matches!(err, RuntimeError::NotFound(_)), "{err:?}");
        let err = router.call::<_, ()>(&code, "fly", &()).await.expect_err("unknown method");
        assert!(matches!(err, RuntimeError::InvalidRequest(_)), "{err:?}");
        assert_eq!(cluster.activations.get(), 0, "url shortener is not counted");
        assert_eq!(cluster.silo(0).activation_count(), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn crashed_host_is_unavailable_then_reassigned() {
    run_local(async {
        let mut cluster = TestCluster::in_memory().with_shared_directory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let counter = ActorIdentity::new("local-counter", 42i64);

        let b = cluster.silo(1).router().clone();
        let _: i64 = b.call(&counter, "add", &3i64).await.expect("add on b");
        let _: u64 = b.call(&counter, "save", &()).await.expect("save on b");
        cluster.silo(1).kill();

        // b is not declared dead yet: the directory still points at it and
        // the single retry hits the same dead endpoint.
        let a = cluster.silo(0).router().clone();
        let err = a.call::<_, i64>(&counter, "add", &1i64).await.expect_err("host just crashed");
        assert!(matches!(err, RuntimeError::Unavailable(_)), "{err:?}");

        tokio::time::sleep(Duration::from_secs(5)).await;
        let dead = cluster
            .silo(0)
            .view()
            .get(&cluster.silo(1).address().node)
            .map(|node| node.status);
        assert_eq!(dead, Some(grainline::NodeStatus::Dead));

        let total: i64 = a.call(&counter, "add", &1i64).await.expect("reactivated on a");
        assert_eq!(total, 4, "saved state survives the crash");
        assert_eq!(cluster.silo(0).activation_count(), 1);
        assert_eq!(cluster.activations.get(), 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn silo_declared_dead_stops_serving_its_activations() {
    run_local(async {
        let mut cluster = TestCluster::in_memory().with_shared_directory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let counter = ActorIdentity::new("local-counter", 77i64);
        let b = cluster.silo(1).address().clone();

        let total: i64 = cluster.silo(1).router().call(&counter, "add", &3i64).await.expect("add on b");
        assert_eq!(total, 3);

        // b is still running but the cluster no longer counts it.
        cluster.cluster.membership().declare_dead(&b).await.expect("declare b dead");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let total: i64 = cluster.silo(0).router().call(&counter, "add", &1i64).await.expect("add from a");
        assert_eq!(total, 1, "b never saved its state");
        assert_eq!(cluster.hosts_of(&counter), 1);
        assert_eq!(cluster.silo(0).activations().state_of(&counter), Some(ActivationState::Valid));
        assert!(cluster.silo(1).activations().is_fenced());
        assert_eq!(cluster.silo(1).activations().state_of(&counter), None);

        let response = cluster
            .silo(1)
            .activations()
            .deliver(InvokeRequest {
                target: counter.clone(),
                method: "add".into(),
                payload: encode(&1i64).expect("encode"),
                forward_count: 0,
            })
            .await;
        assert_eq!(response, NodeResponse::NotMine { owner: None });
        assert_eq!(cluster.hosts_of(&counter), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn unsaved_changes_are_lost_on_crash() {
    run_local(async {
        let mut cluster = TestCluster::in_memory().with_shared_directory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let counter = ActorIdentity::new("local-counter", 43i64);

        let _: i64 = cluster.silo(1).router().call(&counter, "add", &3i64).await.expect("add on b");
        cluster.silo(1).kill();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let total: i64 = cluster.silo(0).router().call(&counter, "get", &()).await.expect("get on a");
        assert_eq!(total, 0);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn stale_cache_entry_is_refreshed_transparently() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let counter = ActorIdentity::new("local-counter", 5i64);

        // a caches b as the host.
        let _: i64 = cluster.silo(1).router().call(&counter, "add", &1i64).await.expect("add on b");
        let _: i64 = cluster.silo(0).router().call(&counter, "add", &1i64).await.expect("add from a");
        assert_eq!(
            cluster.silo(0).router().cached_location(&counter).as_ref(),
            Some(cluster.silo(1).address())
        );

        // Move the grain to a: deactivate on b, reactivate from a.
        assert!(cluster.silo(1).activations().deactivate(&counter, DeactivationReason::Requested).await);
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
        assert!(matches!(response, NodeResponse::Invoke(Ok(_))), "{response:?}");

        // b's cache still names b; b answers NotMine with a as the owner.
        let total: i64 = cluster.silo(1).router().call(&counter, "add", &1i64).await.expect("redirected");
        assert_eq!(total, 3);
        assert_eq!(cluster.hosts_of(&counter), 1);
        assert_eq!(
            cluster.silo(1).router().cached_location(&counter).as_ref(),
            Some(cluster.silo(0).address())
        );
    })
    .await;
}
