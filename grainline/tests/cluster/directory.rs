//! Single activation over the distributed directory when its partitions move.

use std::time::Duration;

use futures::future::join_all;
use grainline::prelude::*;

use crate::common::{run_local, TestCluster};

fn local_counters(count: i64) -> Vec<ActorIdentity> {
    (0..count).map(|key| ActorIdentity::new("local-counter", key)).collect()
}

#[tokio::test(start_paused = true)]
async fn crashed_partition_owner_does_not_duplicate_activations() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        cluster.add_silo("c", 7003).await;
        let counters = local_counters(62);

        let a = cluster.silo(0).router().clone();
        for counter in &counters {
            let total: i64 = a.call(counter, "add", &1i64).await.expect("add on a");
            assert_eq!(total, 1);
        }
        assert_eq!(cluster.silo(0).activation_count(), 62);

        // With 62 identities on a three-silo ring, c owns some of a's entries.
        cluster.silo(2).kill();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let b = cluster.silo(1).router().clone();
        for counter in &counters {
            let total: i64 = b.call(counter, "add", &1i64).await.expect("add from b");
            assert_eq!(total, 2, "{counter} kept its activation on a");
            assert_eq!(cluster.hosts_of(counter), 1, "{counter}");
        }
        assert_eq!(cluster.silo(0).activation_count(), 62);
        assert_eq!(cluster.silo(1).activation_count(), 0);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn activations_racing_a_join_converge_to_one() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let counters = local_counters(40);

        // c applies its own Active view before a and b have seen it, so
        // for a moment the silos disagree on who owns which partition.
        cluster.add_silo("c", 7003).await;
        let callers = [cluster.silo(0).router().clone(), cluster.silo(2).router().clone()];
        let calls = counters.iter().flat_map(|counter| {
            callers.iter().map(move |router| {
                let router = router.clone();
                let counter = counter.clone();
                async move { router.call::<_, i64>(&counter, "add", &1i64).await }
            })
        });
        let results = join_all(calls).await;
        assert!(results.iter().any(Result::is_ok), "calls failed: {results:?}");

        tokio::time::sleep(Duration::from_secs(3)).await;
        for counter in &counters {
            assert!(cluster.hosts_of(counter) <= 1, "{counter} is hosted twice");
        }

        let b = cluster.silo(1).router().clone();
        for counter in &counters {
            let _: i64 = b.call(counter, "add", &1i64).await.expect("add from b");
            assert_eq!(cluster.hosts_of(counter), 1, "{counter}");
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn joining_silo_takes_over_partitions_without_duplicates() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let counters = local_counters(30);

        let b = cluster.silo(1).router().clone();
        for counter in &counters {
            let _: i64 = b.call(counter, "add", &2i64).await.expect("add on b");
        }

        cluster.add_silo("c", 7003).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // c now owns part of the ring and must resolve b's activations.
        let c = cluster.silo(2).router().clone();
        for counter in &counters {
            let total: i64 = c.call(counter, "add", &1i64).await.expect("add from c");
            assert_eq!(total, 3, "{counter} still lives on b");
            assert_eq!(cluster.hosts_of(counter), 1, "{counter}");
        }
        assert_eq!(cluster.silo(2).activation_count(), 0);
    })
    .await;
}
