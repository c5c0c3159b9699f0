//! State across deactivation, shutdown and process restarts.

use grainline::persistence::ProviderConfig;
use grainline::prelude::*;

use crate::common::{run_local, TestCluster};

const CODE: &str = "ABC123";
const TARGET: &str = "https://example.com/some/long/path";

fn file_storage(root: &std::path::Path) -> grainline::PersistenceCoordinator {
    StorageConfig {
        providers: vec![ProviderConfig::File {
            name: "durable".into(),
            root: root.to_path_buf(),
        }],
    }
    .build()
}

#[tokio::test]
async fn file_storage_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let code = ActorIdentity::new("urlShortener", CODE);

    run_local(async {
        let mut first = TestCluster::new(file_storage(dir.path()), "durable");
        first.add_silo("a", 7001).await;
        first
            .silo(0)
            .router()
            .call::<_, ()>(&code, "set", TARGET)
            .await
            .expect("set");
        first.silo(0).shutdown().await.expect("shutdown");

        // A new cluster over the same directory stands in for a new process.
        let mut second = TestCluster::new(file_storage(dir.path()), "durable");
        second.add_silo("a", 7001).await;
        let target: String = second.silo(0).router().call(&code, "get", &()).await.expect("get");
        assert_eq!(target, TARGET);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn memory_storage_does_not_survive_a_restart() {
    let code = ActorIdentity::new("urlShortener", CODE);

    run_local(async {
        let mut first = TestCluster::in_memory();
        first.add_silo("a", 7001).await;
        first
            .silo(0)
            .router()
            .call::<_, ()>(&code, "set", TARGET)
            .await
            .expect("set");
        first.silo(0).shutdown().await.expect("shutdown");

        let mut second = TestCluster::in_memory();
        second.add_silo("a", 7001).await;
        let err = second
            .silo(0)
            .router()
            .call::<_, String>(&code, "get", &())
            .await
            .expect_err("state was in the old process");
        assert!(matches!(err, RuntimeError::NotFound(_)), "{err:?}");
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_dirty_state() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        cluster.add_silo("b", 7002).await;
        let counter = ActorIdentity::new("local-counter", 1i64);

        let _: i64 = cluster.silo(0).router().call(&counter, "add", &7i64).await.expect("add on a");
        assert_eq!(cluster.silo(0).activation_count(), 1);
        cluster.silo(0).shutdown().await.expect("shutdown");
        assert_eq!(cluster.silo(0).activation_count(), 0);

        let total: i64 = cluster.silo(1).router().call(&counter, "get", &()).await.expect("get on b");
        assert_eq!(total, 7);
        assert_eq!(cluster.silo(1).activation_count(), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_writers_conflict() {
    run_local(async {
        let mut cluster = TestCluster::in_memory();
        cluster.add_silo("a", 7001).await;
        let counter = ActorIdentity::new("counter", 77i64);
        let router = cluster.silo(0).router().clone();

        let _: i64 = router.call(&counter, "add", &1i64).await.expect("add");
        let _: u64 = router.call(&counter, "save", &()).await.expect("save");

        // Someone else writes behind the activation's back.
        let persistence = cluster.cluster.persistence().clone();
        let stored = persistence.load(&counter, "memory").await.expect("load").expect("stored");
        persistence
            .save(&counter, grainline::PersistentStateEnvelope { data: b"100".to_vec(), ..stored })
            .await
            .expect("external write");

        let _: i64 = router.call(&counter, "add", &1i64).await.expect("add");
        let err = router.call::<_, u64>(&counter, "save", &()).await.expect_err("stale version");
        assert!(matches!(err, RuntimeError::Conflict(_)), "{err:?}");
    })
    .await;
}
