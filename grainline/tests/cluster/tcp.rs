//! Two silos talking over real sockets.

use std::net::SocketAddr;
use std::rc::Rc;

use grainline::prelude::*;
use grainline::TcpTransport;

use crate::common::{run_local, silo_config, TestCluster};

async fn tcp_silo(cluster: &TestCluster, name: &str, incarnation: u64) -> Silo {
    let any_port = SocketAddr::from(([127, 0, 0, 1], 0));
    let transport = TcpTransport::bind(any_port).await.expect("bind");
    Silo::builder(silo_config(name))
        .cluster(cluster.cluster.clone())
        .transport(Rc::new(transport))
        .incarnation(incarnation)
        .start()
        .await
        .expect("silo starts")
}

#[tokio::test]
async fn grains_are_reachable_across_tcp_silos() {
    run_local(async {
        let cluster = TestCluster::in_memory();
        let a = tcp_silo(&cluster, "a", 1).await;
        let b = tcp_silo(&cluster, "b", 1).await;
        assert_ne!(a.address().endpoint, b.address().endpoint);
        assert_eq!(b.view().active_nodes().len(), 2);

        let code = ActorIdentity::new("urlShortener", "ABC123");
        a.router()
            .call::<_, ()>(&code, "set", "https://example.com/a/long/path")
            .await
            .expect("set through a");
        let target: String = b.router().call(&code, "get", &()).await.expect("get through b");
        assert_eq!(target, "https://example.com/a/long/path");

        for key in 0..8i64 {
            let counter = ActorIdentity::new("counter", key);
            let _: i64 = a.router().call(&counter, "add", &1i64).await.expect("add through a");
            let total: i64 = b.router().call(&counter, "add", &1i64).await.expect("add through b");
            assert_eq!(total, 2);
        }
        assert_eq!(a.activation_count() + b.activation_count(), 9);

        b.shutdown().await.expect("b shuts down");
        a.shutdown().await.expect("a shuts down");
    })
    .await;
}
