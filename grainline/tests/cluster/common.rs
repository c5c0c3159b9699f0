//! Shared harness: an in-process cluster on a `LocalNetwork`.

use std::cell::Cell;
use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use grainline::membership::SharedMembership;
use grainline::prelude::*;
use grainline::{LocalDirectory, PersistenceCoordinator, InMemoryStorage};

use crate::grains;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Run `test` inside a `LocalSet` so silos can spawn local tasks.
pub async fn run_local<F: Future>(test: F) -> F::Output {
    init_tracing();
    tokio::task::LocalSet::new().run_until(test).await
}

pub fn endpoint(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Settings tuned for paused-time tests: 1s heartbeats, 3 misses.
pub fn silo_config(name: &str) -> SiloConfig {
    SiloConfig::builder()
        .name(name)
        .heartbeat(Duration::from_secs(1), 3)
        .idle_timeout(Duration::from_secs(60))
        .collection_interval(Duration::from_secs(1))
        .request_timeout(Duration::from_secs(10))
        .deactivation_timeout(Duration::from_secs(2))
        .build()
        .expect("valid silo config")
}

pub fn memory_persistence() -> PersistenceCoordinator {
    PersistenceCoordinator::new().with_provider("memory", Rc::new(InMemoryStorage::new()))
}

pub struct TestCluster {
    pub network: Rc<LocalNetwork>,
    pub cluster: ClusterConfig,
    /// `on_activate` calls across every silo.
    pub activations: Rc<Cell<usize>>,
    pub silos: Vec<Silo>,
    directory: Option<Rc<LocalDirectory>>,
    next_incarnation: u64,
}

impl TestCluster {
    /// Cluster whose grains store state in `provider` of `persistence`.
    pub fn new(persistence: PersistenceCoordinator, provider: &str) -> Self {
        let activations = Rc::new(Cell::new(0));
        let cluster = ClusterConfig::builder()
            .membership(Rc::new(SharedMembership::new()))
            .registry(grains::registry(provider, &activations))
            .persistence(persistence)
            .build()
            .expect("valid cluster config");
        Self {
            network: LocalNetwork::new(),
            cluster,
            activations,
            silos: Vec::new(),
            directory: None,
            next_incarnation: 1,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(memory_persistence(), "memory")
    }

    /// Every silo uses one shared `LocalDirectory` instead of a
    /// distributed one.
    pub fn with_shared_directory(mut self) -> Self {
        self.directory = Some(Rc::new(LocalDirectory::new()));
        self
    }

    pub async fn add_silo(&mut self, name: &str, port: u16) -> &Silo {
        self.add_silo_with(silo_config(name), port).await
    }

    pub async fn add_silo_with(&mut self, config: SiloConfig, port: u16) -> &Silo {
        let incarnation = self.next_incarnation;
        self.next_incarnation += 1;
        let mut builder = Silo::builder(config)
            .cluster(self.cluster.clone())
            .transport(self.network.endpoint(endpoint(port)))
            .incarnation(incarnation);
        if let Some(directory) = &self.directory {
            builder = builder.directory(directory.clone());
        }
        let silo = builder.start().await.expect("silo starts");
        self.silos.push(silo);
        self.silos.last().expect("just pushed")
    }

    pub fn silo(&self, index: usize) -> &Silo {
        &self.silos[index]
    }

    /// How many silos host an activation of `identity`.
    pub fn hosts_of(&self, identity: &ActorIdentity) -> usize {
        self.silos
            .iter()
            .filter(|silo| silo.activations().state_of(identity).is_some())
            .count()
    }
}
