//! # Grainline
//!
//! A virtual actor runtime. Grains are addressed by a stable identity
//! (`kind` + `key`) and are activated on demand, on exactly one silo of the
//! cluster at a time. Callers never manage their lifecycle: the first
//! message activates a grain, idleness deactivates it, and the next message
//! brings it back with its persisted state.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  silo            SiloBuilder / Silo: startup, shutdown, kill │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │  router                      │  activation                   │
//! │  • locate: cache, directory, │  • single activation per      │
//! │    placement                 │    identity, mailbox per      │
//! │  • deadline, retry once      │    grain, idle collection     │
//! ├──────────────┬───────────────┼───────────────┬───────────────┤
//! │  directory   │  membership   │  placement    │  persistence  │
//! │  CAS entries,│  views,       │  least loaded,│  versioned    │
//! │  hash ring   │  heartbeats   │  local, rr    │  envelopes    │
//! ├──────────────┴───────────────┴───────────────┴───────────────┤
//! │  transport       in-process LocalNetwork, framed TCP         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  identity, cluster, error, config                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Execution model
//!
//! Everything is single-threaded: async traits are `?Send`, shared state
//! lives in `Rc`/`RefCell`, and background work is spawned with
//! `tokio::task::spawn_local`. Run silos inside a `tokio::task::LocalSet`.
//! Several silos can share one process, which is how the tests model a
//! cluster.
//!
//! ## Quick Start
//!
//! ```ignore
//! use grainline::prelude::*;
//!
//! let mut registry = GrainRegistry::new();
//! registry.register_default::<Counter>("counter", GrainOptions::persistent("memory"));
//! let cluster = ClusterConfig::in_memory(registry)?;
//!
//! let network = LocalNetwork::new();
//! let silo = Silo::builder(SiloConfig::builder().name("a").build()?)
//!     .cluster(cluster)
//!     .transport(network.endpoint("127.0.0.1:7001".parse()?))
//!     .start()
//!     .await?;
//!
//! let total: i64 = silo.router().call(&ActorIdentity::new("counter", 7i64), "add", &5i64).await?;
//! ```

#![deny(missing_docs)]

pub mod activation;
pub mod cluster;
pub mod config;
pub mod directory;
pub mod error;
pub mod grain;
pub mod identity;
pub mod membership;
pub mod persistence;
pub mod placement;
pub mod prelude;
pub mod router;
pub mod silo;
pub mod transport;

pub use activation::{ActivationConfig, ActivationManager, ActivationState};
pub use cluster::{ClusterView, MembershipVersion, NodeDescriptor, NodeId, NodeStatus, SiloAddress};
pub use config::{ClusterConfig, ClusterConfigBuilder, ConfigError, SiloConfig, SiloConfigBuilder};
pub use directory::{
    ActivationEpoch, DirectoryCache, DirectoryEntry, DirectoryError, DistributedDirectory, GrainDirectory,
    LocalDirectory, RegisterOutcome,
};
pub use error::{RuntimeError, RuntimeResult};
pub use grain::{
    decode, encode, DeactivationReason, Grain, GrainContext, GrainError, GrainOptions, GrainRegistry, GrainState,
};
pub use identity::{ActorIdentity, ActorKey, ActorKind};
pub use membership::{HeartbeatConfig, MembershipError, MembershipProvider, SeedMembership, SharedMembership};
pub use persistence::{
    FileStorage, InMemoryStorage, PersistenceCoordinator, PersistentStateEnvelope, StorageConfig, StorageError,
    StorageProvider,
};
pub use placement::{DefaultPlacementDirector, PlacementDirector, PlacementError, PlacementStrategy};
pub use router::MessageRouter;
pub use silo::{Silo, SiloBuilder, SiloError};
pub use transport::{LocalNetwork, TcpTransport, Transport, TransportError};
