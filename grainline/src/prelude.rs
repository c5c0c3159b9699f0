//! Common imports for writing grains and starting silos.

pub use crate::config::{ClusterConfig, SiloConfig};
pub use crate::error::{RuntimeError, RuntimeResult};
pub use crate::grain::{decode, encode, DeactivationReason, Grain, GrainContext, GrainError, GrainOptions, GrainRegistry};
pub use crate::identity::{ActorIdentity, ActorKey, ActorKind};
pub use crate::persistence::StorageConfig;
pub use crate::placement::PlacementStrategy;
pub use crate::silo::{Silo, SiloBuilder};
pub use crate::transport::LocalNetwork;

pub use async_trait::async_trait;
