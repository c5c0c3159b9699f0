use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::Grain;
use crate::error::RuntimeError;
use crate::identity::{ActorIdentity, ActorKind};
use crate::placement::PlacementStrategy;

/// Builds a fresh grain instance for an identity.
pub type GrainFactory = Rc<dyn Fn(&ActorIdentity) -> Box<dyn Grain>>;

/// Per-kind options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrainOptions {
    /// Storage provider holding this kind's state, `None` for stateless grains.
    pub storage_provider: Option<String>,
    /// Placement hint.
    pub placement: PlacementStrategy,
}

impl GrainOptions {
    /// Stateless grain with default placement.
    pub fn stateless() -> Self {
        Self::default()
    }

    /// Grain whose state lives in `provider`.
    pub fn persistent(provider: impl Into<String>) -> Self {
        Self {
            storage_provider: Some(provider.into()),
            ..Self::default()
        }
    }

    /// Override the placement hint.
    pub fn with_placement(mut self, placement: PlacementStrategy) -> Self {
        self.placement = placement;
        self
    }
}

/// A registered grain kind.
#[derive(Clone)]
pub struct GrainRegistration {
    /// Options given at registration.
    pub options: GrainOptions,
    factory: GrainFactory,
}

impl GrainRegistration {
    /// Construct a grain instance.
    pub fn create(&self, identity: &ActorIdentity) -> Box<dyn Grain> {
        (self.factory)(identity)
    }
}

impl fmt::Debug for GrainRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrainRegistration")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Grain kinds this cluster can activate.
#[derive(Debug, Clone, Default)]
pub struct GrainRegistry {
    kinds: HashMap<ActorKind, GrainRegistration>,
}

impl GrainRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind with a factory.
    pub fn register<G, F>(&mut self, kind: impl Into<ActorKind>, options: GrainOptions, factory: F) -> &mut Self
    where
        G: Grain,
        F: Fn(&ActorIdentity) -> G + 'static,
    {
        let factory: GrainFactory = Rc::new(move |id: &ActorIdentity| -> Box<dyn Grain> { Box::new(factory(id)) });
        self.kinds.insert(kind.into(), GrainRegistration { options, factory });
        self
    }

    /// Register a kind built with `Default`.
    pub fn register_default<G: Grain + Default>(&mut self, kind: impl Into<ActorKind>, options: GrainOptions) -> &mut Self {
        self.register(kind, options, |_| G::default())
    }

    /// Registration of a kind.
    pub fn get(&self, kind: &ActorKind) -> Option<&GrainRegistration> {
        self.kinds.get(kind)
    }

    /// Registration for an identity's kind, or `InvalidRequest`.
    pub fn lookup(&self, identity: &ActorIdentity) -> Result<&GrainRegistration, RuntimeError> {
        self.get(identity.kind()).ok_or_else(|| {
            RuntimeError::InvalidRequest(format!("unknown grain kind '{}'", identity.kind()))
        })
    }

    /// Registered kinds with their options.
    pub fn kinds(&self) -> impl Iterator<Item = (&ActorKind, &GrainOptions)> {
        self.kinds.iter().map(|(k, r)| (k, &r.options))
    }
}
