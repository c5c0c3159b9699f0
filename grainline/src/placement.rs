//! Placement: per-kind hints and the cluster-level director.
//!
//! - **[`PlacementStrategy`]** is declared per grain kind at registration and
//!   says *what* the grain wants.
//! - **[`PlacementDirector`]** interprets the hint against a [`ClusterView`]
//!   and picks a silo.
//!
//! A placement decision is only a proposal. The chosen silo still has to win
//! the directory registration; if another silo won first, the call is
//! redirected there and the proposal is dropped.

use std::cell::Cell;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterView, NodeStatus, SiloAddress};
use crate::error::RuntimeError;
use crate::identity::ActorIdentity;

/// Errors from placement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// The view has no active silo.
    #[error("no active silo can host {identity}")]
    NoCandidates {
        /// Grain that could not be placed.
        identity: ActorIdentity,
    },
}

impl From<PlacementError> for RuntimeError {
    fn from(err: PlacementError) -> Self {
        RuntimeError::Unavailable(err.to_string())
    }
}

/// Per-kind placement hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlacementStrategy {
    /// Active silo reporting the fewest activations. Ties go to the lowest
    /// node id.
    #[default]
    LeastLoaded,
    /// The calling silo when it is active, otherwise least loaded.
    PreferLocal,
    /// Rotate over the active silos.
    RoundRobin,
}

/// Picks the silo that should activate a grain.
#[async_trait::async_trait(?Send)]
pub trait PlacementDirector: fmt::Debug {
    /// Choose an `Active` silo of `view` for `identity`.
    async fn place(
        &self,
        strategy: PlacementStrategy,
        identity: &ActorIdentity,
        view: &ClusterView,
        caller: &SiloAddress,
    ) -> Result<SiloAddress, PlacementError>;
}

/// Built-in director for every [`PlacementStrategy`].
#[derive(Debug, Default)]
pub struct DefaultPlacementDirector {
    round_robin_next: Cell<usize>,
}

impl DefaultPlacementDirector {
    /// Director with the round-robin cursor at zero.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait(?Send)]
impl PlacementDirector for DefaultPlacementDirector {
    async fn place(
        &self,
        strategy: PlacementStrategy,
        identity: &ActorIdentity,
        view: &ClusterView,
        caller: &SiloAddress,
    ) -> Result<SiloAddress, PlacementError> {
        let candidates = view.active_nodes();
        if candidates.is_empty() {
            return Err(PlacementError::NoCandidates {
                identity: identity.clone(),
            });
        }
        let least_loaded = || {
            // `min_by_key` keeps the first minimum; candidates are ordered by id.
            candidates
                .iter()
                .min_by_key(|d| d.load)
                .map(|d| d.address.clone())
        };
        let chosen = match strategy {
            PlacementStrategy::LeastLoaded => least_loaded(),
            PlacementStrategy::PreferLocal => {
                let local_active = view
                    .get(&caller.node)
                    .is_some_and(|d| d.address == *caller && d.status == NodeStatus::Active);
                if local_active {
                    Some(caller.clone())
                } else {
                    least_loaded()
                }
            }
            PlacementStrategy::RoundRobin => {
                let index = self.round_robin_next.get() % candidates.len();
                self.round_robin_next.set(index + 1);
                Some(candidates[index].address.clone())
            }
        };
        chosen.ok_or_else(|| PlacementError::NoCandidates {
            identity: identity.clone(),
        })
    }
}
