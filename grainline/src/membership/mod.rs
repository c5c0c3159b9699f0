//! Membership: which silos are in the cluster and whether they are alive.
//!
//! The [`MembershipProvider`] trait is the single source of truth for
//! [`ClusterView`]s. Every change to the table (join, status transition,
//! failure declaration) produces a view with a higher version, published to
//! subscribers through a `tokio::sync::watch` channel. Subscribers may skip
//! intermediate versions but never see them out of order.
//!
//! # Design
//!
//! - [`SharedMembership`] owns the table. In a single process it is shared
//!   between silos through `Rc`; across processes one silo hosts it and the
//!   others reach it through [`SeedMembership`].
//! - Each silo runs a [`MembershipAgent`] that heartbeats its own record and
//!   sweeps the table for silos that stopped heartbeating.
//! - There is no consensus: a partitioned seed blocks joins and new placement
//!   decisions, existing activations keep serving.
//!
//! ```text
//!   silo A ──heartbeat──┐
//!   silo B ──heartbeat──┼──> SharedMembership ──watch──> ClusterView v42
//!   silo C ──(silent)───┘          │
//!                                   └─ after N missed beats: C = Dead, v43
//! ```

mod agent;
mod seed;
mod table;

pub use agent::{HeartbeatConfig, MembershipAgent};
pub use seed::SeedMembership;
pub use table::SharedMembership;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::cluster::{ClusterView, NodeDescriptor, NodeId, NodeStatus, SiloAddress};
use crate::error::RuntimeError;

/// Errors from membership operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum MembershipError {
    /// The node has never joined.
    #[error("node {0} is not in the membership table")]
    UnknownNode(NodeId),

    /// A newer incarnation of the node is already recorded.
    #[error("stale incarnation {attempted} for node {node}, table has {current}")]
    StaleIncarnation {
        /// Node name.
        node: NodeId,
        /// Incarnation in the table.
        current: u64,
        /// Incarnation the caller presented.
        attempted: u64,
    },

    /// The incarnation was declared dead and may not come back.
    #[error("silo {0} was declared dead")]
    DeclaredDead(SiloAddress),

    /// The table could not be reached.
    #[error("membership unavailable: {0}")]
    Unavailable(String),
}

impl From<MembershipError> for RuntimeError {
    fn from(err: MembershipError) -> Self {
        RuntimeError::Unavailable(err.to_string())
    }
}

/// Source of cluster views.
///
/// No `Send` bounds, matching the single-threaded silo runtime.
#[async_trait::async_trait(?Send)]
pub trait MembershipProvider: fmt::Debug {
    /// Add a silo incarnation to the table.
    ///
    /// A higher incarnation of an already known node replaces the old record,
    /// which implicitly declares the old incarnation dead. A lower or equal
    /// incarnation is rejected.
    async fn join(&self, descriptor: NodeDescriptor) -> Result<ClusterView, MembershipError>;

    /// Latest view, including the most recent reported loads.
    async fn current_view(&self) -> Result<ClusterView, MembershipError>;

    /// Watch for new view versions.
    fn subscribe(&self) -> watch::Receiver<ClusterView>;

    /// Record a heartbeat from `address` carrying its activation count.
    ///
    /// Fails with [`MembershipError::DeclaredDead`] once the incarnation was
    /// declared dead.
    async fn heartbeat(&self, address: &SiloAddress, load: usize) -> Result<(), MembershipError>;

    /// Move a silo to a new status. `Dead` is terminal.
    async fn update_status(
        &self,
        address: &SiloAddress,
        status: NodeStatus,
    ) -> Result<ClusterView, MembershipError>;

    /// Start leaving gracefully: no new placements, existing activations
    /// still served.
    async fn leave(&self, address: &SiloAddress) -> Result<ClusterView, MembershipError> {
        self.update_status(address, NodeStatus::Leaving).await
    }

    /// Mark a silo incarnation dead.
    async fn declare_dead(&self, address: &SiloAddress) -> Result<ClusterView, MembershipError> {
        self.update_status(address, NodeStatus::Dead).await
    }

    /// Declare dead every live silo whose last heartbeat is older than
    /// `timeout`. Returns the silos that were declared dead by this call.
    async fn check_liveness(&self, timeout: Duration) -> Result<Vec<SiloAddress>, MembershipError>;
}

/// Membership operations carried over the transport to the hosting silo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipRequest {
    /// [`MembershipProvider::join`]
    Join(NodeDescriptor),
    /// [`MembershipProvider::current_view`]
    View,
    /// [`MembershipProvider::heartbeat`]
    Heartbeat {
        /// Reporting silo.
        address: SiloAddress,
        /// Its activation count.
        load: usize,
    },
    /// [`MembershipProvider::update_status`]
    UpdateStatus {
        /// Target silo.
        address: SiloAddress,
        /// New status.
        status: NodeStatus,
    },
    /// [`MembershipProvider::check_liveness`]
    CheckLiveness {
        /// Heartbeat timeout in milliseconds.
        timeout_ms: u64,
    },
}

/// Replies to [`MembershipRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipResponse {
    /// The view after the operation. Heartbeats are answered with the
    /// current view so remote silos stay up to date.
    View(ClusterView),
    /// Silos declared dead by a liveness sweep.
    Declared(Vec<SiloAddress>),
    /// The operation failed.
    Error(MembershipError),
}

/// Execute a remote membership request against a local provider.
pub async fn serve(provider: &dyn MembershipProvider, request: MembershipRequest) -> MembershipResponse {
    let result = match request {
        MembershipRequest::Join(descriptor) => provider.join(descriptor).await.map(MembershipResponse::View),
        MembershipRequest::View => provider.current_view().await.map(MembershipResponse::View),
        MembershipRequest::Heartbeat { address, load } => match provider.heartbeat(&address, load).await {
            Ok(()) => provider.current_view().await.map(MembershipResponse::View),
            Err(e) => Err(e),
        },
        MembershipRequest::UpdateStatus { address, status } => provider
            .update_status(&address, status)
            .await
            .map(MembershipResponse::View),
        MembershipRequest::CheckLiveness { timeout_ms } => provider
            .check_liveness(Duration::from_millis(timeout_ms))
            .await
            .map(MembershipResponse::Declared),
    };
    result.unwrap_or_else(MembershipResponse::Error)
}
