//! Grain directory: which silo hosts the activation of an identity.
//!
//! The directory is the authority for single activation. A silo only keeps an
//! activation whose [`try_register`](GrainDirectory::try_register) it won;
//! every other silo is told the winner and forwards there.
//!
//! # Design
//!
//! - [`DirectoryPartition`] is the compare-and-set map itself. Entries pointing
//!   at a silo incarnation that the latest [`ClusterView`] proves dead are
//!   treated as absent and purged lazily.
//! - [`LocalDirectory`] is one partition shared by every silo in a process.
//! - [`DistributedDirectory`] splits identities over a consistent-hash ring of
//!   the active silos. Remote partitions are reached with
//!   [`DirectoryRequest`]s over the transport, and entries are handed to
//!   their new owner when the ring changes. Handed-off entries that lose to
//!   an existing registration are evicted from their host.
//! - [`DirectoryCache`] sits in the router in front of any directory and is
//!   invalidated whenever a silo answers `NotMine`.
//!
//! # Register semantics
//!
//! | Stored entry                      | `try_register(e)` result     |
//! |-----------------------------------|------------------------------|
//! | none                              | `Registered(e)`, stored      |
//! | entry on a provably dead silo     | `Registered(e)`, replaced    |
//! | equal to `e`                      | `Registered(e)`, idempotent  |
//! | any other live entry `w`          | `Conflict(w)`, untouched     |

mod cache;
mod distributed;
mod partition;
mod ring;

pub use cache::DirectoryCache;
pub use distributed::DistributedDirectory;
pub use partition::{DirectoryPartition, LocalDirectory};
pub use ring::HashRing;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterView, SiloAddress};
use crate::error::RuntimeError;
use crate::identity::ActorIdentity;

/// Errors from directory operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum DirectoryError {
    /// No active silo exists to own the identity's partition.
    #[error("no active silo owns the directory partition")]
    NoOwner,

    /// The partition owner could not be reached.
    #[error("directory owner {owner} unreachable: {reason}")]
    Unreachable {
        /// Silo owning the partition.
        owner: SiloAddress,
        /// Transport failure.
        reason: String,
    },

    /// The receiver's ring assigns the identity to another silo.
    #[error("partition belongs to {owner}")]
    NotOwner {
        /// Owner according to the receiver.
        owner: SiloAddress,
    },

    /// The owner answered with something that is not a directory reply.
    #[error("unexpected directory reply: {0}")]
    Protocol(String),
}

impl From<DirectoryError> for RuntimeError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::Protocol(_) => RuntimeError::Internal(err.to_string()),
            _ => RuntimeError::Unavailable(err.to_string()),
        }
    }
}

/// Per-silo counter distinguishing successive activations of one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivationEpoch(pub u64);

impl fmt::Display for ActivationEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Where an identity is activated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// The grain.
    pub identity: ActorIdentity,
    /// Silo incarnation hosting it.
    pub silo: SiloAddress,
    /// Which activation on that silo.
    pub epoch: ActivationEpoch,
}

impl DirectoryEntry {
    /// Create an entry.
    pub fn new(identity: ActorIdentity, silo: SiloAddress, epoch: ActivationEpoch) -> Self {
        Self {
            identity,
            silo,
            epoch,
        }
    }
}

/// Result of [`GrainDirectory::try_register`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterOutcome {
    /// The caller's entry is now authoritative.
    Registered(DirectoryEntry),
    /// Another live entry was already registered; it stays authoritative.
    Conflict(DirectoryEntry),
}

impl RegisterOutcome {
    /// The authoritative entry after the call.
    pub fn winner(&self) -> &DirectoryEntry {
        match self {
            RegisterOutcome::Registered(e) | RegisterOutcome::Conflict(e) => e,
        }
    }

    /// True if the caller won.
    pub fn is_registered(&self) -> bool {
        matches!(self, RegisterOutcome::Registered(_))
    }
}

/// Directory operations sent to a partition owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryRequest {
    /// [`GrainDirectory::resolve`]
    Resolve(ActorIdentity),
    /// [`GrainDirectory::try_register`]
    Register(DirectoryEntry),
    /// [`GrainDirectory::unregister`]
    Unregister(DirectoryEntry),
    /// Entries whose ownership moved to the receiver.
    Handoff(Vec<DirectoryEntry>),
}

/// Replies to [`DirectoryRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryResponse {
    /// Resolution result.
    Resolved(Option<DirectoryEntry>),
    /// Registration result.
    Registered(RegisterOutcome),
    /// Unregister done.
    Done,
    /// Handoff applied. Carries the entries that lost to an existing live
    /// registration; their activations must go.
    HandedOff(Vec<DirectoryEntry>),
    /// The operation failed.
    Error(DirectoryError),
}

/// Maps grain identities to the silo hosting their activation.
///
/// No `Send` bounds, matching the single-threaded silo runtime.
#[async_trait::async_trait(?Send)]
pub trait GrainDirectory: fmt::Debug {
    /// The authoritative entry, `None` if the grain is not activated anywhere
    /// known to be alive.
    async fn resolve(&self, identity: &ActorIdentity) -> Result<Option<DirectoryEntry>, DirectoryError>;

    /// Atomically register `entry` unless a live entry exists.
    async fn try_register(&self, entry: DirectoryEntry) -> Result<RegisterOutcome, DirectoryError>;

    /// Remove `entry` if it is still the stored one. Idempotent.
    async fn unregister(&self, entry: &DirectoryEntry) -> Result<(), DirectoryError>;

    /// Remove every locally held entry of `silo` and its older incarnations.
    /// Returns how many were removed.
    async fn unregister_silo(&self, silo: &SiloAddress) -> Result<usize, DirectoryError>;

    /// React to a new membership view.
    async fn on_view_change(&self, view: &ClusterView);

    /// Answer a request from another silo.
    async fn serve(&self, request: DirectoryRequest) -> DirectoryResponse {
        let result = match request {
            DirectoryRequest::Resolve(identity) => self.resolve(&identity).await.map(DirectoryResponse::Resolved),
            DirectoryRequest::Register(entry) => self.try_register(entry).await.map(DirectoryResponse::Registered),
            DirectoryRequest::Unregister(entry) => self.unregister(&entry).await.map(|()| DirectoryResponse::Done),
            DirectoryRequest::Handoff(entries) => {
                let mut rejected = Vec::new();
                for entry in entries {
                    match self.try_register(entry.clone()).await {
                        Ok(RegisterOutcome::Registered(_)) => {}
                        Ok(RegisterOutcome::Conflict(_)) => rejected.push(entry),
                        Err(e) => return DirectoryResponse::Error(e),
                    }
                }
                Ok(DirectoryResponse::HandedOff(rejected))
            }
        };
        result.unwrap_or_else(DirectoryResponse::Error)
    }
}
