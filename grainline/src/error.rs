//! Caller-facing error taxonomy.
//!
//! Every component owns a narrow `thiserror` enum describing its own failure
//! modes (`DirectoryError`, `StorageError`, `TransportError`, ...). Those never
//! reach callers directly: at the router boundary they collapse into
//! [`RuntimeError`], which is `Clone + Serialize` so a remote silo can ship it
//! back inside a response.
//!
//! # Mapping
//!
//! | Component error                     | Runtime error     |
//! |-------------------------------------|-------------------|
//! | `DirectoryError::Unavailable`       | `Unavailable`     |
//! | `MembershipError::*`                | `Unavailable`     |
//! | `PlacementError::NoCandidates`      | `Unavailable`     |
//! | `StorageError::Conflict`            | `Conflict`        |
//! | `StorageError::UnknownProvider`     | `InvalidRequest`  |
//! | `StorageError::Io` / `Serialization`| `Internal`        |
//! | `TransportError::*`                 | `Unavailable`     |
//! | `GrainError::UnknownMethod`         | `InvalidRequest`  |
//! | `GrainError::NotFound`              | `NotFound`        |

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to callers of [`MessageRouter`](crate::router::MessageRouter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RuntimeError {
    /// The grain reported that the requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed identity, unknown grain kind, unknown method or bad payload.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No live silo could host or reach the activation.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A directory or persistence compare-and-set lost a race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller's deadline elapsed before a reply arrived.
    #[error("timed out: {0}")]
    Timeout(String),

    /// An invariant was broken inside the runtime or the grain failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Whether the router may transparently retry the call once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::Conflict(_))
    }
}

/// Result alias used across the public API.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
