//! The grain programming model.
//!
//! A [`Grain`] is user code addressed by an [`ActorIdentity`]. The runtime
//! activates it on demand, feeds it one message at a time through
//! [`Grain::handle`], and deactivates it when idle. Grains never see where
//! they run; they talk to other grains through the router on their
//! [`GrainContext`].
//!
//! # Example
//!
//! ```rust,ignore
//! #[derive(Default)]
//! struct Counter;
//!
//! #[async_trait::async_trait(?Send)]
//! impl Grain for Counter {
//!     async fn handle(&mut self, ctx: &mut GrainContext, method: &str, payload: &[u8])
//!         -> Result<Vec<u8>, GrainError>
//!     {
//!         match method {
//!             "add" => {
//!                 let delta: i64 = decode(payload)?;
//!                 let total = ctx.state().get::<i64>()?.unwrap_or(0) + delta;
//!                 ctx.state_mut().set(&total)?;
//!                 ctx.state_mut().write().await?;
//!                 encode(&total)
//!             }
//!             other => Err(GrainError::UnknownMethod(other.to_string())),
//!         }
//!     }
//! }
//! ```

mod registry;
mod state;

pub use registry::{GrainFactory, GrainOptions, GrainRegistration, GrainRegistry};
pub use state::GrainState;

use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::identity::ActorIdentity;
use crate::persistence::StorageError;
use crate::router::MessageRouter;

/// Errors a grain returns from its hooks.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GrainError {
    /// The grain does not understand the method.
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    /// The payload could not be decoded.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Domain-level "does not exist".
    #[error("not found: {0}")]
    NotFound(String),

    /// The grain kind has no storage provider.
    #[error("grain kind has no storage provider")]
    NoStorage,

    /// Persisting or loading state failed.
    #[error(transparent)]
    State(#[from] StorageError),

    /// A call to another grain failed.
    #[error(transparent)]
    Call(#[from] RuntimeError),

    /// Anything else.
    #[error("{0}")]
    Failed(String),
}

impl From<serde_json::Error> for GrainError {
    fn from(err: serde_json::Error) -> Self {
        GrainError::InvalidPayload(err.to_string())
    }
}

impl From<GrainError> for RuntimeError {
    fn from(err: GrainError) -> Self {
        match err {
            GrainError::UnknownMethod(_) | GrainError::InvalidPayload(_) | GrainError::NoStorage => {
                RuntimeError::InvalidRequest(err.to_string())
            }
            GrainError::NotFound(what) => RuntimeError::NotFound(what),
            GrainError::State(e) => e.into(),
            GrainError::Call(e) => e,
            GrainError::Failed(msg) => RuntimeError::Internal(msg),
        }
    }
}

/// Why an activation is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeactivationReason {
    /// The grain asked for it via [`GrainContext::deactivate_on_idle`].
    Requested,
    /// No message arrived within the idle timeout.
    IdleTimeout,
    /// The hosting silo is shutting down.
    Shutdown,
    /// Another activation of the same identity holds the directory entry.
    /// State is not flushed.
    Duplicate,
}

/// User code behind a grain identity.
///
/// Hooks run one at a time on the activation's own task; a grain never
/// handles two messages concurrently.
#[async_trait::async_trait(?Send)]
pub trait Grain: 'static {
    /// Called once after state was loaded, before the first message.
    async fn on_activate(&mut self, _ctx: &mut GrainContext) -> Result<(), GrainError> {
        Ok(())
    }

    /// Handle one message.
    async fn handle(
        &mut self,
        ctx: &mut GrainContext,
        method: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, GrainError>;

    /// Called once before the activation goes away. Dirty state is flushed
    /// after this hook returns.
    async fn on_deactivate(
        &mut self,
        _ctx: &mut GrainContext,
        _reason: DeactivationReason,
    ) -> Result<(), GrainError> {
        Ok(())
    }
}

/// What a grain can see and do from inside its hooks.
pub struct GrainContext {
    identity: ActorIdentity,
    state: GrainState,
    router: Rc<MessageRouter>,
    deactivate_requested: bool,
}

impl GrainContext {
    pub(crate) fn new(identity: ActorIdentity, state: GrainState, router: Rc<MessageRouter>) -> Self {
        Self {
            identity,
            state,
            router,
            deactivate_requested: false,
        }
    }

    /// This grain's identity.
    pub fn identity(&self) -> &ActorIdentity {
        &self.identity
    }

    /// Persistent state.
    pub fn state(&self) -> &GrainState {
        &self.state
    }

    /// Persistent state, mutably.
    pub fn state_mut(&mut self) -> &mut GrainState {
        &mut self.state
    }

    /// Router for calling other grains.
    pub fn router(&self) -> &Rc<MessageRouter> {
        &self.router
    }

    /// Deactivate once the current message is done.
    pub fn deactivate_on_idle(&mut self) {
        self.deactivate_requested = true;
    }

    pub(crate) fn take_deactivation_request(&mut self) -> bool {
        std::mem::take(&mut self.deactivate_requested)
    }
}

/// Encode a reply or argument with the runtime's codec.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, GrainError> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a payload with the runtime's codec.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, GrainError> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grain_errors_map_to_runtime_errors() {
        assert!(matches!(
            RuntimeError::from(GrainError::UnknownMethod("fly".into())),
            RuntimeError::InvalidRequest(_)
        ));
        assert_eq!(
            RuntimeError::from(GrainError::NotFound("ABC123".into())),
            RuntimeError::NotFound("ABC123".into())
        );
        assert!(matches!(
            RuntimeError::from(GrainError::State(StorageError::Conflict { expected: 1, actual: 2 })),
            RuntimeError::Conflict(_)
        ));
        let inner = RuntimeError::Timeout("downstream".into());
        assert_eq!(RuntimeError::from(GrainError::Call(inner.clone())), inner);
    }

    #[test]
    fn bad_payload_is_invalid() {
        let err = decode::<u64>(b"not json").expect_err("garbage");
        assert!(matches!(err, GrainError::InvalidPayload(_)));
    }
}
