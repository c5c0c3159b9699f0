//! Caller-side message routing.
//!
//! [`MessageRouter`] turns "call method M on identity I" into a request to
//! the silo hosting I. The location comes from the local cache, then the
//! directory, then a fresh placement decision. Stale locations are
//! expected: the target answers `NotMine` (with the real owner when it
//! knows it) or `Moving`, or is simply unreachable. The router then drops
//! the cached location and tries exactly once more. A second failure is
//! returned to the caller.

use std::rc::Rc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cluster::{ClusterView, SiloAddress};
use crate::directory::{DirectoryCache, GrainDirectory};
use crate::error::{RuntimeError, RuntimeResult};
use crate::grain::GrainRegistry;
use crate::identity::ActorIdentity;
use crate::membership::MembershipProvider;
use crate::placement::{PlacementDirector, PlacementStrategy};
use crate::transport::{InvokeRequest, NodeRequest, NodeResponse, Transport};

/// Routes grain calls to the silo hosting each activation.
#[derive(Debug)]
pub struct MessageRouter {
    local: SiloAddress,
    transport: Rc<dyn Transport>,
    directory: Rc<dyn GrainDirectory>,
    membership: Rc<dyn MembershipProvider>,
    placement: Rc<dyn PlacementDirector>,
    registry: Rc<GrainRegistry>,
    cache: DirectoryCache,
    request_timeout: Duration,
}

/// What went wrong with one attempt.
enum Miss {
    Retry(String),
    Conflict(String),
}

impl MessageRouter {
    /// Router for calls made from the silo at `local`.
    pub fn new(
        local: SiloAddress,
        transport: Rc<dyn Transport>,
        directory: Rc<dyn GrainDirectory>,
        membership: Rc<dyn MembershipProvider>,
        placement: Rc<dyn PlacementDirector>,
        registry: Rc<GrainRegistry>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            local,
            transport,
            directory,
            membership,
            placement,
            registry,
            cache: DirectoryCache::new(),
            request_timeout,
        }
    }

    /// Silo this router sends from.
    pub fn local(&self) -> &SiloAddress {
        &self.local
    }

    /// Default deadline of [`send`](Self::send).
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Cached location of `identity`, if any.
    pub fn cached_location(&self, identity: &ActorIdentity) -> Option<SiloAddress> {
        self.cache.get(identity)
    }

    /// Invoke `method` with a raw payload under the default deadline.
    pub async fn send(&self, identity: &ActorIdentity, method: &str, payload: Vec<u8>) -> RuntimeResult<Vec<u8>> {
        self.send_with_deadline(identity, method, payload, self.request_timeout)
            .await
    }

    /// Invoke `method` with a raw payload, failing with `Timeout` once
    /// `deadline` has passed. The deadline covers the retry.
    pub async fn send_with_deadline(
        &self,
        identity: &ActorIdentity,
        method: &str,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> RuntimeResult<Vec<u8>> {
        identity.validate()?;
        let strategy = self.registry.lookup(identity)?.options.placement;
        match tokio::time::timeout(deadline, self.route(identity, method, payload, strategy)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(identity = %identity, method, ?deadline, "call timed out");
                Err(RuntimeError::Timeout(format!(
                    "{identity}.{method} did not complete within {deadline:?}"
                )))
            }
        }
    }

    /// Typed call: JSON-encode `request`, decode the reply.
    pub async fn call<Req, Resp>(&self, identity: &ActorIdentity, method: &str, request: &Req) -> RuntimeResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)
            .map_err(|e| RuntimeError::InvalidRequest(format!("cannot encode argument: {e}")))?;
        let reply = self.send(identity, method, payload).await?;
        serde_json::from_slice(&reply).map_err(|e| RuntimeError::Internal(format!("cannot decode reply: {e}")))
    }

    async fn route(
        &self,
        identity: &ActorIdentity,
        method: &str,
        payload: Vec<u8>,
        strategy: PlacementStrategy,
    ) -> RuntimeResult<Vec<u8>> {
        let mut redirect: Option<SiloAddress> = None;
        let mut last_miss = None;
        for forward_count in 0..2u8 {
            let target = match redirect.take() {
                Some(owner) => owner,
                None => self.locate(identity, strategy).await?,
            };
            let request = NodeRequest::Invoke(InvokeRequest {
                target: identity.clone(),
                method: method.to_string(),
                payload: payload.clone(),
                forward_count,
            });
            let miss = match self.transport.request(target.endpoint, request).await {
                Ok(NodeResponse::Invoke(Ok(reply))) => {
                    self.cache.insert(identity.clone(), target);
                    return Ok(reply);
                }
                Ok(NodeResponse::Invoke(Err(RuntimeError::Conflict(msg)))) => Miss::Conflict(msg),
                Ok(NodeResponse::Invoke(Err(e))) => {
                    // The activation exists there; the grain itself failed.
                    self.cache.insert(identity.clone(), target);
                    return Err(e);
                }
                Ok(NodeResponse::NotMine { owner }) => {
                    redirect = owner.filter(|owner| *owner != target);
                    Miss::Retry(format!("{target} does not host {identity}"))
                }
                Ok(NodeResponse::Moving) => Miss::Retry(format!("{identity} is moving off {target}")),
                Ok(NodeResponse::Failed(reason)) => return Err(RuntimeError::Internal(reason)),
                Ok(other) => {
                    return Err(RuntimeError::Internal(format!(
                        "unexpected reply to an invocation: {other:?}"
                    )))
                }
                Err(e) => Miss::Retry(format!("{target}: {e}")),
            };
            self.cache.invalidate(identity);
            match &miss {
                Miss::Retry(reason) | Miss::Conflict(reason) => {
                    tracing::debug!(identity = %identity, method, forward_count, reason = %reason, "call missed, re-resolving");
                }
            }
            last_miss = Some(miss);
        }
        Err(match last_miss {
            Some(Miss::Conflict(reason)) => RuntimeError::Conflict(reason),
            Some(Miss::Retry(reason)) => {
                RuntimeError::Unavailable(format!("{identity}.{method} failed after retry: {reason}"))
            }
            None => RuntimeError::Unavailable(format!("{identity}.{method} was never attempted")),
        })
    }

    /// Cache, then directory, then a new placement.
    async fn locate(&self, identity: &ActorIdentity, strategy: PlacementStrategy) -> RuntimeResult<SiloAddress> {
        if let Some(silo) = self.cache.get(identity) {
            return Ok(silo);
        }
        if let Some(entry) = self.directory.resolve(identity).await? {
            return Ok(entry.silo);
        }
        let view = self.membership.current_view().await?;
        let silo = self.placement.place(strategy, identity, &view, &self.local).await?;
        tracing::trace!(identity = %identity, silo = %silo, "placed");
        Ok(silo)
    }

    /// Drop cached locations on silos `view` proves dead.
    pub fn on_view_change(&self, view: &ClusterView) {
        self.cache.retain_live(view);
    }
}
