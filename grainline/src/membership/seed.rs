use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{MembershipError, MembershipProvider, MembershipRequest, MembershipResponse};
use crate::cluster::{ClusterView, NodeDescriptor, NodeStatus, SiloAddress};
use crate::transport::{NodeRequest, NodeResponse, Transport};

/// Membership client for a table hosted by a seed silo.
///
/// Every reply carrying a view newer than the last one seen is published to
/// local subscribers. Heartbeats are answered with the current view, so a
/// silo's own agent keeps its view fresh; [`spawn_poller`](Self::spawn_poller)
/// covers processes that do not heartbeat.
#[derive(Debug)]
pub struct SeedMembership {
    transport: Rc<dyn Transport>,
    seed: SocketAddr,
    publisher: watch::Sender<ClusterView>,
}

impl SeedMembership {
    /// Client talking to the seed at `seed` through `transport`.
    pub fn new(transport: Rc<dyn Transport>, seed: SocketAddr) -> Self {
        let (publisher, _) = watch::channel(ClusterView::new());
        Self {
            transport,
            seed,
            publisher,
        }
    }

    /// Seed endpoint.
    pub fn seed(&self) -> SocketAddr {
        self.seed
    }

    async fn call(&self, request: MembershipRequest) -> Result<MembershipResponse, MembershipError> {
        let response = self
            .transport
            .request(self.seed, NodeRequest::Membership(request))
            .await
            .map_err(|e| MembershipError::Unavailable(format!("seed {}: {e}", self.seed)))?;
        match response {
            NodeResponse::Membership(MembershipResponse::Error(e)) => Err(e),
            NodeResponse::Membership(MembershipResponse::View(view)) => {
                self.observe(&view);
                Ok(MembershipResponse::View(view))
            }
            NodeResponse::Membership(other) => Ok(other),
            other => Err(MembershipError::Unavailable(format!(
                "seed {} answered a membership call with {other:?}",
                self.seed
            ))),
        }
    }

    async fn call_for_view(&self, request: MembershipRequest) -> Result<ClusterView, MembershipError> {
        match self.call(request).await? {
            MembershipResponse::View(view) => Ok(view),
            other => Err(MembershipError::Unavailable(format!(
                "expected a view from seed {}, got {other:?}",
                self.seed
            ))),
        }
    }

    fn observe(&self, view: &ClusterView) {
        self.publisher.send_if_modified(|current| {
            if view.version() > current.version() {
                *current = view.clone();
                true
            } else {
                false
            }
        });
    }

    /// Refresh the view every `interval` on the current `LocalSet`.
    pub fn spawn_poller(self: &Rc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = this.current_view().await {
                    tracing::debug!(seed = %this.seed, error = %e, "view poll failed");
                }
            }
        })
    }
}

#[async_trait::async_trait(?Send)]
impl MembershipProvider for SeedMembership {
    async fn join(&self, descriptor: NodeDescriptor) -> Result<ClusterView, MembershipError> {
        self.call_for_view(MembershipRequest::Join(descriptor)).await
    }

    async fn current_view(&self) -> Result<ClusterView, MembershipError> {
        self.call_for_view(MembershipRequest::View).await
    }

    fn subscribe(&self) -> watch::Receiver<ClusterView> {
        self.publisher.subscribe()
    }

    async fn heartbeat(&self, address: &SiloAddress, load: usize) -> Result<(), MembershipError> {
        self.call(MembershipRequest::Heartbeat {
            address: address.clone(),
            load,
        })
        .await
        .map(|_| ())
    }

    async fn update_status(
        &self,
        address: &SiloAddress,
        status: NodeStatus,
    ) -> Result<ClusterView, MembershipError> {
        self.call_for_view(MembershipRequest::UpdateStatus {
            address: address.clone(),
            status,
        })
        .await
    }

    async fn check_liveness(&self, timeout: Duration) -> Result<Vec<SiloAddress>, MembershipError> {
        match self
            .call(MembershipRequest::CheckLiveness {
                timeout_ms: timeout.as_millis() as u64,
            })
            .await?
        {
            MembershipResponse::Declared(declared) => Ok(declared),
            other => Err(MembershipError::Unavailable(format!(
                "expected a liveness report from seed {}, got {other:?}",
                self.seed
            ))),
        }
    }
}
