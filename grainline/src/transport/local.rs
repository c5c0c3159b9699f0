use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::task::AbortHandle;

use super::{NodeRequest, NodeResponse, RequestHandler, Transport, TransportError};

/// In-process network connecting silos of one process.
///
/// Requests and responses go through a JSON round trip so nothing shared is
/// smuggled between silos. Each inbound request runs in its own local task,
/// which is aborted if the target endpoint is killed mid-request.
#[derive(Default)]
pub struct LocalNetwork {
    inner: RefCell<NetworkState>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<SocketAddr, Rc<dyn RequestHandler>>,
    in_flight: HashMap<SocketAddr, Vec<AbortHandle>>,
    partitions: HashSet<(SocketAddr, SocketAddr)>,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("LocalNetwork")
            .field("endpoints", &state.endpoints.keys().collect::<Vec<_>>())
            .field("partitions", &state.partitions)
            .finish()
    }
}

fn ordered(a: SocketAddr, b: SocketAddr) -> (SocketAddr, SocketAddr) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl LocalNetwork {
    /// Empty network.
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// A transport bound to `endpoint` on this network.
    pub fn endpoint(self: &Rc<Self>, endpoint: SocketAddr) -> Rc<LocalTransport> {
        Rc::new(LocalTransport {
            network: self.clone(),
            local: endpoint,
        })
    }

    /// Unbind an endpoint and abort the requests it is serving.
    pub fn kill(&self, endpoint: SocketAddr) {
        let aborted = {
            let mut state = self.inner.borrow_mut();
            state.endpoints.remove(&endpoint);
            state.in_flight.remove(&endpoint).unwrap_or_default()
        };
        tracing::debug!(%endpoint, aborted = aborted.len(), "endpoint killed");
        for handle in aborted {
            handle.abort();
        }
    }

    /// Drop all traffic between two endpoints, both directions.
    pub fn partition(&self, a: SocketAddr, b: SocketAddr) {
        self.inner.borrow_mut().partitions.insert(ordered(a, b));
    }

    /// Undo [`partition`](Self::partition).
    pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
        self.inner.borrow_mut().partitions.remove(&ordered(a, b));
    }

    /// Whether a handler is bound at `endpoint`.
    pub fn is_bound(&self, endpoint: SocketAddr) -> bool {
        self.inner.borrow().endpoints.contains_key(&endpoint)
    }

    async fn deliver(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        request: NodeRequest,
    ) -> Result<NodeResponse, TransportError> {
        let handler = {
            let state = self.inner.borrow();
            if state.partitions.contains(&ordered(from, to)) {
                return Err(TransportError::Unreachable(to));
            }
            state
                .endpoints
                .get(&to)
                .cloned()
                .ok_or(TransportError::Unreachable(to))?
        };

        let request: NodeRequest = reencode(&request)?;
        let task = tokio::task::spawn_local(async move { handler.handle(request).await });
        {
            let mut state = self.inner.borrow_mut();
            let handles = state.in_flight.entry(to).or_default();
            handles.retain(|h| !h.is_finished());
            handles.push(task.abort_handle());
        }
        let response = task.await.map_err(|_| TransportError::Unreachable(to))?;

        if self.inner.borrow().partitions.contains(&ordered(from, to)) {
            return Err(TransportError::Unreachable(to));
        }
        reencode(&response)
    }
}

fn reencode<T: serde::Serialize + serde::de::DeserializeOwned>(value: &T) -> Result<T, TransportError> {
    let bytes = serde_json::to_vec(value).map_err(|e| TransportError::Codec(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Codec(e.to_string()))
}

/// One silo's attachment to a [`LocalNetwork`].
#[derive(Debug)]
pub struct LocalTransport {
    network: Rc<LocalNetwork>,
    local: SocketAddr,
}

#[async_trait::async_trait(?Send)]
impl Transport for LocalTransport {
    fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    async fn request(&self, to: SocketAddr, request: NodeRequest) -> Result<NodeResponse, TransportError> {
        self.network.deliver(self.local, to, request).await
    }

    async fn serve(&self, handler: Rc<dyn RequestHandler>) -> Result<(), TransportError> {
        let mut state = self.network.inner.borrow_mut();
        if state.endpoints.contains_key(&self.local) {
            return Err(TransportError::Io(format!("endpoint {} already bound", self.local)));
        }
        state.endpoints.insert(self.local, handler);
        Ok(())
    }

    fn close(&self) {
        self.network.kill(self.local);
    }
}
