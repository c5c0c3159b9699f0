use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;

use super::wire::{read_message, write_message, WireBody, WireError, WireMessage};
use super::{NodeRequest, NodeResponse, RequestHandler, Transport, TransportError};

type Pending = RefCell<HashMap<u64, oneshot::Sender<NodeResponse>>>;

/// Removes a request's waiter once its caller stops waiting, answered or
/// not.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.borrow_mut().remove(&self.id);
    }
}

/// Outbound connection to one peer, multiplexing concurrent requests.
struct PeerConnection {
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    reader: RefCell<Option<AbortHandle>>,
}

impl PeerConnection {
    fn fail_all(&self) {
        // Dropping the senders wakes every waiter with an error.
        self.pending.borrow_mut().clear();
    }
}

/// TCP transport. One listener for inbound peers, one lazily opened
/// connection per outbound peer.
pub struct TcpTransport {
    local: SocketAddr,
    listener: RefCell<Option<TcpListener>>,
    tasks: Rc<RefCell<Vec<AbortHandle>>>,
    peers: Rc<RefCell<HashMap<SocketAddr, Rc<PeerConnection>>>>,
    connecting: Mutex<()>,
    next_id: Cell<u64>,
    closed: Cell<bool>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local", &self.local)
            .field("peers", &self.peers.borrow().len())
            .field("closed", &self.closed.get())
            .finish()
    }
}

fn io_error(err: std::io::Error) -> TransportError {
    TransportError::Io(err.to_string())
}

fn track(tasks: &RefCell<Vec<AbortHandle>>, handle: AbortHandle) {
    let mut tasks = tasks.borrow_mut();
    tasks.retain(|h| !h.is_finished());
    tasks.push(handle);
}

impl TcpTransport {
    /// Bind the listener. Use port 0 to let the OS pick one; the chosen
    /// endpoint is then available from [`Transport::local_endpoint`].
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(io_error)?;
        let local = listener.local_addr().map_err(io_error)?;
        tracing::info!(%local, "tcp transport bound");
        Ok(Self {
            local,
            listener: RefCell::new(Some(listener)),
            tasks: Rc::new(RefCell::new(Vec::new())),
            peers: Rc::new(RefCell::new(HashMap::new())),
            connecting: Mutex::new(()),
            next_id: Cell::new(1),
            closed: Cell::new(false),
        })
    }

    fn cached_peer(&self, to: SocketAddr) -> Option<Rc<PeerConnection>> {
        self.peers.borrow().get(&to).cloned()
    }

    async fn peer(&self, to: SocketAddr) -> Result<Rc<PeerConnection>, TransportError> {
        if let Some(peer) = self.cached_peer(to) {
            return Ok(peer);
        }
        let _connecting = self.connecting.lock().await;
        if let Some(peer) = self.cached_peer(to) {
            return Ok(peer);
        }
        let stream = TcpStream::connect(to)
            .await
            .map_err(|_| TransportError::Unreachable(to))?;
        stream.set_nodelay(true).map_err(io_error)?;
        let (read_half, write_half) = stream.into_split();
        let peer = Rc::new(PeerConnection {
            writer: Mutex::new(write_half),
            pending: RefCell::new(HashMap::new()),
            reader: RefCell::new(None),
        });
        let reader = tokio::task::spawn_local(read_responses(
            to,
            read_half,
            peer.clone(),
            self.peers.clone(),
        ));
        *peer.reader.borrow_mut() = Some(reader.abort_handle());
        self.peers.borrow_mut().insert(to, peer.clone());
        tracing::debug!(local = %self.local, peer = %to, "connected");
        Ok(peer)
    }

    /// Requests sent and still waiting for their reply.
    pub(crate) fn pending_requests(&self) -> usize {
        self.peers.borrow().values().map(|peer| peer.pending.borrow().len()).sum()
    }

    fn drop_peer(&self, to: SocketAddr) {
        if let Some(peer) = self.peers.borrow_mut().remove(&to) {
            if let Some(reader) = peer.reader.borrow_mut().take() {
                reader.abort();
            }
            peer.fail_all();
        }
    }
}

async fn read_responses(
    peer_addr: SocketAddr,
    mut reader: OwnedReadHalf,
    peer: Rc<PeerConnection>,
    peers: Rc<RefCell<HashMap<SocketAddr, Rc<PeerConnection>>>>,
) {
    loop {
        match read_message(&mut reader).await {
            Ok(Some(WireMessage {
                id,
                body: WireBody::Response(response),
            })) => {
                let waiter = peer.pending.borrow_mut().remove(&id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(response);
                }
            }
            Ok(Some(_)) => {
                tracing::warn!(peer = %peer_addr, "unexpected request on outbound connection");
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(peer = %peer_addr, error = %e, "outbound connection failed");
                break;
            }
        }
    }
    let mut peers = peers.borrow_mut();
    if peers.get(&peer_addr).is_some_and(|p| Rc::ptr_eq(p, &peer)) {
        peers.remove(&peer_addr);
    }
    peer.fail_all();
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    handler: Rc<dyn RequestHandler>,
    tasks: Rc<RefCell<Vec<AbortHandle>>>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%remote, error = %e, "set_nodelay failed");
    }
    let (mut reader, writer) = stream.into_split();
    let writer = Rc::new(Mutex::new(writer));
    loop {
        let message = match read_message(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%remote, error = %e, "inbound connection failed");
                break;
            }
        };
        let WireBody::Request(request) = message.body else {
            tracing::warn!(%remote, "unexpected response on inbound connection");
            continue;
        };
        let handler = handler.clone();
        let writer = writer.clone();
        let id = message.id;
        let task = tokio::task::spawn_local(async move {
            let response = handler.handle(request).await;
            let reply = WireMessage {
                id,
                body: WireBody::Response(response),
            };
            let mut writer = writer.lock().await;
            match write_message(&mut *writer, &reply).await {
                Ok(()) => {}
                // Nothing reached the socket: tell the caller instead of
                // leaving it waiting.
                Err(e @ (WireError::Codec(_) | WireError::FrameTooLarge { .. })) => {
                    tracing::warn!(%remote, id, error = %e, "response could not be encoded");
                    let failed = WireMessage {
                        id,
                        body: WireBody::Response(NodeResponse::Failed(format!("response could not be sent: {e}"))),
                    };
                    if let Err(e) = write_message(&mut *writer, &failed).await {
                        tracing::debug!(%remote, error = %e, "failed to write error response");
                    }
                }
                Err(e) => tracing::debug!(%remote, error = %e, "failed to write response"),
            }
        });
        track(&tasks, task.abort_handle());
    }
}

fn wire_error(to: SocketAddr, err: WireError) -> TransportError {
    match err {
        WireError::Codec(e) => TransportError::Codec(e.to_string()),
        WireError::FrameTooLarge { .. } => TransportError::Codec(err.to_string()),
        _ => TransportError::Unreachable(to),
    }
}

#[async_trait::async_trait(?Send)]
impl Transport for TcpTransport {
    fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    async fn request(&self, to: SocketAddr, request: NodeRequest) -> Result<NodeResponse, TransportError> {
        if self.closed.get() {
            return Err(TransportError::Closed);
        }
        let peer = self.peer(to).await?;
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let (tx, rx) = oneshot::channel();
        peer.pending.borrow_mut().insert(id, tx);
        let _waiting = PendingGuard {
            pending: &peer.pending,
            id,
        };
        let message = WireMessage {
            id,
            body: WireBody::Request(request),
        };
        let written = {
            let mut writer = peer.writer.lock().await;
            write_message(&mut *writer, &message).await
        };
        if let Err(e) = written {
            let err = wire_error(to, e);
            if matches!(err, TransportError::Unreachable(_)) {
                self.drop_peer(to);
            }
            return Err(err);
        }
        rx.await.map_err(|_| TransportError::Unreachable(to))
    }

    async fn serve(&self, handler: Rc<dyn RequestHandler>) -> Result<(), TransportError> {
        let listener = self
            .listener
            .borrow_mut()
            .take()
            .ok_or_else(|| TransportError::Io("transport already serving".into()))?;
        let tasks = self.tasks.clone();
        let local = self.local;
        let accept = tokio::task::spawn_local(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tracing::debug!(%local, %remote, "accepted connection");
                        let task = tokio::task::spawn_local(serve_connection(
                            stream,
                            remote,
                            handler.clone(),
                            tasks.clone(),
                        ));
                        track(&tasks, task.abort_handle());
                    }
                    Err(e) => {
                        tracing::warn!(%local, error = %e, "accept failed");
                    }
                }
            }
        });
        track(&self.tasks, accept.abort_handle());
        Ok(())
    }

    fn close(&self) {
        self.closed.set(true);
        self.listener.borrow_mut().take();
        for task in self.tasks.borrow_mut().drain(..) {
            task.abort();
        }
        let peers: Vec<SocketAddr> = self.peers.borrow().keys().copied().collect();
        for peer in peers {
            self.drop_peer(peer);
        }
        tracing::info!(local = %self.local, "tcp transport closed");
    }
}
