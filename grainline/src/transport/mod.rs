//! Silo-to-silo request/response transport.
//!
//! Every interaction between silos is a [`NodeRequest`] answered by exactly
//! one [`NodeResponse`]: grain invocations, remote directory partition
//! operations, membership calls to a seed silo and evictions of duplicate
//! activations. Responses carry
//! routing signals (`NotMine`, `Moving`) next to the grain's own result so
//! the router can re-resolve without guessing from error strings.
//!
//! Two implementations:
//!
//! - [`LocalNetwork`]: in-process endpoints with kill and partition controls,
//!   used by tests and single-process clusters.
//! - [`TcpTransport`]: length-prefixed, checksummed JSON frames over TCP with
//!   one multiplexed connection per peer.

mod local;
mod tcp;
pub mod wire;

pub use local::{LocalNetwork, LocalTransport};
pub use tcp::TcpTransport;

use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::cluster::SiloAddress;
use crate::directory::{DirectoryEntry, DirectoryRequest, DirectoryResponse};
use crate::error::RuntimeError;
use crate::identity::ActorIdentity;
use crate::membership::{MembershipRequest, MembershipResponse};

/// Errors from the transport itself, never from the remote handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Nothing answers at this endpoint, or the connection broke mid-request.
    #[error("endpoint {0} unreachable")]
    Unreachable(SocketAddr),

    /// The local transport was closed.
    #[error("transport closed")]
    Closed,

    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<TransportError> for RuntimeError {
    fn from(err: TransportError) -> Self {
        RuntimeError::Unavailable(err.to_string())
    }
}

/// A grain invocation addressed to the silo expected to host it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// Target grain.
    pub target: ActorIdentity,
    /// Method name understood by the grain.
    pub method: String,
    /// Serialized argument.
    pub payload: Vec<u8>,
    /// How many times the router already redirected this call.
    pub forward_count: u8,
}

/// Requests a silo accepts from its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRequest {
    /// Deliver a message to a grain activation.
    Invoke(InvokeRequest),
    /// Operate on the directory partition this silo owns.
    Directory(DirectoryRequest),
    /// Operate on the membership table this silo hosts.
    Membership(MembershipRequest),
    /// These activations lost their directory entry to another silo.
    Evict(Vec<DirectoryEntry>),
}

/// Replies to [`NodeRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeResponse {
    /// The grain's reply, or the error it failed with.
    Invoke(Result<Vec<u8>, RuntimeError>),
    /// This silo does not host the grain. `owner` is the registered silo
    /// when known.
    NotMine {
        /// Silo recorded in the directory, if any.
        owner: Option<SiloAddress>,
    },
    /// The activation is being deactivated and did not come back in time.
    Moving,
    /// Directory partition reply.
    Directory(DirectoryResponse),
    /// Membership table reply.
    Membership(MembershipResponse),
    /// How many of the evicted activations started deactivating.
    Evicted(usize),
    /// The peer handled the request but could not send its reply.
    Failed(String),
}

/// Server side of a transport: turns requests into responses.
#[async_trait::async_trait(?Send)]
pub trait RequestHandler {
    /// Answer one request.
    async fn handle(&self, request: NodeRequest) -> NodeResponse;
}

/// Client and server side of silo-to-silo communication.
///
/// No `Send` bounds: transports run on the silo's `LocalSet`.
#[async_trait::async_trait(?Send)]
pub trait Transport: fmt::Debug {
    /// Endpoint peers use to reach this transport.
    fn local_endpoint(&self) -> SocketAddr;

    /// Send a request and wait for its response.
    async fn request(&self, to: SocketAddr, request: NodeRequest) -> Result<NodeResponse, TransportError>;

    /// Start answering inbound requests with `handler`.
    async fn serve(&self, handler: Rc<dyn RequestHandler>) -> Result<(), TransportError>;

    /// Stop serving and fail in-flight inbound requests.
    fn close(&self);
}
