//! A silo: one node of the cluster.
//!
//! [`SiloBuilder::start`] wires every component of a node together:
//!
//! ```text
//!                 ┌──────────────────────── Silo ─────────────────────────┐
//!  inbound  ──────► InboundHandler ─┬─ Invoke ────► ActivationManager     │
//!  requests       │                 ├─ Directory ─► GrainDirectory        │
//!                 │                 └─ Membership ► table (seed silo only)│
//!                 │                                                       │
//!  callers ───────► MessageRouter ── cache / directory / placement ──► transport
//!                 │                                                       │
//!                 │  background: view watcher, idle collector, heartbeats │
//!                 └───────────────────────────────────────────────────────┘
//! ```
//!
//! Startup order is: serve inbound requests, join as `Joining`, start the
//! background tasks, then go `Active`. A silo never receives placements
//! before it can answer them.
//!
//! Whenever the set of active silos changes the view watcher reconciles the
//! hosted activations with the directory. Once a view or a heartbeat says
//! this incarnation is dead, the silo fences itself and stops serving
//! grains.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::activation::ActivationManager;
use crate::cluster::{ClusterView, NodeDescriptor, NodeStatus, SiloAddress};
use crate::config::{ClusterConfig, ConfigError, SiloConfig};
use crate::directory::{DistributedDirectory, GrainDirectory};
use crate::grain::DeactivationReason;
use crate::membership::{self, MembershipAgent, MembershipError, MembershipProvider, MembershipResponse};
use crate::router::MessageRouter;
use crate::transport::{NodeRequest, NodeResponse, RequestHandler, Transport, TransportError};

/// Errors starting or stopping a silo.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SiloError {
    /// Invalid or incomplete configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Joining or leaving the cluster failed.
    #[error(transparent)]
    Membership(#[from] MembershipError),

    /// The transport could not serve.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Assembles a [`Silo`].
pub struct SiloBuilder {
    config: SiloConfig,
    cluster: Option<ClusterConfig>,
    transport: Option<Rc<dyn Transport>>,
    directory: Option<Rc<dyn GrainDirectory>>,
    incarnation: Option<u64>,
    host_membership: bool,
}

impl SiloBuilder {
    /// Builder for a silo with `config`.
    pub fn new(config: SiloConfig) -> Self {
        Self {
            config,
            cluster: None,
            transport: None,
            directory: None,
            incarnation: None,
            host_membership: false,
        }
    }

    /// Cluster-wide settings. Required.
    pub fn cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Transport endpoint of this silo. Required.
    pub fn transport(mut self, transport: Rc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use this directory instead of a [`DistributedDirectory`].
    pub fn directory(mut self, directory: Rc<dyn GrainDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Fix the incarnation instead of using the wall clock.
    pub fn incarnation(mut self, incarnation: u64) -> Self {
        self.incarnation = Some(incarnation);
        self
    }

    /// Answer membership requests from other silos with the cluster's
    /// membership provider. Set on the seed silo.
    pub fn host_membership(mut self) -> Self {
        self.host_membership = true;
        self
    }

    /// Start the silo and join the cluster.
    pub async fn start(self) -> Result<Silo, SiloError> {
        self.config.validate()?;
        let cluster = self.cluster.ok_or(ConfigError::Missing("a cluster config"))?;
        let transport = self.transport.ok_or(ConfigError::Missing("a transport"))?;
        let incarnation = self.incarnation.unwrap_or_else(wall_clock_millis);
        let address = SiloAddress::new(self.config.name.as_str(), transport.local_endpoint(), incarnation);
        let membership = cluster.membership().clone();

        let directory: Rc<dyn GrainDirectory> = match self.directory {
            Some(directory) => directory,
            None => Rc::new(DistributedDirectory::new(address.clone(), transport.clone())),
        };
        let router = Rc::new(MessageRouter::new(
            address.clone(),
            transport.clone(),
            directory.clone(),
            membership.clone(),
            cluster.placement().clone(),
            cluster.registry().clone(),
            self.config.request_timeout,
        ));
        let activations = ActivationManager::new(
            address.clone(),
            cluster.registry().clone(),
            directory.clone(),
            cluster.persistence().clone(),
            router.clone(),
            self.config.activation(),
        );

        transport
            .serve(Rc::new(InboundHandler {
                local: address.clone(),
                views: membership.subscribe(),
                activations: activations.clone(),
                directory: directory.clone(),
                membership: self.host_membership.then(|| membership.clone()),
            }))
            .await?;

        let view = membership
            .join(NodeDescriptor::new(address.clone(), NodeStatus::Joining))
            .await?;
        directory.on_view_change(&view).await;
        router.on_view_change(&view);

        let mut tasks = vec![
            spawn_view_watcher(
                membership.as_ref(),
                address.clone(),
                directory.clone(),
                router.clone(),
                activations.clone(),
            ),
            activations.spawn_idle_collector(self.config.collection_interval),
        ];
        let load = {
            let activations = activations.clone();
            Rc::new(move || activations.activation_count())
        };
        let fence = {
            let activations = activations.clone();
            Rc::new(move || {
                activations.fence();
            })
        };
        tasks.push(
            MembershipAgent::new(membership.clone(), address.clone(), self.config.heartbeat, load)
                .on_declared_dead(fence)
                .spawn(),
        );

        let view = membership.update_status(&address, NodeStatus::Active).await?;
        directory.on_view_change(&view).await;
        router.on_view_change(&view);
        tracing::info!(silo = %address, version = %view.version(), "silo started");

        Ok(Silo {
            address,
            membership,
            directory,
            router,
            activations,
            transport,
            tasks: RefCell::new(tasks),
        })
    }
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|elapsed| u64::try_from(elapsed.as_millis()).ok())
        .unwrap_or(1)
}

fn active_set(view: &ClusterView) -> HashSet<SiloAddress> {
    view.active_nodes().into_iter().map(|node| node.address.clone()).collect()
}

fn spawn_view_watcher(
    membership: &dyn MembershipProvider,
    local: SiloAddress,
    directory: Rc<dyn GrainDirectory>,
    router: Rc<MessageRouter>,
    activations: Rc<ActivationManager>,
) -> JoinHandle<()> {
    let mut views = membership.subscribe();
    let mut active = active_set(&views.borrow());
    tokio::task::spawn_local(async move {
        while views.changed().await.is_ok() {
            let view = views.borrow_and_update().clone();
            if view.is_known_dead(&local) {
                activations.fence();
                break;
            }
            tracing::debug!(silo = %local, version = %view.version(), "applying membership view");
            directory.on_view_change(&view).await;
            router.on_view_change(&view);

            let now_active = active_set(&view);
            if now_active != active {
                active = now_active;
                activations.reconcile().await;
            }
        }
    })
}

/// Dispatches inbound requests to the silo's components.
struct InboundHandler {
    local: SiloAddress,
    views: watch::Receiver<ClusterView>,
    activations: Rc<ActivationManager>,
    directory: Rc<dyn GrainDirectory>,
    membership: Option<Rc<dyn MembershipProvider>>,
}

#[async_trait::async_trait(?Send)]
impl RequestHandler for InboundHandler {
    async fn handle(&self, request: NodeRequest) -> NodeResponse {
        match request {
            NodeRequest::Invoke(invoke) => {
                // The watcher may not have seen the view that killed us yet.
                if self.views.borrow().is_known_dead(&self.local) {
                    self.activations.fence();
                }
                self.activations.deliver(invoke).await
            }
            NodeRequest::Evict(entries) => NodeResponse::Evicted(self.activations.evict(&entries)),
            NodeRequest::Directory(request) => NodeResponse::Directory(self.directory.serve(request).await),
            NodeRequest::Membership(request) => NodeResponse::Membership(match &self.membership {
                Some(provider) => membership::serve(provider.as_ref(), request).await,
                None => MembershipResponse::Error(MembershipError::Unavailable(
                    "this silo does not host the membership table".to_string(),
                )),
            }),
        }
    }
}

/// A running node.
pub struct Silo {
    address: SiloAddress,
    membership: Rc<dyn MembershipProvider>,
    directory: Rc<dyn GrainDirectory>,
    router: Rc<MessageRouter>,
    activations: Rc<ActivationManager>,
    transport: Rc<dyn Transport>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
}

impl Silo {
    /// Start building a silo.
    pub fn builder(config: SiloConfig) -> SiloBuilder {
        SiloBuilder::new(config)
    }

    /// Router for calling grains from outside any grain.
    pub fn router(&self) -> &Rc<MessageRouter> {
        &self.router
    }

    /// This silo's address and incarnation.
    pub fn address(&self) -> &SiloAddress {
        &self.address
    }

    /// Activations hosted here.
    pub fn activation_count(&self) -> usize {
        self.activations.activation_count()
    }

    /// Activation table of this silo.
    pub fn activations(&self) -> &Rc<ActivationManager> {
        &self.activations
    }

    /// Directory this silo registers in.
    pub fn directory(&self) -> &Rc<dyn GrainDirectory> {
        &self.directory
    }

    /// Latest membership view this silo has seen.
    pub fn view(&self) -> ClusterView {
        self.membership.subscribe().borrow().clone()
    }

    fn stop_tasks(&self) {
        for task in self.tasks.borrow_mut().drain(..) {
            task.abort();
        }
    }

    /// Leave the cluster gracefully: stop taking placements, deactivate
    /// every grain with [`DeactivationReason::Shutdown`] (flushing dirty
    /// state), unregister and go `Dead`.
    pub async fn shutdown(&self) -> Result<(), SiloError> {
        tracing::info!(silo = %self.address, "silo shutting down");
        if let Err(e) = self.membership.leave(&self.address).await {
            tracing::warn!(silo = %self.address, error = %e, "could not announce leaving");
        }
        let deactivated = self.activations.deactivate_all(DeactivationReason::Shutdown).await;
        self.stop_tasks();
        match self.directory.unregister_silo(&self.address).await {
            Ok(removed) if removed > 0 => {
                tracing::debug!(silo = %self.address, removed, "dropped leftover directory entries");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(silo = %self.address, error = %e, "could not clean directory"),
        }
        let result = self.membership.declare_dead(&self.address).await;
        self.transport.close();
        tracing::info!(silo = %self.address, deactivated, "silo stopped");
        result.map(|_| ()).map_err(SiloError::from)
    }

    /// Crash: abort everything without flushing state or telling anyone.
    /// Peers notice through missed heartbeats.
    pub fn kill(&self) {
        self.stop_tasks();
        let aborted = self.activations.abort_all();
        self.transport.close();
        tracing::warn!(silo = %self.address, aborted, "silo killed");
    }
}

impl Drop for Silo {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

impl std::fmt::Debug for Silo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Silo")
            .field("address", &self.address)
            .field("activations", &self.activations.activation_count())
            .finish_non_exhaustive()
    }
}
