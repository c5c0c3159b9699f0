//! Activation manager: the per-silo table of live grain activations.
//!
//! # Lifecycle
//!
//! ```text
//!             first message
//!   (absent) ───────────────► Activating ──► Valid ──► Deactivating ──► (absent)
//!                                 │   register + load      idle, requested,
//!                                 │   run concurrently     or shutdown
//!                                 ▼
//!                       lost the race: NotMine(winner)
//! ```
//!
//! Concurrent first messages for one identity share a single activation
//! attempt. Activation registers in the directory and loads persistent
//! state at the same time; if the registration is lost the loaded state is
//! dropped and the caller is pointed at the winner.
//!
//! Each activation owns a task that drains its mailbox one message at a
//! time. A deactivation command preempts queued messages: they are answered
//! with `Moving`, the grain's `on_deactivate` runs, dirty state is flushed
//! and the directory entry is removed. A message arriving while an identity
//! is deactivating waits for it to finish, then reactivates.
//!
//! After the directory ring changes, [`ActivationManager::reconcile`]
//! re-registers every hosted activation with its partition's new owner and
//! deactivates the ones another silo now holds. A silo that learns it was
//! declared dead is [fenced](ActivationManager::fence): everything is
//! aborted and every later message is answered `NotMine`.

mod record;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use futures::future::{LocalBoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use record::{ActivationHandle, ActivationRecord, Deactivate, Envelope, Reply};

use crate::cluster::SiloAddress;
use crate::directory::{ActivationEpoch, DirectoryEntry, DirectoryError, GrainDirectory, RegisterOutcome};
use crate::error::RuntimeError;
use crate::grain::{DeactivationReason, GrainContext, GrainRegistry, GrainState};
use crate::identity::ActorIdentity;
use crate::persistence::PersistenceCoordinator;
use crate::router::MessageRouter;
use crate::transport::{InvokeRequest, NodeResponse};

/// Where an identity is in its local lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    /// Registering and loading state.
    Activating,
    /// Processing messages.
    Valid,
    /// Draining and flushing.
    Deactivating,
}

/// Activation tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationConfig {
    /// Idle time after which an activation is collected.
    pub idle_timeout: Duration,
    /// Messages queued per activation before senders wait.
    pub mailbox_capacity: usize,
    /// How long a message waits for a deactivation to finish.
    pub deactivation_timeout: Duration,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            mailbox_capacity: 128,
            deactivation_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
enum ActivationFailure {
    NotMine(Option<SiloAddress>),
    Moving,
    Failed(RuntimeError),
}

type PendingActivation = Shared<LocalBoxFuture<'static, Result<Rc<ActivationHandle>, ActivationFailure>>>;

#[derive(Clone)]
enum Slot {
    Activating(PendingActivation),
    Valid(Rc<ActivationHandle>),
    Deactivating {
        handle: Rc<ActivationHandle>,
        done: watch::Receiver<bool>,
    },
}

impl Slot {
    fn handle(&self) -> Option<&Rc<ActivationHandle>> {
        match self {
            Slot::Activating(_) => None,
            Slot::Valid(handle) | Slot::Deactivating { handle, .. } => Some(handle),
        }
    }
}

/// Hosts the activations of one silo.
pub struct ActivationManager {
    local: SiloAddress,
    registry: Rc<GrainRegistry>,
    directory: Rc<dyn GrainDirectory>,
    persistence: Rc<PersistenceCoordinator>,
    router: Rc<MessageRouter>,
    config: ActivationConfig,
    slots: RefCell<HashMap<ActorIdentity, Slot>>,
    next_epoch: Cell<u64>,
    accepting: Cell<bool>,
    fenced: Cell<bool>,
    // Set when a re-registration failed and must be retried.
    reconcile_pending: Cell<bool>,
}

impl std::fmt::Debug for ActivationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationManager")
            .field("local", &self.local)
            .field("activations", &self.slots.borrow().len())
            .field("accepting", &self.accepting.get())
            .field("fenced", &self.fenced.get())
            .finish_non_exhaustive()
    }
}

impl ActivationManager {
    /// Manager for the silo at `local`.
    pub fn new(
        local: SiloAddress,
        registry: Rc<GrainRegistry>,
        directory: Rc<dyn GrainDirectory>,
        persistence: Rc<PersistenceCoordinator>,
        router: Rc<MessageRouter>,
        config: ActivationConfig,
    ) -> Rc<Self> {
        Rc::new(Self {
            local,
            registry,
            directory,
            persistence,
            router,
            config,
            slots: RefCell::new(HashMap::new()),
            next_epoch: Cell::new(1),
            accepting: Cell::new(true),
            fenced: Cell::new(false),
            reconcile_pending: Cell::new(false),
        })
    }

    /// Deliver an inbound invocation, activating the target if needed.
    pub async fn deliver(self: &Rc<Self>, request: InvokeRequest) -> NodeResponse {
        let InvokeRequest {
            target,
            method,
            payload,
            forward_count,
        } = request;
        if self.fenced.get() {
            return NodeResponse::NotMine { owner: None };
        }
        if let Err(e) = target.validate().and_then(|()| self.registry.lookup(&target).map(|_| ())) {
            return NodeResponse::Invoke(Err(e));
        }
        tracing::trace!(identity = %target, method = %method, forward_count, "delivering");

        // A message that raced a deactivation gets one local retry.
        for _ in 0..2 {
            let handle = match self.get_or_activate(&target).await {
                Ok(handle) => handle,
                Err(ActivationFailure::NotMine(owner)) => return NodeResponse::NotMine { owner },
                Err(ActivationFailure::Moving) => return NodeResponse::Moving,
                Err(ActivationFailure::Failed(e)) => return NodeResponse::Invoke(Err(e)),
            };
            match handle.invoke(method.clone(), payload.clone()).await {
                Reply::Done(result) => return NodeResponse::Invoke(result),
                Reply::Moving => {
                    tracing::debug!(identity = %target, "activation went away under a message, retrying");
                }
            }
        }
        NodeResponse::Moving
    }

    async fn get_or_activate(self: &Rc<Self>, identity: &ActorIdentity) -> Result<Rc<ActivationHandle>, ActivationFailure> {
        loop {
            let slot = self.slots.borrow().get(identity).cloned();
            match slot {
                Some(Slot::Valid(handle)) => return Ok(handle),
                Some(Slot::Activating(pending)) => return pending.await,
                Some(Slot::Deactivating { handle, mut done }) => {
                    let waited = tokio::time::timeout(self.config.deactivation_timeout, done.wait_for(|d| *d)).await;
                    if waited.is_err() {
                        tracing::warn!(identity = %identity, "deactivation did not finish in time");
                        return Err(ActivationFailure::Moving);
                    }
                    self.forget(&handle);
                }
                None => {
                    if !self.accepting.get() {
                        return Err(ActivationFailure::Moving);
                    }
                    let pending = self.clone().activate(identity.clone()).boxed_local().shared();
                    self.slots
                        .borrow_mut()
                        .insert(identity.clone(), Slot::Activating(pending.clone()));
                    return pending.await;
                }
            }
        }
    }

    async fn activate(self: Rc<Self>, identity: ActorIdentity) -> Result<Rc<ActivationHandle>, ActivationFailure> {
        let result = self.create_activation(&identity).await;
        let mut slots = self.slots.borrow_mut();
        let still_wanted = matches!(slots.get(&identity), Some(Slot::Activating(_)));
        match &result {
            Ok(handle) if still_wanted => {
                slots.insert(identity, Slot::Valid(handle.clone()));
            }
            Ok(handle) => {
                // The silo was killed while this activation was being set up.
                handle.abort();
                return Err(ActivationFailure::Moving);
            }
            Err(_) => {
                if still_wanted {
                    slots.remove(&identity);
                }
            }
        }
        result
    }

    async fn create_activation(self: &Rc<Self>, identity: &ActorIdentity) -> Result<Rc<ActivationHandle>, ActivationFailure> {
        let registration = self
            .registry
            .lookup(identity)
            .map_err(ActivationFailure::Failed)?
            .clone();
        let epoch = ActivationEpoch(self.next_epoch.replace(self.next_epoch.get() + 1));
        let entry = DirectoryEntry::new(identity.clone(), self.local.clone(), epoch);
        let provider = registration.options.storage_provider.clone();

        let load = async {
            match &provider {
                Some(name) => self.persistence.load(identity, name).await.map_err(RuntimeError::from),
                None => Ok(None),
            }
        };
        let (registered, loaded) = futures::join!(self.register(entry), load);
        let entry = match registered {
            Ok(entry) => entry,
            Err(failure) => {
                if let ActivationFailure::NotMine(Some(winner)) = &failure {
                    tracing::debug!(identity = %identity, winner = %winner, "lost activation race, dropping loaded state");
                }
                return Err(failure);
            }
        };
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "state load failed, activation aborted");
                self.release(&entry).await;
                return Err(ActivationFailure::Failed(e));
            }
        };

        let mut grain = registration.create(identity);
        let state = GrainState::new(identity.clone(), provider, loaded, self.persistence.clone());
        let mut ctx = GrainContext::new(identity.clone(), state, self.router.clone());
        if let Err(e) = grain.on_activate(&mut ctx).await {
            tracing::warn!(identity = %identity, error = %e, "on_activate failed");
            self.release(&entry).await;
            return Err(ActivationFailure::Failed(e.into()));
        }

        let (mailbox_tx, mailbox_rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = Rc::new(ActivationHandle::new(entry, mailbox_tx, control_tx));
        let record = ActivationRecord {
            grain,
            ctx,
            request_seq: 0,
        };
        let task = tokio::task::spawn_local(self.clone().run(handle.clone(), record, mailbox_rx, control_rx));
        handle.set_task(task.abort_handle());
        tracing::debug!(identity = %identity, silo = %self.local, epoch = %epoch, "grain activated");
        Ok(handle)
    }

    /// Win the directory entry for `entry.identity`, or learn who did.
    async fn register(&self, entry: DirectoryEntry) -> Result<DirectoryEntry, ActivationFailure> {
        let failed = |e: DirectoryError| ActivationFailure::Failed(e.into());
        match self.directory.try_register(entry.clone()).await.map_err(failed)? {
            RegisterOutcome::Registered(entry) => Ok(entry),
            RegisterOutcome::Conflict(winner) if winner.silo == self.local => {
                // Left behind by a local activation whose unregister never landed.
                tracing::debug!(identity = %winner.identity, epoch = %winner.epoch, "replacing stale local entry");
                self.directory.unregister(&winner).await.map_err(failed)?;
                match self.directory.try_register(entry).await.map_err(failed)? {
                    RegisterOutcome::Registered(entry) => Ok(entry),
                    RegisterOutcome::Conflict(winner) => Err(ActivationFailure::NotMine(Some(winner.silo))),
                }
            }
            RegisterOutcome::Conflict(winner) => Err(ActivationFailure::NotMine(Some(winner.silo))),
        }
    }

    async fn release(&self, entry: &DirectoryEntry) {
        if let Err(e) = self.directory.unregister(entry).await {
            tracing::warn!(identity = %entry.identity, error = %e, "failed to unregister activation");
        }
    }

    async fn run(
        self: Rc<Self>,
        handle: Rc<ActivationHandle>,
        mut record: ActivationRecord,
        mut mailbox: mpsc::Receiver<Envelope>,
        mut control: mpsc::UnboundedReceiver<Deactivate>,
    ) {
        let command = loop {
            tokio::select! {
                biased;
                Some(command) = control.recv() => break Some(command),
                envelope = mailbox.recv() => match envelope {
                    Some(envelope) => {
                        record.process(&handle, envelope).await;
                        if record.ctx.take_deactivation_request() {
                            self.begin_deactivation(&handle, DeactivationReason::Requested);
                        }
                    }
                    None => break None,
                },
            }
        };
        if let Some(Deactivate { reason, done }) = command {
            self.finish_deactivation(&handle, record, mailbox, reason).await;
            done.send_replace(true);
        }
    }

    async fn finish_deactivation(
        &self,
        handle: &Rc<ActivationHandle>,
        mut record: ActivationRecord,
        mut mailbox: mpsc::Receiver<Envelope>,
        reason: DeactivationReason,
    ) {
        let identity = handle.entry.identity.clone();
        mailbox.close();
        let mut bounced = 0usize;
        while let Ok(envelope) = mailbox.try_recv() {
            let _ = envelope.reply.send(Reply::Moving);
            bounced += 1;
        }
        if let Err(e) = record.grain.on_deactivate(&mut record.ctx, reason).await {
            tracing::warn!(identity = %identity, error = %e, "on_deactivate failed");
        }
        if reason == DeactivationReason::Duplicate {
            tracing::debug!(identity = %identity, "duplicate activation, dropping unflushed state");
        } else if let Err(e) = record.ctx.state_mut().flush().await {
            tracing::error!(identity = %identity, error = %e, "failed to flush state, changes lost");
        }
        self.release(&handle.entry).await;
        self.forget(handle);
        tracing::debug!(
            identity = %identity,
            reason = ?reason,
            requests = record.request_seq,
            bounced,
            "grain deactivated"
        );
    }

    fn begin_deactivation(&self, handle: &Rc<ActivationHandle>, reason: DeactivationReason) -> Option<watch::Receiver<bool>> {
        let done = handle.request_deactivation(reason)?;
        self.slots.borrow_mut().insert(
            handle.entry.identity.clone(),
            Slot::Deactivating {
                handle: handle.clone(),
                done: done.clone(),
            },
        );
        Some(done)
    }

    fn is_current(&self, handle: &Rc<ActivationHandle>) -> bool {
        matches!(
            self.slots.borrow().get(&handle.entry.identity),
            Some(Slot::Valid(current)) if Rc::ptr_eq(current, handle)
        )
    }

    /// Drop the slot of `handle` if it still holds that activation.
    fn forget(&self, handle: &Rc<ActivationHandle>) {
        let identity = &handle.entry.identity;
        let mut slots = self.slots.borrow_mut();
        if slots
            .get(identity)
            .and_then(Slot::handle)
            .is_some_and(|current| Rc::ptr_eq(current, handle))
        {
            slots.remove(identity);
        }
    }

    async fn await_deactivated(&self, handle: &Rc<ActivationHandle>, mut done: watch::Receiver<bool>) {
        let waited = tokio::time::timeout(self.config.deactivation_timeout, done.wait_for(|d| *d)).await;
        if waited.is_err() {
            tracing::warn!(identity = %handle.entry.identity, "deactivation timed out, aborting activation");
            handle.abort();
            self.release(&handle.entry).await;
        }
        self.forget(handle);
    }

    /// Deactivate one identity and wait for it. Returns `false` if it was
    /// not active here.
    pub async fn deactivate(&self, identity: &ActorIdentity, reason: DeactivationReason) -> bool {
        let slot = self.slots.borrow().get(identity).cloned();
        let (handle, done) = match slot {
            Some(Slot::Valid(handle)) => match self.begin_deactivation(&handle, reason) {
                Some(done) => (handle, done),
                None => return false,
            },
            Some(Slot::Deactivating { handle, done }) => (handle, done),
            _ => return false,
        };
        self.await_deactivated(&handle, done).await;
        true
    }

    /// Start deactivating every activation idle for longer than the idle
    /// timeout. Returns how many were started.
    pub fn collect_idle(&self) -> usize {
        let now = Instant::now();
        let idle: Vec<Rc<ActivationHandle>> = self
            .slots
            .borrow()
            .values()
            .filter_map(|slot| match slot {
                Slot::Valid(handle) if handle.is_idle(now, self.config.idle_timeout) => Some(handle.clone()),
                _ => None,
            })
            .collect();
        let started = idle
            .iter()
            .filter(|handle| self.begin_deactivation(handle, DeactivationReason::IdleTimeout).is_some())
            .count();
        if started > 0 {
            tracing::debug!(silo = %self.local, started, "collecting idle activations");
        }
        started
    }

    /// Run [`collect_idle`](Self::collect_idle) every `interval`, and retry
    /// a [`reconcile`](Self::reconcile) that could not reach the directory.
    pub fn spawn_idle_collector(self: &Rc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.collect_idle();
                if manager.reconcile_pending.get() {
                    manager.reconcile().await;
                }
            }
        })
    }

    /// Stop accepting activations and deactivate everything, flushing
    /// state. Returns how many activations were deactivated.
    pub async fn deactivate_all(&self, reason: DeactivationReason) -> usize {
        self.accepting.set(false);
        let mut deactivated = 0;
        loop {
            let slots: Vec<Slot> = self.slots.borrow().values().cloned().collect();
            if slots.is_empty() {
                break;
            }
            let mut waiting = Vec::new();
            for slot in slots {
                match slot {
                    Slot::Activating(pending) => {
                        let _ = pending.await;
                    }
                    Slot::Valid(handle) => match self.begin_deactivation(&handle, reason) {
                        Some(done) => {
                            deactivated += 1;
                            waiting.push((handle, done));
                        }
                        None => {
                            handle.abort();
                            self.forget(&handle);
                        }
                    },
                    Slot::Deactivating { handle, done } => waiting.push((handle, done)),
                }
            }
            for (handle, done) in waiting {
                self.await_deactivated(&handle, done).await;
            }
        }
        tracing::info!(silo = %self.local, deactivated, "all activations deactivated");
        deactivated
    }

    /// Drop every activation without running hooks or flushing state.
    pub fn abort_all(&self) -> usize {
        self.accepting.set(false);
        let slots: Vec<Slot> = self.slots.borrow_mut().drain().map(|(_, slot)| slot).collect();
        let mut aborted = 0;
        for handle in slots.iter().filter_map(Slot::handle) {
            handle.abort();
            aborted += 1;
        }
        aborted
    }

    /// Re-register every valid activation with the current directory and
    /// deactivate those whose identity is registered to another silo.
    ///
    /// Run after each ownership change: entries held by a crashed partition
    /// owner are restored, and the losers of registrations made under
    /// diverging views step down. Returns how many were deactivated.
    pub async fn reconcile(&self) -> usize {
        let (hosted, activating) = {
            let slots = self.slots.borrow();
            let hosted: Vec<Rc<ActivationHandle>> = slots
                .values()
                .filter_map(|slot| match slot {
                    Slot::Valid(handle) => Some(handle.clone()),
                    _ => None,
                })
                .collect();
            let activating = slots.values().any(|slot| matches!(slot, Slot::Activating(_)));
            (hosted, activating)
        };
        // Activations still registering are checked on the next tick.
        self.reconcile_pending.set(activating);
        let mut superseded = 0;
        for handle in hosted {
            if self.fenced.get() {
                break;
            }
            match self.register(handle.entry.clone()).await {
                Ok(entry) if !self.is_current(&handle) => {
                    // Deactivated while re-registering.
                    self.release(&entry).await;
                }
                Ok(_) => {}
                Err(ActivationFailure::NotMine(winner)) => {
                    tracing::info!(
                        identity = %handle.entry.identity,
                        winner = ?winner,
                        "activation lost its directory entry, deactivating"
                    );
                    if self.begin_deactivation(&handle, DeactivationReason::Duplicate).is_some() {
                        superseded += 1;
                    }
                }
                Err(ActivationFailure::Failed(e)) => {
                    tracing::warn!(identity = %handle.entry.identity, error = %e, "could not re-register activation, will retry");
                    self.reconcile_pending.set(true);
                }
                Err(ActivationFailure::Moving) => {}
            }
        }
        if superseded > 0 {
            tracing::debug!(silo = %self.local, superseded, "reconciled activations with the directory");
        }
        superseded
    }

    /// Deactivate the activations recorded by `entries` that lost their
    /// directory registration. Entries of other activations are ignored.
    pub fn evict(&self, entries: &[DirectoryEntry]) -> usize {
        let losers: Vec<Rc<ActivationHandle>> = {
            let slots = self.slots.borrow();
            entries
                .iter()
                .filter_map(|entry| match slots.get(&entry.identity) {
                    Some(Slot::Valid(handle)) if handle.entry == *entry => Some(handle.clone()),
                    Some(Slot::Activating(_)) => {
                        self.reconcile_pending.set(true);
                        None
                    }
                    _ => None,
                })
                .collect()
        };
        losers
            .iter()
            .filter(|handle| self.begin_deactivation(handle, DeactivationReason::Duplicate).is_some())
            .count()
    }

    /// Stop serving for good: abort every activation and answer every later
    /// message with `NotMine`. Used once this silo incarnation is declared
    /// dead. Returns how many activations were aborted.
    pub fn fence(&self) -> usize {
        if self.fenced.replace(true) {
            return 0;
        }
        let aborted = self.abort_all();
        tracing::warn!(silo = %self.local, aborted, "silo declared dead, activations fenced");
        aborted
    }

    /// Whether [`fence`](Self::fence) was called.
    pub fn is_fenced(&self) -> bool {
        self.fenced.get()
    }

    /// Activations hosted here, including those being torn down.
    pub fn activation_count(&self) -> usize {
        self.slots
            .borrow()
            .values()
            .filter(|slot| slot.handle().is_some())
            .count()
    }

    /// Local lifecycle state of `identity`, `None` when not hosted here.
    pub fn state_of(&self, identity: &ActorIdentity) -> Option<ActivationState> {
        self.slots.borrow().get(identity).map(|slot| match slot {
            Slot::Activating(_) => ActivationState::Activating,
            Slot::Valid(_) => ActivationState::Valid,
            Slot::Deactivating { .. } => ActivationState::Deactivating,
        })
    }

    /// Whether new activations are still accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.get()
    }
}
