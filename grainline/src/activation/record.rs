//! One activation: its mailbox handle and the record owned by its task.

use std::cell::{Cell, RefCell};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::directory::DirectoryEntry;
use crate::error::RuntimeError;
use crate::grain::{DeactivationReason, Grain, GrainContext};

/// Outcome of handing a message to an activation.
#[derive(Debug)]
pub(crate) enum Reply {
    /// The grain handled the message.
    Done(Result<Vec<u8>, RuntimeError>),
    /// The activation started deactivating before the message ran.
    Moving,
}

/// A queued invocation.
pub(crate) struct Envelope {
    pub(crate) method: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) reply: oneshot::Sender<Reply>,
}

/// Lifecycle command for the mailbox task.
pub(crate) struct Deactivate {
    pub(crate) reason: DeactivationReason,
    pub(crate) done: watch::Sender<bool>,
}

/// Shared side of an activation, held by the manager's slot table.
///
/// The grain itself lives on the mailbox task; callers only ever touch
/// the channels.
pub(crate) struct ActivationHandle {
    pub(crate) entry: DirectoryEntry,
    mailbox: mpsc::Sender<Envelope>,
    control: mpsc::UnboundedSender<Deactivate>,
    last_access: Cell<Instant>,
    in_flight: Cell<usize>,
    deactivating: Cell<bool>,
    task: RefCell<Option<AbortHandle>>,
}

/// Decrements the in-flight counter even if the caller is dropped.
struct InFlight<'a>(&'a Cell<usize>);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a Cell<usize>) -> Self {
        counter.set(counter.get() + 1);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

impl ActivationHandle {
    pub(crate) fn new(
        entry: DirectoryEntry,
        mailbox: mpsc::Sender<Envelope>,
        control: mpsc::UnboundedSender<Deactivate>,
    ) -> Self {
        Self {
            entry,
            mailbox,
            control,
            last_access: Cell::new(Instant::now()),
            in_flight: Cell::new(0),
            deactivating: Cell::new(false),
            task: RefCell::new(None),
        }
    }

    pub(crate) fn set_task(&self, task: AbortHandle) {
        *self.task.borrow_mut() = Some(task);
    }

    /// Queue a message and wait for the grain's reply.
    pub(crate) async fn invoke(&self, method: String, payload: Vec<u8>) -> Reply {
        let _guard = InFlight::enter(&self.in_flight);
        if self.deactivating.get() {
            return Reply::Moving;
        }
        let (reply, rx) = oneshot::channel();
        let envelope = Envelope {
            method,
            payload,
            reply,
        };
        if self.mailbox.send(envelope).await.is_err() {
            return Reply::Moving;
        }
        rx.await.unwrap_or(Reply::Moving)
    }

    /// True when nothing is queued or running and the last message is older
    /// than `idle_timeout`.
    pub(crate) fn is_idle(&self, now: Instant, idle_timeout: std::time::Duration) -> bool {
        !self.deactivating.get()
            && self.in_flight.get() == 0
            && now.saturating_duration_since(self.last_access.get()) >= idle_timeout
    }

    pub(crate) fn touch(&self) {
        self.last_access.set(Instant::now());
    }

    /// Ask the mailbox task to deactivate. Returns `None` if a deactivation
    /// is already under way or the task is gone.
    pub(crate) fn request_deactivation(&self, reason: DeactivationReason) -> Option<watch::Receiver<bool>> {
        if self.deactivating.replace(true) {
            return None;
        }
        let (done, rx) = watch::channel(false);
        self.control.send(Deactivate { reason, done }).ok()?;
        Some(rx)
    }

    pub(crate) fn abort(&self) {
        self.deactivating.set(true);
        if let Some(task) = self.task.borrow_mut().take() {
            task.abort();
        }
    }
}

/// Everything an activation owns, moved into its mailbox task.
pub(crate) struct ActivationRecord {
    pub(crate) grain: Box<dyn Grain>,
    pub(crate) ctx: GrainContext,
    pub(crate) request_seq: u64,
}

impl ActivationRecord {
    /// Run one message through the grain.
    pub(crate) async fn process(&mut self, handle: &ActivationHandle, envelope: Envelope) {
        self.request_seq += 1;
        handle.touch();
        let result = self
            .grain
            .handle(&mut self.ctx, &envelope.method, &envelope.payload)
            .await
            .map_err(RuntimeError::from);
        if let Err(e) = &result {
            tracing::debug!(
                identity = %self.ctx.identity(),
                method = %envelope.method,
                seq = self.request_seq,
                error = %e,
                "grain call failed"
            );
        }
        handle.touch();
        // The caller may have given up; nothing to do then.
        let _ = envelope.reply.send(Reply::Done(result));
    }
}
