use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::GrainError;
use crate::identity::ActorIdentity;
use crate::persistence::{PersistenceCoordinator, PersistentStateEnvelope};

/// Persistent state of one activation.
///
/// Loaded before `on_activate`. Changes made with [`set`](Self::set) stay in
/// memory, marked dirty, until [`write`](Self::write) or deactivation
/// flushes them. Writes use the version that was loaded, so a concurrent
/// writer makes this one fail with a conflict instead of being overwritten.
#[derive(Debug)]
pub struct GrainState {
    identity: ActorIdentity,
    provider: Option<String>,
    stored: PersistentStateEnvelope,
    current: Option<Vec<u8>>,
    dirty: bool,
    persistence: Rc<PersistenceCoordinator>,
}

impl GrainState {
    pub(crate) fn new(
        identity: ActorIdentity,
        provider: Option<String>,
        loaded: Option<PersistentStateEnvelope>,
        persistence: Rc<PersistenceCoordinator>,
    ) -> Self {
        let stored = loaded.unwrap_or_else(|| {
            PersistentStateEnvelope::empty(provider.clone().unwrap_or_default())
        });
        let current = (!stored.is_new()).then(|| stored.data.clone());
        Self {
            identity,
            provider,
            stored,
            current,
            dirty: false,
            persistence,
        }
    }

    /// Current value, `None` when nothing was stored or set.
    pub fn get<T: DeserializeOwned>(&self) -> Result<Option<T>, GrainError> {
        self.current
            .as_deref()
            .map(|bytes| serde_json::from_slice::<T>(bytes))
            .transpose()
            .map_err(GrainError::from)
    }

    /// Replace the value in memory and mark it dirty.
    pub fn set<T: Serialize>(&mut self, value: &T) -> Result<(), GrainError> {
        self.current = Some(serde_json::to_vec(value)?);
        self.dirty = true;
        Ok(())
    }

    /// Whether there are unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Version last read or written, `0` when nothing is stored.
    pub fn version(&self) -> u64 {
        self.stored.version
    }

    /// Whether a storage provider backs this state.
    pub fn is_persistent(&self) -> bool {
        self.provider.is_some()
    }

    /// Persist the current value.
    pub async fn write(&mut self) -> Result<(), GrainError> {
        if self.provider.is_none() {
            return Err(GrainError::NoStorage);
        }
        let envelope = PersistentStateEnvelope {
            data: self.current.clone().unwrap_or_default(),
            ..self.stored.clone()
        };
        self.stored = self.persistence.save(&self.identity, envelope).await?;
        self.dirty = false;
        Ok(())
    }

    /// Persist only if something changed. No-op without a provider.
    pub async fn flush(&mut self) -> Result<(), GrainError> {
        if self.dirty && self.provider.is_some() {
            self.write().await?;
        }
        Ok(())
    }

    /// Drop in-memory changes and re-read the stored value.
    pub async fn reload(&mut self) -> Result<(), GrainError> {
        let provider = self.provider.clone().ok_or(GrainError::NoStorage)?;
        let loaded = self.persistence.load(&self.identity, &provider).await?;
        self.stored = loaded.unwrap_or_else(|| PersistentStateEnvelope::empty(provider));
        self.current = (!self.stored.is_new()).then(|| self.stored.data.clone());
        self.dirty = false;
        Ok(())
    }

    /// Delete the stored value.
    pub async fn clear(&mut self) -> Result<(), GrainError> {
        let provider = self.provider.clone().ok_or(GrainError::NoStorage)?;
        if !self.stored.is_new() {
            self.persistence.clear(&self.identity, &self.stored).await?;
        }
        self.stored = PersistentStateEnvelope::empty(provider);
        self.current = None;
        self.dirty = false;
        Ok(())
    }
}
