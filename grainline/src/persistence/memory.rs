use std::cell::RefCell;
use std::collections::HashMap;

use super::{check_version, StorageError, StorageProvider, StoredState};
use crate::identity::ActorIdentity;

/// In-memory storage provider.
///
/// State survives grain deactivation and silo restarts within one process,
/// as long as the same instance is shared. Nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entries: RefCell<HashMap<ActorIdentity, StoredState>>,
}

impl InMemoryStorage {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

#[async_trait::async_trait(?Send)]
impl StorageProvider for InMemoryStorage {
    async fn read(&self, identity: &ActorIdentity) -> Result<Option<StoredState>, StorageError> {
        Ok(self.entries.borrow().get(identity).cloned())
    }

    async fn write(
        &self,
        identity: &ActorIdentity,
        data: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let mut entries = self.entries.borrow_mut();
        let current = entries.get(identity).map_or(0, |s| s.version);
        check_version(current, expected_version)?;
        let version = current + 1;
        entries.insert(identity.clone(), StoredState { version, data });
        Ok(version)
    }

    async fn clear(
        &self,
        identity: &ActorIdentity,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        let mut entries = self.entries.borrow_mut();
        let current = entries.get(identity).map_or(0, |s| s.version);
        check_version(current, expected_version)?;
        entries.remove(identity);
        Ok(())
    }
}
