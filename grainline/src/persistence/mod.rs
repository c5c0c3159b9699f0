//! Grain state persistence.
//!
//! A [`StorageProvider`] keeps opaque bytes per grain identity with
//! version-based optimistic concurrency. The [`PersistenceCoordinator`] maps
//! provider names (as referenced by a grain's registration) to providers and
//! wraps reads and writes in [`PersistentStateEnvelope`]s.
//!
//! # Versions
//!
//! - Version `0` means "nothing stored yet".
//! - A successful write of an envelope at version `n` stores version `n + 1`.
//! - A write or clear whose expected version differs from the stored one
//!   fails with [`StorageError::Conflict`] and changes nothing. Whether to
//!   reload and retry is left to the grain.
//! - A clear removes the record, so the next write expects version `0`.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::InMemoryStorage;

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::identity::ActorIdentity;

/// Errors from storage operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The stored version is not the one the writer loaded.
    #[error("version conflict: expected {expected}, found {actual}")]
    Conflict {
        /// Version the writer based its change on.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// No provider is registered under this name.
    #[error("unknown storage provider '{0}'")]
    UnknownProvider(String),

    /// State bytes could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backing store failed.
    #[error("storage I/O error: {0}")]
    Io(String),
}

impl From<StorageError> for RuntimeError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { .. } => RuntimeError::Conflict(err.to_string()),
            StorageError::UnknownProvider(_) => RuntimeError::InvalidRequest(err.to_string()),
            StorageError::Serialization(_) | StorageError::Io(_) => {
                RuntimeError::Internal(err.to_string())
            }
        }
    }
}

/// Raw record kept by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredState {
    /// Version of this record, starting at 1.
    pub version: u64,
    /// Serialized grain state.
    pub data: Vec<u8>,
}

/// A versioned grain state blob tagged with its provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentStateEnvelope {
    /// Provider name the state belongs to.
    pub provider: String,
    /// Version the data was read at, `0` when nothing is stored.
    pub version: u64,
    /// Serialized grain state.
    pub data: Vec<u8>,
}

impl PersistentStateEnvelope {
    /// Envelope for state that has never been written.
    pub fn empty(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            version: 0,
            data: Vec::new(),
        }
    }

    /// True when nothing has been stored yet.
    pub fn is_new(&self) -> bool {
        self.version == 0
    }
}

/// Backend that keeps grain state.
///
/// No `Send` bounds: providers live on the silo's single-threaded runtime.
#[async_trait::async_trait(?Send)]
pub trait StorageProvider: fmt::Debug {
    /// Read the record for an identity, `None` when absent.
    async fn read(&self, identity: &ActorIdentity) -> Result<Option<StoredState>, StorageError>;

    /// Store `data` if the stored version equals `expected_version`.
    ///
    /// Returns the new version.
    async fn write(
        &self,
        identity: &ActorIdentity,
        data: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    /// Delete the record if the stored version equals `expected_version`.
    async fn clear(&self, identity: &ActorIdentity, expected_version: u64)
        -> Result<(), StorageError>;
}

/// Provider configuration, as read from a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Process-local map; lost when the process exits.
    Memory {
        /// Name grains refer to.
        name: String,
    },
    /// One JSON file per grain under `root/<name>`.
    File {
        /// Name grains refer to.
        name: String,
        /// Directory holding the state files.
        root: std::path::PathBuf,
    },
}

/// Storage section of the cluster configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Providers to install.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl StorageConfig {
    /// A single in-memory provider called `name`.
    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            providers: vec![ProviderConfig::Memory { name: name.into() }],
        }
    }

    /// Instantiate every configured provider.
    pub fn build(&self) -> PersistenceCoordinator {
        let mut coordinator = PersistenceCoordinator::new();
        for provider in &self.providers {
            match provider {
                ProviderConfig::Memory { name } => {
                    coordinator.register(name.clone(), Rc::new(InMemoryStorage::new()));
                }
                ProviderConfig::File { name, root } => {
                    coordinator.register(name.clone(), Rc::new(FileStorage::for_provider(root.clone(), name)));
                }
            }
        }
        coordinator
    }
}

/// Named storage providers and versioned state operations on top of them.
#[derive(Debug, Default)]
pub struct PersistenceCoordinator {
    providers: HashMap<String, Rc<dyn StorageProvider>>,
}

impl PersistenceCoordinator {
    /// No providers installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a provider under a name, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, provider: Rc<dyn StorageProvider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_provider(mut self, name: impl Into<String>, provider: Rc<dyn StorageProvider>) -> Self {
        self.register(name, provider);
        self
    }

    /// Whether a provider is installed under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    fn provider(&self, name: &str) -> Result<&Rc<dyn StorageProvider>, StorageError> {
        self.providers
            .get(name)
            .ok_or_else(|| StorageError::UnknownProvider(name.to_string()))
    }

    /// Load the envelope for an identity, `None` when nothing is stored.
    pub async fn load(
        &self,
        identity: &ActorIdentity,
        provider: &str,
    ) -> Result<Option<PersistentStateEnvelope>, StorageError> {
        let stored = self.provider(provider)?.read(identity).await?;
        Ok(stored.map(|s| PersistentStateEnvelope {
            provider: provider.to_string(),
            version: s.version,
            data: s.data,
        }))
    }

    /// Store an envelope. Its `version` is the expected stored version.
    ///
    /// Returns the envelope as now stored, with the incremented version.
    pub async fn save(
        &self,
        identity: &ActorIdentity,
        envelope: PersistentStateEnvelope,
    ) -> Result<PersistentStateEnvelope, StorageError> {
        let version = self
            .provider(&envelope.provider)?
            .write(identity, envelope.data.clone(), envelope.version)
            .await?;
        tracing::debug!(identity = %identity, provider = %envelope.provider, version, "state saved");
        Ok(PersistentStateEnvelope { version, ..envelope })
    }

    /// Delete the stored state if it is still at `envelope.version`.
    pub async fn clear(
        &self,
        identity: &ActorIdentity,
        envelope: &PersistentStateEnvelope,
    ) -> Result<(), StorageError> {
        self.provider(&envelope.provider)?
            .clear(identity, envelope.version)
            .await
    }
}

/// Apply the version check shared by every provider.
pub(crate) fn check_version(current: u64, expected: u64) -> Result<(), StorageError> {
    if current == expected {
        Ok(())
    } else {
        Err(StorageError::Conflict {
            expected,
            actual: current,
        })
    }
}
