//! Silo and cluster configuration.
//!
//! [`SiloConfig`] holds per-node settings and can come from the builder,
//! `Default`, or JSON. [`ClusterConfig`] bundles what every silo of a
//! cluster shares: membership, grain kinds, storage providers and the
//! placement director. In a single process all silos reference the same
//! `ClusterConfig`, so they see one membership table and one set of
//! storage providers.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut registry = GrainRegistry::new();
//! registry.register_default::<UrlShortener>("urlShortener", GrainOptions::persistent("memory"));
//!
//! let cluster = ClusterConfig::builder()
//!     .membership(Rc::new(SharedMembership::new()))
//!     .registry(registry)
//!     .storage(StorageConfig::memory("memory"))
//!     .build()?;
//!
//! let config = SiloConfig::builder()
//!     .name("silo-a")
//!     .idle_timeout(Duration::from_secs(60))
//!     .build()?;
//! ```

use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::activation::ActivationConfig;
use crate::grain::GrainRegistry;
use crate::membership::{HeartbeatConfig, MembershipProvider, SharedMembership};
use crate::persistence::{InMemoryStorage, PersistenceCoordinator, StorageConfig};
use crate::placement::{DefaultPlacementDirector, PlacementDirector};

/// Serde helper storing a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as milliseconds.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The silo has no name.
    #[error("silo name must not be empty")]
    EmptyName,

    /// Activations would be collected immediately.
    #[error("idle timeout must be non-zero")]
    ZeroIdleTimeout,

    /// A duration that drives a periodic task is zero.
    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),

    /// A single missed heartbeat would declare a silo dead.
    #[error("heartbeat timeout ({timeout:?}) must exceed the heartbeat interval ({interval:?})")]
    HeartbeatTimeoutTooShort {
        /// Configured interval.
        interval: Duration,
        /// Resulting timeout.
        timeout: Duration,
    },

    /// Mailboxes must hold at least one message.
    #[error("mailbox capacity must be at least 1")]
    ZeroMailboxCapacity,

    /// A required part of the cluster configuration was not given.
    #[error("cluster config requires {0}")]
    Missing(&'static str),

    /// A grain kind names a storage provider that is not configured.
    #[error("grain kind '{kind}' uses unknown storage provider '{provider}'")]
    UnknownStorageProvider {
        /// Grain kind.
        kind: String,
        /// Provider it asked for.
        provider: String,
    },

    /// The configuration text could not be parsed.
    #[error("cannot parse configuration: {0}")]
    Parse(String),
}

/// Per-silo settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiloConfig {
    /// Node name, stable across restarts of the same silo.
    pub name: String,
    /// Activations idle this long are deactivated.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// How often the idle collector sweeps.
    #[serde(with = "duration_ms")]
    pub collection_interval: Duration,
    /// Default deadline of a grain call, retry included.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Failure detector timing.
    pub heartbeat: HeartbeatConfig,
    /// Messages queued per activation before senders wait.
    pub mailbox_capacity: usize,
    /// How long a message waits for a deactivating activation.
    #[serde(with = "duration_ms")]
    pub deactivation_timeout: Duration,
}

impl Default for SiloConfig {
    fn default() -> Self {
        Self {
            name: "silo".to_string(),
            idle_timeout: Duration::from_secs(600),
            collection_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            heartbeat: HeartbeatConfig::default(),
            mailbox_capacity: 128,
            deactivation_timeout: Duration::from_secs(5),
        }
    }
}

impl SiloConfig {
    /// Start from the defaults.
    pub fn builder() -> SiloConfigBuilder {
        SiloConfigBuilder {
            config: SiloConfig::default(),
        }
    }

    /// Parse JSON, filling gaps with defaults, and validate.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SiloConfig = serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants between fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        if self.collection_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("collection interval"));
        }
        if self.heartbeat.interval.is_zero() {
            return Err(ConfigError::ZeroInterval("heartbeat interval"));
        }
        if self.heartbeat.timeout() <= self.heartbeat.interval {
            return Err(ConfigError::HeartbeatTimeoutTooShort {
                interval: self.heartbeat.interval,
                timeout: self.heartbeat.timeout(),
            });
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::ZeroMailboxCapacity);
        }
        Ok(())
    }

    pub(crate) fn activation(&self) -> ActivationConfig {
        ActivationConfig {
            idle_timeout: self.idle_timeout,
            mailbox_capacity: self.mailbox_capacity,
            deactivation_timeout: self.deactivation_timeout,
        }
    }
}

/// Builder for [`SiloConfig`].
#[derive(Debug, Clone)]
pub struct SiloConfigBuilder {
    config: SiloConfig,
}

impl SiloConfigBuilder {
    /// Set the node name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the idle collector's sweep interval.
    pub fn collection_interval(mut self, interval: Duration) -> Self {
        self.config.collection_interval = interval;
        self
    }

    /// Set the default call deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the heartbeat interval and tolerated misses.
    pub fn heartbeat(mut self, interval: Duration, missed_heartbeats: u32) -> Self {
        self.config.heartbeat = HeartbeatConfig {
            interval,
            missed_heartbeats,
        };
        self
    }

    /// Set the per-activation mailbox capacity.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.config.mailbox_capacity = capacity;
        self
    }

    /// Set how long messages wait for a deactivation.
    pub fn deactivation_timeout(mut self, timeout: Duration) -> Self {
        self.config.deactivation_timeout = timeout;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<SiloConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Settings shared by every silo of a cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    membership: Rc<dyn MembershipProvider>,
    registry: Rc<GrainRegistry>,
    persistence: Rc<PersistenceCoordinator>,
    placement: Rc<dyn PlacementDirector>,
}

impl ClusterConfig {
    /// Start building a cluster configuration.
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// One in-process membership table and a `memory` storage provider.
    pub fn in_memory(registry: GrainRegistry) -> Result<Self, ConfigError> {
        Self::builder()
            .membership(Rc::new(SharedMembership::new()))
            .registry(registry)
            .persistence(PersistenceCoordinator::new().with_provider("memory", Rc::new(InMemoryStorage::new())))
            .build()
    }

    /// Membership provider.
    pub fn membership(&self) -> &Rc<dyn MembershipProvider> {
        &self.membership
    }

    /// Grain kinds.
    pub fn registry(&self) -> &Rc<GrainRegistry> {
        &self.registry
    }

    /// Storage providers by name.
    pub fn persistence(&self) -> &Rc<PersistenceCoordinator> {
        &self.persistence
    }

    /// Placement director.
    pub fn placement(&self) -> &Rc<dyn PlacementDirector> {
        &self.placement
    }
}

/// Builder for [`ClusterConfig`].
#[derive(Default)]
pub struct ClusterConfigBuilder {
    membership: Option<Rc<dyn MembershipProvider>>,
    registry: Option<GrainRegistry>,
    persistence: Option<PersistenceCoordinator>,
    placement: Option<Rc<dyn PlacementDirector>>,
}

impl ClusterConfigBuilder {
    /// Set the membership provider. Required.
    pub fn membership(mut self, membership: Rc<dyn MembershipProvider>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Set the grain kinds. Required.
    pub fn registry(mut self, registry: GrainRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use an already assembled set of storage providers.
    pub fn persistence(mut self, persistence: PersistenceCoordinator) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Build storage providers from their declarative description.
    pub fn storage(self, storage: StorageConfig) -> Self {
        self.persistence(storage.build())
    }

    /// Override the placement director.
    pub fn placement(mut self, placement: Rc<dyn PlacementDirector>) -> Self {
        self.placement = Some(placement);
        self
    }

    /// Build, checking that every grain kind's storage provider exists.
    pub fn build(self) -> Result<ClusterConfig, ConfigError> {
        let membership = self.membership.ok_or(ConfigError::Missing("a membership provider"))?;
        let registry = self.registry.ok_or(ConfigError::Missing("a grain registry"))?;
        let persistence = self.persistence.unwrap_or_default();
        for (kind, options) in registry.kinds() {
            if let Some(provider) = &options.storage_provider {
                if !persistence.contains(provider) {
                    return Err(ConfigError::UnknownStorageProvider {
                        kind: kind.to_string(),
                        provider: provider.clone(),
                    });
                }
            }
        }
        Ok(ClusterConfig {
            membership,
            registry: Rc::new(registry),
            persistence: Rc::new(persistence),
            placement: self
                .placement
                .unwrap_or_else(|| Rc::new(DefaultPlacementDirector::new())),
        })
    }
}
