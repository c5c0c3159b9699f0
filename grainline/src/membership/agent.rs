use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::{MembershipError, MembershipProvider};
use crate::cluster::SiloAddress;

/// Failure detector timing.
///
/// A silo is declared dead once it missed `missed_heartbeats` consecutive
/// heartbeats, i.e. after `interval * missed_heartbeats` of silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Time between two heartbeats of the same silo.
    #[serde(with = "crate::config::duration_ms")]
    pub interval: Duration,
    /// Consecutive misses tolerated before declaring a silo dead.
    pub missed_heartbeats: u32,
}

impl HeartbeatConfig {
    /// Silence after which a silo is declared dead.
    pub fn timeout(&self) -> Duration {
        self.interval * self.missed_heartbeats
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            missed_heartbeats: 3,
        }
    }
}

/// Per-silo membership loop.
///
/// Every `interval` it reports the silo's load and sweeps the table for
/// silos that went silent. The sweep is idempotent so every silo runs it.
pub struct MembershipAgent {
    provider: Rc<dyn MembershipProvider>,
    address: SiloAddress,
    config: HeartbeatConfig,
    load: Rc<dyn Fn() -> usize>,
    on_declared_dead: Option<Rc<dyn Fn()>>,
}

impl MembershipAgent {
    /// Agent for one silo. `load` reports the current activation count.
    pub fn new(
        provider: Rc<dyn MembershipProvider>,
        address: SiloAddress,
        config: HeartbeatConfig,
        load: Rc<dyn Fn() -> usize>,
    ) -> Self {
        Self {
            provider,
            address,
            config,
            load,
            on_declared_dead: None,
        }
    }

    /// Run `hook` once a heartbeat reports this silo dead.
    pub fn on_declared_dead(mut self, hook: Rc<dyn Fn()>) -> Self {
        self.on_declared_dead = Some(hook);
        self
    }

    /// One heartbeat plus one liveness sweep.
    ///
    /// Returns `false` once this silo learns it was declared dead.
    pub async fn tick(&self) -> bool {
        match self.provider.heartbeat(&self.address, (self.load)()).await {
            Ok(()) => {}
            Err(MembershipError::DeclaredDead(_)) => {
                tracing::error!(silo = %self.address, "this silo was declared dead, heartbeats stopped");
                if let Some(hook) = &self.on_declared_dead {
                    hook();
                }
                return false;
            }
            Err(e) => tracing::warn!(silo = %self.address, error = %e, "heartbeat failed"),
        }
        if let Err(e) = self.provider.check_liveness(self.config.timeout()).await {
            tracing::warn!(silo = %self.address, error = %e, "liveness sweep failed");
        }
        true
    }

    /// Spawn the loop on the current `LocalSet`.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !self.tick().await {
                    break;
                }
            }
        })
    }
}
