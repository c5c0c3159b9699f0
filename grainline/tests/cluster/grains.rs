//! Grains used by the cluster scenarios.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use grainline::prelude::*;

/// Persistent counter. State changes stay dirty until `save` or
/// deactivation.
pub struct Counter {
    pub activations: Rc<Cell<usize>>,
}

#[async_trait(?Send)]
impl Grain for Counter {
    async fn on_activate(&mut self, _ctx: &mut GrainContext) -> Result<(), GrainError> {
        self.activations.set(self.activations.get() + 1);
        Ok(())
    }

    async fn handle(&mut self, ctx: &mut GrainContext, method: &str, payload: &[u8]) -> Result<Vec<u8>, GrainError> {
        match method {
            "add" => {
                let delta: i64 = decode(payload)?;
                let total = ctx.state().get::<i64>()?.unwrap_or(0) + delta;
                ctx.state_mut().set(&total)?;
                encode(&total)
            }
            "get" => encode(&ctx.state().get::<i64>()?.unwrap_or(0)),
            "save" => {
                ctx.state_mut().write().await?;
                encode(&ctx.state().version())
            }
            "sleep" => {
                let millis: u64 = decode(payload)?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                encode(&millis)
            }
            "retire" => {
                ctx.deactivate_on_idle();
                encode(&())
            }
            "relay" => {
                let (key, delta): (i64, i64) = decode(payload)?;
                let target = ActorIdentity::new("counter", key);
                let total: i64 = ctx.router().call(&target, "add", &delta).await?;
                encode(&total)
            }
            other => Err(GrainError::UnknownMethod(other.to_string())),
        }
    }
}

/// Maps a short code to an address.
#[derive(Default)]
pub struct UrlShortener;

#[async_trait(?Send)]
impl Grain for UrlShortener {
    async fn handle(&mut self, ctx: &mut GrainContext, method: &str, payload: &[u8]) -> Result<Vec<u8>, GrainError> {
        match method {
            "set" => {
                let address: String = decode(payload)?;
                ctx.state_mut().set(&address)?;
                ctx.state_mut().write().await?;
                encode(&())
            }
            "get" => match ctx.state().get::<String>()? {
                Some(address) => encode(&address),
                None => Err(GrainError::NotFound(ctx.identity().to_string())),
            },
            other => Err(GrainError::UnknownMethod(other.to_string())),
        }
    }
}

/// Grain kinds of the scenarios, all stored in `provider`.
///
/// - `counter`: least-loaded placement
/// - `local-counter`: placed on the calling silo
/// - `urlShortener`
pub fn registry(provider: &str, activations: &Rc<Cell<usize>>) -> GrainRegistry {
    let mut registry = GrainRegistry::new();
    let counted = activations.clone();
    registry.register("counter", GrainOptions::persistent(provider), move |_| Counter {
        activations: counted.clone(),
    });
    let counted = activations.clone();
    registry.register(
        "local-counter",
        GrainOptions::persistent(provider).with_placement(PlacementStrategy::PreferLocal),
        move |_| Counter {
            activations: counted.clone(),
        },
    );
    registry.register_default::<UrlShortener>("urlShortener", GrainOptions::persistent(provider));
    registry
}
