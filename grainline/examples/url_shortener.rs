//! URL shortener on a two-silo cluster.
//!
//! ```bash
//! cargo run --example url_shortener
//! RUST_LOG=grainline=trace cargo run --example url_shortener
//! ```
//!
//! Both silos run in this process on a `LocalNetwork`. The example stores a
//! link, reads it back from the other silo, crashes the silo hosting the
//! grain and reads the link again once the survivor has declared the host
//! dead and re-placed the grain.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use grainline::membership::SharedMembership;
use grainline::prelude::*;
use grainline::{InMemoryStorage, PersistenceCoordinator};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Grain
// ============================================================================

/// Maps a short code to the full address.
#[derive(Default)]
struct UrlShortener;

#[async_trait(?Send)]
impl Grain for UrlShortener {
    async fn on_activate(&mut self, ctx: &mut GrainContext) -> Result<(), GrainError> {
        tracing::info!(grain = %ctx.identity(), silo = %ctx.router().local(), "activated");
        Ok(())
    }

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

// ============================================================================
// Cluster
// ============================================================================

fn silo_config(name: &str) -> Result<SiloConfig, Box<dyn std::error::Error>> {
    Ok(SiloConfig::builder()
        .name(name)
        .heartbeat(Duration::from_millis(200), 3)
        .request_timeout(Duration::from_secs(2))
        .build()?)
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut registry = GrainRegistry::new();
    registry.register_default::<UrlShortener>("urlShortener", GrainOptions::persistent("memory"));
    let cluster = ClusterConfig::builder()
        .membership(Rc::new(SharedMembership::new()))
        .registry(registry)
        .persistence(PersistenceCoordinator::new().with_provider("memory", Rc::new(InMemoryStorage::new())))
        .build()?;

    let network = LocalNetwork::new();
    let mut silos = Vec::new();
    for (name, port) in [("alpha", 4601), ("beta", 4602)] {
        let silo = Silo::builder(silo_config(name)?)
            .cluster(cluster.clone())
            .transport(network.endpoint(SocketAddr::from(([127, 0, 0, 1], port))))
            .start()
            .await?;
        silos.push(silo);
    }

    let code = ActorIdentity::new("urlShortener", "ABC123");
    silos[0]
        .router()
        .call::<_, ()>(&code, "set", "https://example.com/a/very/long/path")
        .await?;
    let target: String = silos[1].router().call(&code, "get", &()).await?;
    tracing::info!(%code, %target, "resolved through the other silo");

    let Some(host) = silos[0].router().cached_location(&code) else {
        return Err("no cached location after a successful call".into());
    };
    let (crashed, survivor) = if host == *silos[0].address() {
        (&silos[0], &silos[1])
    } else {
        (&silos[1], &silos[0])
    };
    tracing::info!(silo = %crashed.address(), "crashing the host");
    crashed.kill();

    // Wait for the missed heartbeats to get the host declared dead.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let target: String = survivor.router().call(&code, "get", &()).await?;
    tracing::info!(%code, %target, silo = %survivor.address(), "re-placed after the crash");

    survivor.shutdown().await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,grainline=debug")),
        )
        .init();

    tokio::task::LocalSet::new().run_until(run()).await
}
