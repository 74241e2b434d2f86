//! Example: connecting every recommended shard and logging dispatches
//!
//! Run with: GATEWAY_TOKEN=... cargo run --example gateway
//!
//! Set `RUST_LOG=ws_gateway=debug` to watch the handshakes and heartbeats.

use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ws_gateway::{EventEnvelope, EventHandler, GatewayConfig, RestClient, RestConfig, ShardCoordinator};

/// Intents for guilds and guild messages
const INTENTS: u64 = (1 << 0) | (1 << 9);

/// Logs every event with its shard and sequence
struct LogHandler;

impl EventHandler for LogHandler {
    async fn on_event(&self, event: EventEnvelope) {
        info!(
            "[SHARD-{}] #{} {}",
            event.shard_id,
            event.sequence.unwrap_or_default(),
            event.event_name.as_deref().unwrap_or("?")
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let token = std::env::var("GATEWAY_TOKEN").map_err(|_| "GATEWAY_TOKEN is not set")?;

    let rest = Arc::new(RestClient::new(RestConfig::new(token.clone()))?);
    let config = GatewayConfig::builder(token).intents(INTENTS).build()?;

    let coordinator = Arc::new(ShardCoordinator::new(config, rest));
    let events = coordinator.events().ok_or("event stream already taken")?;
    let mut failures = coordinator.failures().ok_or("failure stream already taken")?;

    tokio::spawn(events.run(Arc::new(LogHandler)));
    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            warn!(
                "[SHARD-{}] stopped ({:?}): {}",
                failure.shard_id, failure.kind, failure.message
            );
        }
    });

    coordinator.start().await?;
    info!("Started {} shards", coordinator.shard_count());

    info!("Running... Press Ctrl+C to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(tokio::time::Duration::from_secs(60)) => {}
    }

    let snapshot = coordinator.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Reconnections: {}", snapshot.reconnections_total);
    info!("  Resumes: {}", snapshot.resumes_total);
    info!("  Events dispatched: {}", snapshot.events_dispatched_total);
    info!("  Heartbeats acked: {}", snapshot.heartbeat_acks_total);
    info!("  Active connections: {}", snapshot.active_connections);
    for shard in &snapshot.shards {
        info!(
            "  [SHARD-{}] {} latency={:?} seq={}",
            shard.shard_id, shard.state, shard.latency, shard.last_sequence
        );
    }

    coordinator.shutdown().await;
    info!("Coordinator stopped");

    Ok(())
}
