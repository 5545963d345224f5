/*!
 * Stream Bridge Service
 *
 * Drains entries from a stream log via consumer-group semantics and
 * republishes each one onto a pub/sub bus. Acks arriving back on the bus
 * finalize the corresponding entry; idle-claim recovers entries abandoned by
 * dead or stalled consumers; a sliding-window circuit breaker protects the
 * bus from sustained publish failures.
 *
 * ## Configuration
 *
 * See `bridge-config` for the full list of environment variables. The most
 * commonly set ones:
 * - STREAM_ADDRESSES: comma-separated stream log addresses
 * - STREAM_NAME: the stream to consume (empty enables discovery mode)
 * - BUS_BROKERS: the pub/sub broker address
 * - PIPELINE_PUBLISH_WORKERS: number of concurrent publish workers
 * - BRIDGE_HEALTH_PORT: health/ready/metrics HTTP port (default: 8080)
 */

use anyhow::Context;
use stream_bridge::health::{ServiceState, start_health_server};
use stream_bridge::{Orchestrator, bus_client::BusClient, stream_client::StreamClient};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bridge_common::init_tracing_from_env();

    info!("starting stream bridge");

    let config = bridge_config::BridgeConfig::from_env().context("failed to load configuration")?;

    info!("stream addresses: {:?}", config.stream.addresses);
    info!("bus brokers: {}", config.bus.brokers);
    info!("publish workers: {}", config.pipeline.publish_workers);
    info!("buffer size: {}", config.pipeline.buffer_size);

    let state = ServiceState::new();

    let health_port: u16 = std::env::var("BRIDGE_HEALTH_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let health_state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = start_health_server(health_port, health_state).await {
            error!(error = %err, "health server failed");
        }
    });

    let mut stream_client = StreamClient::connect(config.stream.clone())
        .await
        .context("failed to connect to stream log")?;
    stream_client
        .ensure_groups()
        .await
        .context("failed to ensure consumer groups")?;

    // The TLS client-certificate identity prefix is supplied by the external
    // TLS collaborator (out of scope here); none is wired up in this binary.
    let bus_client = BusClient::connect(config.bus.clone(), None)
        .await
        .context("failed to connect to bus")?;

    let orchestrator = Orchestrator::new(config, stream_client, bus_client, state);

    orchestrator.run().await?;

    info!("stream bridge stopped");
    Ok(())
}
