//! broker-node - embedded MQTT broker with retained-message snapshots
//!
//! Module structure:
//! - `domain/` - Retained messages, broker events, node output types
//! - `io/` - Engine storage interface, retained tap, host output
//! - `services/` - Snapshot store, save scheduler, node lifecycle
//! - `infra/` - Config, embedded broker (rumqttd)

use anyhow::Context;
use broker_node::infra::Config;
use broker_node::io::{create_host_channel, HostWriter};
use broker_node::services::{BrokerNode, SaveOutcome};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Capacity of the host output channel
const HOST_CHANNEL_SIZE: usize = 1000;

/// Embedded MQTT broker node
#[derive(Parser, Debug)]
#[command(name = "broker-node", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/broker.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git = %env!("GIT_HASH"), "broker-node starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        node = %config.node_id(),
        name = %config.node_name().unwrap_or("-"),
        bind_address = %config.bind_address(),
        mqtt_port = %config.mqtt_port(),
        ws_port = %config.ws_port(),
        tls = %config.use_tls(),
        auth = %config.credentials().is_some(),
        persistence = %config.persist_to_file(),
        user_dir = %config.user_dir().display(),
        snapshot_interval_secs = %config.snapshot_interval().as_secs(),
        output_file = %config.output_file(),
        publish_events = %config.publish_events(),
        "config_loaded"
    );

    let (host, host_rx) = create_host_channel(HOST_CHANNEL_SIZE, config.node_id());
    let writer = tokio::spawn(HostWriter::new(config.output_file()).run(host_rx));

    let node = BrokerNode::start(config, host.clone())
        .await
        .context("broker node configuration is invalid")?;

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown_requested");

    match node.close().await {
        Some(SaveOutcome::Saved(report)) => {
            info!(retained = %report.retained, "final_snapshot_written");
        }
        Some(SaveOutcome::Failed(e)) => warn!(error = %e, "final_snapshot_failed"),
        Some(SaveOutcome::Skipped) | None => {}
    }

    if host.dropped() > 0 {
        warn!(dropped = %host.dropped(), "host_messages_dropped");
    }
    drop(host);
    if let Err(e) = writer.await {
        warn!(error = %e, "host_writer_join_failed");
    }

    info!("broker-node shutdown complete");
    Ok(())
}
