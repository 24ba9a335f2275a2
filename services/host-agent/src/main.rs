//! vmfleet host agent
//!
//! Runs on each hypervisor host and applies control messages addressed to
//! it: power-state changes, domain provisioning and domain teardown. Domain
//! lifecycle events are reported back on the power topic.
//!
//! ## Startup
//!
//! 1. Connect to the hypervisor and the bus (either failing is fatal)
//! 2. Subscribe the lifecycle bridge (failing is fatal)
//! 3. Load the domain cache and reconcile every cached domain
//! 4. Consume the host's control topic until SIGINT or SIGTERM
//!
//! The process exits non-zero if the consumer stops before a signal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmfleet_host_agent::agent;
use vmfleet_host_agent::bus::BusConfig;
use vmfleet_host_agent::config::Config;
use vmfleet_host_agent::{
    CommandProvisioner, DomainCache, Dispatcher, Hypervisor, LifecycleBridge, NatsBus, Provisioner,
    Publisher, SeenIds, VirshHypervisor,
};
use vmfleet_id::SnowflakeGenerator;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        hostname = %config.hostname,
        node_id = config.node_id,
        bus_url = %config.bus_url,
        cache_path = %config.cache_path.display(),
        "Starting vmfleet host agent"
    );

    let hypervisor: Arc<dyn Hypervisor> = Arc::new(
        VirshHypervisor::connect(&config.hypervisor_socket)
            .await
            .context("failed to connect to hypervisor")?,
    );

    let bus = NatsBus::connect(&BusConfig {
        url: config.bus_url.clone(),
        name: format!("host-agent-{}", config.hostname),
        connect_timeout: Duration::from_secs(10),
    })
    .await
    .context("failed to connect to message bus")?;

    let ids = Arc::new(
        SnowflakeGenerator::new(config.node_id).context("invalid snowflake node id")?,
    );
    let provisioner: Arc<dyn Provisioner> =
        Arc::new(CommandProvisioner::new(config.provision_config()));

    let cache = DomainCache::load_or_empty(&config.cache_path);
    let dispatcher = Arc::new(Dispatcher::new(
        SeenIds::from_window(config.dedup_window),
        cache,
        Arc::clone(&hypervisor),
        provisioner,
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Subscribe the lifecycle bridge, then reconcile
    let bridge = LifecycleBridge::new(
        hypervisor,
        Arc::new(bus.clone()) as Arc<dyn Publisher>,
        ids,
        config.power_topic(),
    );
    let (bridge_handle, _report) = agent::start(bridge, &dispatcher, shutdown_rx.clone())
        .await
        .context("failed to subscribe to lifecycle events")?;

    // Start consuming control messages
    let serve_handle = tokio::spawn({
        let bus = bus.clone();
        let dispatcher = Arc::clone(&dispatcher);
        let subject = config.inbound_topic();
        let concurrency = config.dispatch_concurrency;
        let shutdown_rx = shutdown_rx.clone();
        async move { bus.serve(dispatcher, &subject, concurrency, shutdown_rx).await }
    });

    let result = agent::supervise(wait_for_signal(), serve_handle, bridge_handle, shutdown_tx).await;

    if let Err(e) = bus.flush().await {
        warn!(error = %e, "Failed to flush outbound messages");
    }

    result?;
    info!("Host agent shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            info!("Received SIGINT");
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM");
        }
    }
    Ok(())
}
