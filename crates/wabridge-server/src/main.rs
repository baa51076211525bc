//! Bridge daemon.
//!
//! Configuration comes from the environment (`BRIDGE_HOST`, `BRIDGE_PORT`,
//! `AUTH_DIR`, `BRIDGE_HELPER`, ...). Consumers connect to
//! `ws://<host>:<port>`.

use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wabridge_core::{BridgeConfig, BridgeEvent, LinkStatus, event_bus::into_stream};
use wabridge_protocol::ProcessConnector;
use wabridge_session::{ConnectionManager, ManagerOptions, storage::FileSessionStore};
use wabridge_transport::RelayServer;

fn init_tracing(log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::from_env().context("invalid configuration")?;
    init_tracing(config.log_json);

    let addr = config.listen_addr()?;
    let store = FileSessionStore::open(&config.auth_dir)
        .with_context(|| format!("cannot use auth dir {}", config.auth_dir.display()))?;
    let connector = ProcessConnector::from_command_line(config.helper_command.clone());
    let manager = Arc::new(ConnectionManager::new(
        connector,
        store,
        ManagerOptions::from(&config),
    ));

    // Operator-facing trail of the link lifecycle.
    let mut events = into_stream(manager.subscribe());
    let monitor = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                BridgeEvent::Qr(qr) => {
                    tracing::info!(%qr, "scan the QR challenge with the phone app to link");
                }
                BridgeEvent::Status(LinkStatus::Connected) => tracing::info!("linked"),
                BridgeEvent::Status(LinkStatus::Disconnected) => tracing::warn!("link lost"),
                BridgeEvent::Error(error) => tracing::warn!(%error, "bridge error"),
                BridgeEvent::Message(_) | BridgeEvent::Ack { .. } => {}
            }
        }
    });

    let relay = RelayServer::new(manager).with_consumer_buffer(config.consumer_buffer);
    let bound = relay
        .start(addr)
        .await
        .with_context(|| format!("failed to start relay on {addr}"))?;
    tracing::info!(auth_dir = %config.auth_dir.display(), "bridge listening on ws://{bound}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    relay.stop().await;
    monitor.abort();
    Ok(())
}
