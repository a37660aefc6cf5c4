//! Skiff node agent
//!
//! Owns the local VM catalog, QEMU child processes, and the SSH session
//! cache, and serves the node HTTP/WS API.

use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod fsops;
mod qemu;
mod runner;
mod server;
mod ssh;

use config::AgentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Skiff node agent v{}", env!("CARGO_PKG_VERSION"));

    tokio::fs::create_dir_all(config.vms_root()).await?;
    if let Some(parent) = config.store_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let store = skiff_common::Store::open(&config.store_path, config.store_prefix.clone())?;

    // Heal the catalog after a crash before serving traffic.
    let healed = store.reconcile_all().await?;
    info!(records = healed, "Catalog reconciled at startup");

    let config = Arc::new(config);
    let ssh = Arc::new(ssh::SshCache::new(config.ssh_privkey.clone()));
    let runner = Arc::new(runner::Runner::new(config.clone(), store.clone(), ssh.clone()));

    let state = server::AppState {
        config: config.clone(),
        store,
        runner,
        ssh,
    };

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(listen = %config.listen, node = %config.node_name, "Node agent listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    Ok(())
}
