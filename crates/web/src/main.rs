//! Skiff control plane
//!
//! Owns users, quotas, container records, nodes, and templates; schedules
//! VMs onto node agents, proxies interactive traffic, and reconciles
//! desired state.

use clap::Parser;
use skiff_common::now_ts;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod client;
mod console;
mod db;
mod editor;
mod reconciler;
mod scheduler;
mod server;
mod templates;

#[derive(Parser, Debug, Clone)]
#[command(name = "skiff-web")]
#[command(about = "Skiff control plane - scheduling, quotas, reconciliation")]
#[command(version)]
struct Cli {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8000")]
    listen: String,

    /// Control-plane database path
    #[arg(long, env = "DB_PATH", default_value = "/var/lib/skiff/web.db")]
    db_path: PathBuf,

    /// Shared store path (editor file revisions)
    #[arg(long, env = "STORE_PATH", default_value = "/var/lib/skiff/store.db")]
    store_path: PathBuf,

    /// Shared store key namespace
    #[arg(long, env = "STORE_PREFIX", default_value = "skiff")]
    store_prefix: String,

    /// Seconds between reconciler passes
    #[arg(long, env = "RECONCILE_INTERVAL_S", default_value_t = 30)]
    reconcile_interval_s: u64,

    /// Seconds between node health probes
    #[arg(long, env = "HEARTBEAT_INTERVAL_S", default_value_t = 15)]
    heartbeat_interval_s: u64,

    /// Create an admin user with this token when the user table is empty
    #[arg(long, env = "BOOTSTRAP_ADMIN_TOKEN")]
    bootstrap_admin_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Skiff control plane v{}", env!("CARGO_PKG_VERSION"));

    for path in [&cli.db_path, &cli.store_path] {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let db = db::Db::open(&cli.db_path)?;
    let store = skiff_common::Store::open(&cli.store_path, cli.store_prefix.clone())?;

    if let Some(token) = &cli.bootstrap_admin_token {
        if db.user_count()? == 0 {
            let admin = db.create_user("admin", token, true)?;
            db.upsert_quota(admin.id, 100, 1000)?;
            info!("Bootstrapped admin user");
        }
    }

    let state = server::WebState {
        db: db.clone(),
        store,
        hub: Arc::new(editor::EditorHub::new()),
    };

    // Reconciler: drives actual state toward desired state.
    let recon = reconciler::Reconciler::new(db.clone());
    let reconcile_interval = Duration::from_secs(cli.reconcile_interval_s);
    tokio::spawn(async move { recon.run(reconcile_interval).await });

    // Heartbeat prober: keeps node health and heartbeat timestamps fresh
    // for the scheduler.
    let heartbeat_db = db.clone();
    let heartbeat_interval = Duration::from_secs(cli.heartbeat_interval_s);
    tokio::spawn(async move { heartbeat_loop(heartbeat_db, heartbeat_interval).await });

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    info!(listen = %cli.listen, "Control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    Ok(())
}

/// Poll each active node's `/health`; a responding node gets `healthy` and a
/// fresh `heartbeat_at`, a silent one is marked unhealthy (its heartbeat
/// ages out of the scheduler window on its own).
async fn heartbeat_loop(db: db::Db, interval: Duration) {
    info!(interval_s = interval.as_secs(), "Heartbeat prober started");
    loop {
        let nodes = match db.list_nodes() {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "Node listing failed");
                tokio::time::sleep(interval).await;
                continue;
            }
        };

        for node in nodes.into_iter().filter(|n| n.active) {
            let node_client = client::NodeClient::new(&node);
            let result = node_client.health().await;
            let update = match result {
                Ok(()) => db.update_node_health(node.id, true, Some(now_ts())),
                Err(ref e) => {
                    warn!(node = %node.name, error = %e, "Node health probe failed");
                    db.update_node_health(node.id, false, None)
                }
            };
            if let Err(e) = update {
                warn!(node = %node.name, error = %e, "Node health update failed");
            }
        }

        tokio::time::sleep(interval).await;
    }
}
