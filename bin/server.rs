// Vote Reconcile - Web Server

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vote_reconcile::api::{router, AppState};
use vote_reconcile::{open_read_only, Config, DatasetStore, MergerGraph, ReconciliationEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // optional config file as the only argument
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let conn = open_read_only(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    let graph = MergerGraph::load(&conn).context("Failed to load merger history")?;
    let store = DatasetStore::from_config(&config);
    info!(
        edges = graph.edges().len(),
        votes_dir = %store.votes_dir().display(),
        "merger graph and dataset store ready"
    );

    let state = AppState::new(conn, ReconciliationEngine::new(graph, store));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "server running");
    println!("🚀 Server running on http://{}", config.bind_addr);
    println!("   API: http://{}/api/reconcile?date=YYYYMMDD&code=N", config.bind_addr);

    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}
