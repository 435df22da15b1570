mod adapters;
mod api;
mod artifacts;
mod config;
mod db;
mod error;
mod hostfacts;
mod models;
mod normalize;
mod orchestrator;
mod parser;
mod reconcile;
mod scoring;
mod security;
mod service;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tracing::info;

use crate::{config::AppConfig, db::SqliteAssetStore, service::InventoryService};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<InventoryService>,
    pub config: Arc<AppConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Arc::new(AppConfig::load()?);

    let pool = db::create_pool(&config.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.database_url))?;
    db::run_migrations(&pool)
        .await
        .context("failed to migrate asset database")?;

    let store = Arc::new(SqliteAssetStore::new(pool));
    let service = Arc::new(InventoryService::new(config.clone(), store));

    let status = service.get_scan_tools_status().await;
    info!(platform = ?status.platform, wsl = status.wsl, tools = ?status.tools, "scanner tools detected");

    let app = api::router(AppState {
        service,
        config: config.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "hostinventory-rs listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
