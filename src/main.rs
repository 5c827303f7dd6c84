// src/main.rs
// Orchestrator entry point: load config, open the store, serve.

use anyhow::{Context, Result};
use clap::Parser;
use overseer::config::load_config;
use overseer::storage::Store;
use overseer::{AppState, build_router};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "overseer", about = "Solve orchestrator for browser-automation containers")]
struct Args {
    /// YAML config describing containers, socks, profiles, and prompts.
    #[arg(long, env = "CONFIG_PATH")]
    config: PathBuf,

    /// SQLite database file.
    #[arg(long, env = "SQLITE_PATH", default_value = "./data/orchestrator.sqlite")]
    sqlite_path: String,

    /// Bind address for the HTTP API.
    #[arg(long, env = "ORCH_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
}

fn init_tracing() {
    let filter = std::env::var("ORCH_LOG_LEVEL")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    info!(
        config = %args.config.display(),
        containers = config.containers.len(),
        profiles = config.profiles.len(),
        prompts = config.prompts.len(),
        "config loaded"
    );

    let store = Store::connect(&args.sqlite_path).await?;
    let state = AppState::new(config, store).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(addr = %args.bind, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
