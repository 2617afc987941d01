//! NanoStatus - lightweight uptime monitoring service.
//!
//! Probes configured endpoints on their own schedules, keeps history in a
//! local SQLite database, and streams live updates to dashboards.

mod config;
mod db;
mod events;
mod probe;
mod scheduler;
mod stats;
mod sync;
mod web;

use config::ServerConfig;
use db::Store;
use events::EventBus;
use probe::Checker;
use scheduler::Scheduler;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nanostatus=info".parse()?),
        )
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting NanoStatus on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    cfg.ensure_data_dir();
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let bus = EventBus::new(store.clone());
    let checker = Checker::new(store.clone(), bus.clone())?;

    // Reconcile the YAML monitor list, then probe whatever it changed.
    let outcome = sync::sync_monitors_file(&store, &bus, &cfg.data_dir());
    for id in outcome.created.into_iter().chain(outcome.updated) {
        let checker = checker.clone();
        tokio::spawn(async move { checker.check(id).await });
    }

    // Start the probe scheduler and the daily retention task
    let scheduler = Scheduler::new(store.clone(), checker.clone());
    scheduler.start();
    scheduler::start_retention(store.clone());

    // Start web server
    let server = Server::new(cfg, store, bus, checker);
    server.start().await?;

    Ok(())
}
