use std::sync::Arc;

use anyhow::{Context, Result};
use proctor_core::{InMemorySessionStore, MovementMonitor, VerificationService};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

use config::Config;
use dbus_interface::{AppState, ProctorService};
use engine::EngineHandle;
use store::SqliteIdentityStore;

const BUS_NAME: &str = "org.proctor.Proctor1";
const OBJECT_PATH: &str = "/org/proctor/Proctor1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("proctord starting");

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        comparator = ?config.comparator,
        identity_check = %config.identity_check,
        session_bus = config.session_bus,
        "configuration loaded"
    );

    let store = SqliteIdentityStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open store at {}", config.db_path.display()))?;

    let comparator = config.comparator.build();
    let service = VerificationService::new(
        Arc::new(store.clone()),
        comparator.clone(),
        config.verify_config(),
    );
    let sessions = Arc::new(InMemorySessionStore::new(config.session_policy()));
    let monitor = MovementMonitor::new(comparator, sessions, config.monitor_config());
    let engine = EngineHandle::new(Arc::new(service), Arc::new(monitor));

    let session_bus = config.session_bus;
    let state = Arc::new(AppState {
        config,
        engine,
        store,
    });
    let service = ProctorService { state };

    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to acquire bus name {BUS_NAME}"))?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "proctord ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("proctord shutting down");

    Ok(())
}
