mod api;
mod config;
mod entries;
mod integrations;
mod state;
mod storage;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use api::AppState;
use config::HostConfig;
use entries::{ConfigEntries, IntegrationSettings};
use storage::EntryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,onecall=debug")),
        )
        .init();

    tracing::info!("Starting onecall v{}", env!("CARGO_PKG_VERSION"));

    let config = HostConfig::from_env()?;
    let time_zone = config.time_zone()?;

    let state_machine = Arc::new(state::StateMachine::new(4096));
    tokio::spawn(log_state_changes(state_machine.subscribe()));

    let http = reqwest::Client::builder()
        .user_agent(concat!("onecall/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .context("failed to build HTTP client")?;

    let store = EntryStore::open(&config.storage_path)?;
    let entries = ConfigEntries::new(
        store,
        http,
        state_machine.clone(),
        IntegrationSettings {
            api_endpoint: config.api_endpoint.clone(),
            time_zone,
            ..IntegrationSettings::default()
        },
    );

    let persisted = entries.load_persisted()?;
    let imported = entries.import(config.locations.clone());
    tracing::info!(persisted, imported, "Config entries loaded");
    entries.setup_all();

    let app_state = Arc::new(AppState {
        state_machine,
        entries: entries.clone(),
        started_at: Instant::now(),
    });

    let app = api::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    entries.shutdown().await;
    Ok(())
}

/// Trace every entity state transition.
async fn log_state_changes(mut rx: broadcast::Receiver<state::StateChangedEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let old = event.old_state.as_ref().map(|s| s.state.as_str());
                let new = event.new_state.as_ref().map(|s| s.state.as_str());
                if old != new {
                    tracing::trace!(entity_id = %event.entity_id, ?old, ?new, "State changed");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "State change log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
