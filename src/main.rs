//! Fleet telemetry ingestion and command gateway.
//!
//! Terminates long-lived TCP connections from GPS trackers, decodes their
//! framed binary telemetry, persists positions and device state, and
//! relays operator commands back over the same connection.

mod broadcaster;
mod codec;
mod config;
mod connection;
mod crc;
mod dispatcher;
mod error;
mod geo;
mod http;
mod identity;
mod listener;
mod metrics;
mod persistence;
mod registry;
mod shutdown;
mod watchdog;

use std::sync::Arc;

use tracing::info;

use config::Config;
use metrics::Metrics;
use persistence::InMemoryStore;
use watchdog::NullGeocoder;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "fleet_gateway=info,tower_http=info".into()))
        .json()
        .init();

    let config = Arc::new(Config::from_env());
    info!(tcp_addr = %config.tcp_addr(), http_addr = %config.http_addr(), "fleet gateway starting");

    let persistence = Arc::new(InMemoryStore::new());
    let registry = registry::Registry::new();
    let broadcaster = broadcaster::Broadcaster::new();
    let metrics = Arc::new(Metrics::default());
    let shutdown = shutdown::ShutdownCoordinator::new();

    tokio::spawn(listener::run(
        config.clone(),
        persistence.clone(),
        registry.clone(),
        broadcaster.clone(),
        metrics.clone(),
        shutdown.clone(),
    ));

    tokio::spawn(watchdog::run(
        persistence.clone(),
        Arc::new(NullGeocoder) as Arc<dyn watchdog::Geocoder>,
        metrics.clone(),
        config.clone(),
        shutdown.clone(),
    ));

    tokio::spawn(shutdown::wait_for_signal_and_drain(shutdown.clone(), registry.clone()));

    let app_state = http::AppState {
        registry: registry.clone(),
        metrics: metrics.clone(),
        config: config.clone(),
    };
    let app = http::router(app_state);

    let http_addr = config.http_addr();
    let http_listener = tokio::net::TcpListener::bind(&http_addr).await.unwrap_or_else(|err| {
        eprintln!("failed to bind HTTP listener on {http_addr}: {err}");
        std::process::exit(1);
    });
    info!(addr = %http_addr, "HTTP surface listening");

    let shutdown_for_http = shutdown.clone();
    axum::serve(http_listener, app)
        .with_graceful_shutdown(async move { shutdown_for_http.triggered().await })
        .await
        .unwrap_or_else(|err| {
            eprintln!("HTTP server error: {err}");
            std::process::exit(1);
        });

    info!("fleet gateway shut down cleanly");
}
