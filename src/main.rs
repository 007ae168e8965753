//! Cland notification relay
//!
//! Watches an exchange directory for notification files, persists them in
//! SQLite and pushes them to every registered device.

mod api;
mod auth;
mod config;
mod db;
mod dispatch;
mod errors;
mod exchange;
mod models;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::Config;
use db::Repository;
use dispatch::{Dispatcher, HttpPushTransport, LogTransport, PushTransport, QUEUE_CAPACITY};
use exchange::ExchangeWatcher;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Starting cland relay");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Input directory: {:?}", config.input_dir);
    tracing::info!("Error directory: {:?}", config.error_dir);
    tracing::info!("Bind address: {}", config.bind_addr);

    if config.api_psk.is_none() {
        tracing::warn!("No API PSK configured (CLAND_API_PSK). Authentication is disabled!");
    }

    // Initialize database
    let pool = db::init_database(&config.db_path).await?;
    let repo = Arc::new(Repository::new(pool));

    let transport: Arc<dyn PushTransport> = match &config.push_gateway {
        Some(endpoint) => {
            tracing::info!("Push gateway: {}", endpoint);
            Arc::new(HttpPushTransport::new(endpoint.clone())?)
        }
        None => {
            tracing::warn!("No push gateway configured (CLAND_PUSH_GATEWAY). Deliveries are only logged");
            Arc::new(LogTransport)
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);

    // Dispatcher first so the watcher's startup scan has a consumer
    let dispatcher = Dispatcher::new(repo.clone(), transport, config.dispatch.clone())
        .spawn(queue_rx, shutdown_rx.clone());

    let watcher = ExchangeWatcher::new(
        config.input_dir.clone(),
        config.error_dir.clone(),
        repo.clone(),
        Some(queue_tx),
    )
    .start(shutdown_rx.clone())
    .await?;

    let state = AppState {
        repo: repo.clone(),
        config: Arc::new(config.clone()),
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await?;

    if let Err(e) = watcher.await {
        tracing::error!(error = %e, "Watcher task failed");
    }
    if let Err(e) = dispatcher.await {
        tracing::error!(error = %e, "Dispatcher task failed");
    }

    repo.close().await;
    tracing::info!("Relay stopped");

    Ok(())
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let psk = state.config.api_psk.clone();

    let api_routes = Router::new()
        // Devices
        .route("/devices", post(api::register_device))
        .route("/devices/{id}", get(api::get_device))
        .route("/devices/{id}", delete(api::delete_device))
        // Read-only views
        .route("/topics", get(api::list_topics))
        .route("/notifications", get(api::list_notifications))
        .layer(middleware::from_fn(move |req, next| {
            auth::psk_auth_layer(psk.clone(), req, next)
        }));

    // Health check (no auth required)
    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests;
