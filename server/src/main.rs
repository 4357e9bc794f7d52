//! Ward Server - central sync executor for facility stores.
//!
//! Serves sync sessions over HTTP: peers open a session, push their changes,
//! build a snapshot of everything they have not seen, and page through it.
//! Rows live in PostgreSQL; ordering, scoping and merging come from
//! `ward-engine`.

mod config;
mod db;
mod error;
mod handlers;
mod registry;
mod routes;

use crate::config::Config;
use crate::db::Pool;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ward_engine::{ChannelRouter, Schema};

/// How often lapsed sessions are swept.
const LAPSE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub schema: Arc<Schema>,
    pub router: Arc<ChannelRouter>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ward_server=debug,ward_engine=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Ward Server on {}:{}", config.host, config.port);

    // Create database pool
    let pool = db::create_pool(&config.database_url, config.max_connections).await?;

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    let schema = registry::ward_schema();
    let router = ChannelRouter::new(&schema);
    tracing::info!(
        schema_version = registry::SCHEMA_VERSION,
        types = schema.entities.len(),
        "registry loaded"
    );

    // Build application state
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        schema: Arc::new(schema),
        router: Arc::new(router),
    };

    tokio::spawn(sweep_lapsed_sessions(state.clone()));

    // Build router
    let app = Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Drop idle sessions and their staged rows on a fixed interval.
async fn sweep_lapsed_sessions(state: AppState) {
    let mut interval = tokio::time::interval(LAPSE_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let now = handlers::now_millis();
        if let Err(e) = handlers::expire_lapsed(&state.pool, &state.config.sync, now).await {
            tracing::warn!("lapsed session sweep failed: {}", e);
        }
    }
}
