//! Tally Server binary.

use std::sync::Arc;
use tally_engine::{MemoryRecordStore, RecordStore};
use tally_server::config::{Config, StoreConfig};
use tally_server::db::{self, PgRecordStore};
use tally_server::{app, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_server=debug,tally_engine=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        "Starting Tally Server on {}:{} ({} store)",
        config.host,
        config.port,
        config.store.name()
    );

    let store: Arc<dyn RecordStore> = match &config.store {
        StoreConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let pool = db::create_pool(database_url, *max_connections).await?;

            tracing::info!("Running database migrations...");
            db::run_migrations(&pool).await?;

            Arc::new(PgRecordStore::new(pool))
        }
        StoreConfig::Memory => {
            tracing::warn!("Using the in-memory store; records are lost on shutdown");
            Arc::new(MemoryRecordStore::new())
        }
    };

    let addr = format!("{}:{}", config.host, config.port);
    let app = app(AppState::new(store, config));

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
