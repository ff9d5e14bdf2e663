//! Tally Server - sync server for offline-first ledgers.
//!
//! Hosts the tally-engine Reconciler behind HTTP: devices push batches of
//! offline operations to `POST /sync` and pull incremental changes from
//! `GET /sync/changes`. The Record Store is PostgreSQL in production or an
//! in-memory store for development.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
mod routes;

use crate::config::Config;
use axum::Router;
use std::sync::Arc;
use tally_engine::{RecordStore, Reconciler};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Reconciler<dyn RecordStore>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>, config: Config) -> Self {
        Self {
            reconciler: Reconciler::new(store),
            config: Arc::new(config),
        }
    }
}

/// Build the router with tracing and CORS layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state)
}
