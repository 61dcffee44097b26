//! HTTP API layer.
//!
//! This module contains thin handlers that delegate to the orchestrator
//! and store. It provides router construction and server startup.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::api::auth::AuthPolicy;
use crate::lifecycle::Lifecycle;
use crate::metrics::Metrics;
use crate::session::Orchestrator;
use crate::state::Config;
use crate::store::SessionStore;

pub mod auth;
pub mod http;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the configured port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// This is a thin wrapper that holds references to services.
/// All business logic lives in the services themselves.
#[derive(Clone)]
pub struct AppState {
    /// Session/lease/idempotency store.
    pub store: Arc<dyn SessionStore>,
    /// Intake, admission and worker registry.
    pub orchestrator: Arc<Orchestrator>,
    /// Running/draining flag.
    pub lifecycle: Arc<Lifecycle>,
    /// Bearer-token policy (snapshot; auth changes need a restart).
    pub auth: Arc<AuthPolicy>,
    /// HLS root (snapshot; kept off the config lock for the serving path).
    pub hls_root: PathBuf,
    /// Application configuration.
    pub config: Arc<RwLock<Config>>,
    /// Counter/histogram registry.
    pub metrics: Arc<Metrics>,
}

/// Starts the HTTP server on the configured port.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let port = state.config.read().preferred_port;
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Server listening on http://0.0.0.0:{}", port);

    let app = http::create_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}
