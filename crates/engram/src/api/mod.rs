//! HTTP API
//!
//! JSON routes over `MemoryService` for the conversational front-end. The
//! front-end never reaches the storage adapters directly.

pub mod handlers;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::{EngramError, Result};
use crate::service::MemoryService;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MemoryService>,
    /// Default `limit` for the recent-turns route
    pub recent_turns_limit: usize,
}

impl AppState {
    pub fn new(service: Arc<MemoryService>) -> Self {
        let recent_turns_limit = service.config().server.recent_turns_limit;
        Self {
            service,
            recent_turns_limit,
        }
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route(
            "/v1/conversations/{conversation_id}/turns",
            post(handlers::ingest_handler),
        )
        .route(
            "/v1/conversations/{conversation_id}/retrieve",
            post(handlers::retrieve_handler),
        )
        .route(
            "/v1/conversations/{conversation_id}/recent",
            get(handlers::recent_handler),
        )
        .route("/v1/memories/{id}", get(handlers::memory_handler))
        .route("/v1/stats", get(handlers::stats_handler))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `config.listen_addr` and serve until `shutdown` resolves
pub async fn serve(
    service: Arc<MemoryService>,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| EngramError::Config(format!("Invalid listen address: {e}")))?;

    let app = create_router(
        Arc::new(AppState::new(service)),
        Duration::from_secs(config.request_timeout_secs),
    );

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| EngramError::Fatal(format!("Failed to bind to {addr}: {e}")))?;
    tracing::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| EngramError::Fatal(format!("Server error: {e}")))?;

    tracing::info!("HTTP server shut down gracefully");
    Ok(())
}

/// `EngramError` rendered as a JSON error response
#[derive(Debug)]
pub struct ApiError(pub EngramError);

impl From<EngramError> for ApiError {
    fn from(error: EngramError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self.0 {
            EngramError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            EngramError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            EngramError::ContentRejected(_) => (StatusCode::UNPROCESSABLE_ENTITY, "content_rejected"),
            EngramError::ConsistencyConflict(_) => (StatusCode::CONFLICT, "consistency_conflict"),
            EngramError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            EngramError::TransientInfra(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }

        let body = serde_json::json!({
            "error": {
                "type": error_type,
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
