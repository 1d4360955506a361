//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::EngineError;
use crate::server::handlers::{
    build_handler, create_project_handler, delete_project_handler, deployments_handler,
    get_project_handler, health_handler, list_projects_handler, logs_handler,
    regenerate_token_handler, rollback_handler, start_handler, stop_handler,
    stream_logs_handler, update_project_handler, version_handler, webhook_handler,
};
use crate::server::state::ServerState;

/// All routes, with state and middleware attached
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Projects
        .route(
            "/api/projects",
            get(list_projects_handler).post(create_project_handler),
        )
        .route(
            "/api/projects/{id}",
            get(get_project_handler)
                .patch(update_project_handler)
                .delete(delete_project_handler),
        )
        .route("/api/projects/{id}/webhook-token", post(regenerate_token_handler))
        // Lifecycle
        .route("/api/projects/{id}/build", post(build_handler))
        .route("/api/projects/{id}/start", post(start_handler))
        .route("/api/projects/{id}/stop", post(stop_handler))
        .route("/api/projects/{id}/rollback", post(rollback_handler))
        .route("/api/projects/{id}/deployments", get(deployments_handler))
        // Logs
        .route("/api/projects/{id}/logs", get(logs_handler))
        .route("/api/projects/{id}/logs/stream", get(stream_logs_handler))
        // Public
        .route("/webhook/{token}", post(webhook_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), EngineError>>, EngineError> {
    let app = build_router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::ServerError(format!("{}: {}", addr, e)))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| EngineError::ServerError(e.to_string()))
    });

    Ok(handle)
}
