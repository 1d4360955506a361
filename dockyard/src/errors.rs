//! Error types for the dockyard engine

use thiserror::Error;

/// Main error type for the deployment engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    DbError(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Project {0} is already building")]
    AlreadyBuilding(i64),

    #[error("Invalid rollback: {0}")]
    InvalidRollback(String),

    /// Deliberately says nothing about whether the token exists.
    #[error("Webhook not accepted")]
    WebhookRejected,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Fetch error: {0}")]
    FetchError(String),

    #[error("Build error: {0}")]
    BuildError(String),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Reverse proxy error: {0}")]
    ProxyError(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Internal(format!("background task failed: {}", err))
    }
}

impl EngineError {
    /// HTTP status an API caller sees for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            EngineError::NotFound(_) | EngineError::WebhookRejected => StatusCode::NOT_FOUND,
            EngineError::AlreadyBuilding(_) => StatusCode::CONFLICT,
            EngineError::InvalidRollback(_) | EngineError::ValidationError(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, axum::Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}
