use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TemoaError {
    #[error("Vault not found: {0}")]
    VaultNotFound(String),

    #[error("Vault read error: {0}")]
    VaultRead(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Invalid request: {0}")]
    Config(String),

    #[error("Deadline exceeded in {0}")]
    Timeout(String),

    #[error("Too many requests: {0}")]
    RateLimited(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for TemoaError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            TemoaError::VaultNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            TemoaError::VaultRead(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            TemoaError::Index(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            TemoaError::Search(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            TemoaError::Config(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            TemoaError::Timeout(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            TemoaError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            TemoaError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            TemoaError::Serde(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            TemoaError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

pub type TemoaResult<T> = Result<T, TemoaError>;
