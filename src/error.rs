//! Error types for chainlb

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("Chain already exists: {0}")]
    ChainExists(String),

    #[error("No available endpoint for {0}")]
    NoAvailableEndpoint(String),

    #[error("Invalid schedule expression: {0}")]
    InvalidSchedule(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Upstream(_) | Error::Http(_))
    }
}

/// Proxy-specific errors for HTTP handlers
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("Chain already exists: {0}")]
    ChainExists(String),

    #[error("No available endpoint: {0}")]
    NoAvailableEndpoint(String),

    #[error("All upstream attempts failed (last host: {last_host})")]
    UpstreamExhausted { last_host: String, category: String },

    #[error("Service degraded, no chain data available")]
    Degraded,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ProxyError::InvalidRequest(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_request", "message": msg }),
            ),
            ProxyError::UnknownChain(name) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "unknown_chain", "chain": name }),
            ),
            ProxyError::ChainExists(name) => (
                StatusCode::CONFLICT,
                json!({ "error": "chain_exists", "chain": name }),
            ),
            ProxyError::NoAvailableEndpoint(chain) => (
                StatusCode::BAD_GATEWAY,
                json!({ "error": "no_available_endpoint", "chain": chain }),
            ),
            ProxyError::UpstreamExhausted { last_host, category } => (
                StatusCode::BAD_GATEWAY,
                json!({
                    "error": "upstream_exhausted",
                    "last_host": last_host,
                    "category": category,
                }),
            ),
            ProxyError::Degraded => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "degraded" }),
            ),
            ProxyError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "internal", "message": msg }),
            ),
            ProxyError::Json(err) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_json", "message": err.to_string() }),
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl From<Error> for ProxyError {
    fn from(err: Error) -> Self {
        match err {
            Error::UnknownChain(name) => ProxyError::UnknownChain(name),
            Error::ChainExists(name) => ProxyError::ChainExists(name),
            Error::NoAvailableEndpoint(chain) => ProxyError::NoAvailableEndpoint(chain),
            other => ProxyError::Internal(other.to_string()),
        }
    }
}
