use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::routing::router::FilterStage;

/// Error kinds surfaced at the core boundary. Everything an adapter can
/// observe from routing, admission or the datapath collapses into one of
/// these; adapters map them to HTTP statuses or in-band stream frames.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no backend supports model '{0}'")]
    ModelNotFound(String),

    #[error("target backend '{0}' is not registered")]
    TargetNotFound(String),

    #[error("no available backends (last filter: {filter})")]
    NoAvailableBackends { filter: FilterStage },

    #[error("backend '{backend_id}' failed: {message}")]
    Backend { backend_id: String, message: String },

    #[error("backend deadline expired")]
    BackendTimeout,

    /// The client could not keep up with the stream. `code` is either
    /// `client_too_slow` (backpressure push timed out) or
    /// `client_write_timeout` (a single frame write exceeded its deadline).
    #[error("client too slow ({code})")]
    ClientTooSlow { code: &'static str },

    #[error("request cancelled by client")]
    Cancelled,

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl ProxyError {
    /// OpenAI-style error `type` field.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::ModelNotFound(_) | Self::TargetNotFound(_) => {
                "invalid_request_error"
            }
            _ => "server_error",
        }
    }

    /// Short machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::ModelNotFound(_) => "model_not_found",
            Self::TargetNotFound(_) => "target_not_found",
            Self::NoAvailableBackends { .. } => "no_available_backends",
            Self::Backend { .. } => "backend_error",
            Self::BackendTimeout => "backend_timeout",
            Self::ClientTooSlow { code } => code,
            Self::Cancelled => "cancelled",
            Self::RateLimited(_) => "rate_limited",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::ModelNotFound(_) | Self::TargetNotFound(_) => StatusCode::NOT_FOUND,
            Self::NoAvailableBackends { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Cancelled => StatusCode::BAD_REQUEST,
            Self::Backend { .. }
            | Self::BackendTimeout
            | Self::ClientTooSlow { .. }
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI-shaped error body: `{"error":{"message","type","code"}}`.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.code(),
            }
        })
    }

    /// In-band stream error frame payload, emitted after headers are flushed.
    pub fn stream_frame(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": "stream_error",
                "code": self.code(),
            }
        })
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Internal(_)) {
            tracing::error!(error = %self, "Internal error");
        }
        (self.status(), Json(self.body())).into_response()
    }
}
