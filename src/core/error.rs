//! Error types and handling for the gateway.
//!
//! This module provides a unified error type [`AppError`] that wraps the store
//! and provider error types and implements HTTP response conversion with an
//! OpenAI-shaped error body.

use crate::providers::ProviderError;
use crate::services::{ResolveError, SelectError};
use crate::store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_PERMISSION: &str = "permission_error";
pub const ERROR_TYPE_NOT_FOUND: &str = "not_found_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_UPSTREAM: &str = "upstream_error";
pub const ERROR_TYPE_UNAVAILABLE: &str = "service_unavailable";

/// Main error type for the application.
///
/// All errors in the request path are converted to this type for consistent handling.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors (file not found, parse errors, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unauthorized")]
    Unauthorized,

    /// Authenticated but not allowed (e.g. model outside the client's allow-list)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Client model name could not be resolved to a provider
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Capability not offered by the selected provider
    #[error("{0}")]
    Unsupported(String),

    /// Selector or adapter found no usable key
    #[error("No API key available: {0}")]
    NoKeyAvailable(String),

    /// Provider resolved but no adapter is registered for it
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Upstream returned an error or a malformed body
    #[error("{0}")]
    Upstream(String),

    /// Upstream could not be reached
    #[error("{0}")]
    UpstreamUnavailable(String),

    #[error("Gateway timeout")]
    Timeout,

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Usage store error: {0}")]
    Store(#[from] StoreError),

    /// Client disconnected before request completed
    #[error("Client closed request")]
    ClientDisconnect,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) | AppError::Unsupported(_) => StatusCode::BAD_REQUEST,
            AppError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            AppError::NoKeyAvailable(_) | AppError::ProviderUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // HTTP 408 rather than nginx's non-standard 499
            AppError::ClientDisconnect => StatusCode::REQUEST_TIMEOUT,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) | AppError::Unsupported(_) => ERROR_TYPE_INVALID_REQUEST,
            AppError::Unauthorized => ERROR_TYPE_AUTHENTICATION,
            AppError::Forbidden(_) => ERROR_TYPE_PERMISSION,
            AppError::ModelNotFound(_) => ERROR_TYPE_NOT_FOUND,
            AppError::RateLimitExceeded(_) => ERROR_TYPE_RATE_LIMIT,
            AppError::Upstream(_) | AppError::UpstreamUnavailable(_) | AppError::Timeout => {
                ERROR_TYPE_UPSTREAM
            }
            AppError::NoKeyAvailable(_) | AppError::ProviderUnavailable(_) => {
                ERROR_TYPE_UNAVAILABLE
            }
            _ => ERROR_TYPE_API,
        }
    }

    /// Whether the failure should count against the key's `errors` counter.
    pub fn counts_as_upstream_error(&self) -> bool {
        matches!(
            self,
            AppError::Upstream(_)
                | AppError::UpstreamUnavailable(_)
                | AppError::Timeout
                | AppError::ClientDisconnect
        )
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NoKeyAvailable(msg) => AppError::NoKeyAvailable(msg),
            ProviderError::Unsupported { .. } => AppError::Unsupported(err.to_string()),
            ProviderError::InvalidRequest(msg) => AppError::BadRequest(msg),
            ProviderError::Timeout(_) => AppError::Timeout,
            ProviderError::Transport(_) => AppError::UpstreamUnavailable(err.to_string()),
            ProviderError::Exhausted { ref last, .. } if last.is_transport() => {
                AppError::UpstreamUnavailable(err.to_string())
            }
            other => AppError::Upstream(other.to_string()),
        }
    }
}

impl From<ResolveError> for AppError {
    fn from(err: ResolveError) -> Self {
        AppError::ModelNotFound(err.to_string())
    }
}

impl From<SelectError> for AppError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::Resolve(e) => e.into(),
            SelectError::NoKeyAvailable(provider) => AppError::NoKeyAvailable(provider),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type();

        if let AppError::ClientDisconnect = self {
            tracing::info!("Client disconnected before request completed");
        } else if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(AppError::Unauthorized.to_string(), "Unauthorized");
        assert_eq!(
            AppError::Internal("test error".to_string()).to_string(),
            "Internal server error: test error"
        );
        assert_eq!(AppError::Timeout.to_string(), "Gateway timeout");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::ModelNotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::NoKeyAvailable("p".into()).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Unsupported("no".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Upstream("boom".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::UpstreamUnavailable("down".into())
                .into_response()
                .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::ClientDisconnect.into_response().status(),
            StatusCode::REQUEST_TIMEOUT
        );
    }

    #[test]
    fn test_provider_error_conversion() {
        let err: AppError = ProviderError::Unsupported {
            provider: "grok".into(),
            capability: "embeddings",
        }
        .into();
        assert!(matches!(err, AppError::Unsupported(_)));
        assert!(!err.counts_as_upstream_error());

        let err: AppError = ProviderError::NoKeyAvailable("openai".into()).into();
        assert!(matches!(err, AppError::NoKeyAvailable(_)));

        let err: AppError = ProviderError::Exhausted {
            provider: "openai".into(),
            attempts: 3,
            last: Box::new(ProviderError::Transport("connection refused".into())),
        }
        .into();
        assert!(matches!(err, AppError::UpstreamUnavailable(_)));

        let err: AppError = ProviderError::Exhausted {
            provider: "openai".into(),
            attempts: 3,
            last: Box::new(ProviderError::Http {
                status: 500,
                message: "overloaded".into(),
            }),
        }
        .into();
        assert!(matches!(err, AppError::Upstream(_)));
        assert!(err.to_string().contains("openai API error after 3 attempts"));
        assert!(err.counts_as_upstream_error());
    }

    #[test]
    fn test_selection_error_conversion() {
        let err: AppError = SelectError::Resolve(ResolveError::UnknownProvider {
            model: "x".into(),
            provider: "ghost".into(),
        })
        .into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: AppError = SelectError::NoKeyAvailable("openai".into()).into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = AppError::BadRequest("input must not be empty".into()).into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], ERROR_TYPE_INVALID_REQUEST);
        assert_eq!(json["error"]["code"], 400);
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("input must not be empty"));
    }
}
