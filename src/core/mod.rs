//! Core functionality for the gateway.
//!
//! This module contains fundamental components used throughout the application:
//! configuration, errors, logging, metrics, per-key rate limits and HTTP
//! middleware.

pub mod cancel;
pub mod config;
pub mod error;
pub mod log_file;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;

// Re-export commonly used types
pub use cancel::CancelGuard;
pub use config::{ClientKeyConfig, GatewayConfig, KeyConfig, ProviderConfig, ServerConfig};
pub use error::{AppError, Result};
pub use logging::{get_provider_context, init_logging, PROVIDER_CONTEXT};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::MetricsMiddleware;
pub use rate_limiter::KeyRateLimiter;
