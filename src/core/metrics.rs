//! Prometheus metrics for monitoring the gateway.
//!
//! This module provides a centralized metrics registry with the counters,
//! gauges and histograms the request pipeline, adapters, selector and
//! usage store report into. With the `process` feature the default registry
//! also exposes standard process metrics.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of requests by method, endpoint, model, provider, status and client key
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Number of currently active requests by endpoint
    pub active_requests: GaugeVec,

    /// Total token usage by provider, upstream key and token type
    pub token_usage: IntCounterVec,

    /// Upstream calls by provider and outcome (success, retry, failed)
    pub upstream_attempts: IntCounterVec,

    /// Upstream response latency histogram in seconds
    pub provider_latency: HistogramVec,

    /// Keys handed out by the selector
    pub key_selections: IntCounterVec,

    /// Usage store failures by backend and operation
    pub store_errors: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// Safe to call repeatedly; every call returns the same instance.
///
/// # Examples
///
/// ```no_run
/// use llm_gateway::core::metrics::init_metrics;
///
/// let metrics = init_metrics();
/// metrics.request_count.with_label_values(&["GET", "/health", "-", "-", "200", "-"]).inc();
/// ```
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "llm_gateway_requests_total",
            "Total number of requests",
            &["method", "endpoint", "model", "provider", "status_code", "client_key"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "llm_gateway_request_duration_seconds",
            "Request duration in seconds",
            &["method", "endpoint", "model", "provider"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge_vec!(
            "llm_gateway_active_requests",
            "Number of active requests",
            &["endpoint"]
        )
        .expect("Failed to register active_requests metric");

        let token_usage = register_int_counter_vec!(
            "llm_gateway_tokens_total",
            "Total number of tokens used",
            &["provider", "key", "token_type"]
        )
        .expect("Failed to register token_usage metric");

        let upstream_attempts = register_int_counter_vec!(
            "llm_gateway_upstream_attempts_total",
            "Upstream calls by outcome",
            &["provider", "outcome"]
        )
        .expect("Failed to register upstream_attempts metric");

        let provider_latency = register_histogram_vec!(
            "llm_gateway_provider_latency_seconds",
            "Upstream response latency in seconds",
            &["provider"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
        )
        .expect("Failed to register provider_latency metric");

        let key_selections = register_int_counter_vec!(
            "llm_gateway_key_selections_total",
            "Upstream keys chosen by the selector",
            &["provider", "key", "strategy"]
        )
        .expect("Failed to register key_selections metric");

        let store_errors = register_int_counter_vec!(
            "llm_gateway_store_errors_total",
            "Usage store operation failures",
            &["backend", "op"]
        )
        .expect("Failed to register store_errors metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            token_usage,
            upstream_attempts,
            provider_latency,
            key_selections,
            store_errors,
        }
    })
}

/// Get the global metrics instance, initializing it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let metrics = init_metrics();
        let metrics2 = get_metrics();
        assert!(std::ptr::eq(metrics, metrics2));
    }

    #[test]
    fn test_request_count_metric() {
        let metrics = init_metrics();
        let labels = [
            "POST",
            "/v1/chat/completions",
            "gpt-unique",
            "openai-unique",
            "201",
            "client-unique",
        ];

        let initial = metrics.request_count.with_label_values(&labels).get();
        metrics.request_count.with_label_values(&labels).inc();
        assert_eq!(
            metrics.request_count.with_label_values(&labels).get(),
            initial + 1
        );
    }

    #[test]
    fn test_active_requests_metric() {
        let metrics = init_metrics();
        let gauge = metrics.active_requests.with_label_values(&["/v1/test-active"]);

        let initial = gauge.get();
        gauge.inc();
        assert_eq!(gauge.get(), initial + 1.0);
        gauge.dec();
        assert_eq!(gauge.get(), initial);
    }

    #[test]
    fn test_token_usage_metric() {
        let metrics = init_metrics();
        let counter = metrics
            .token_usage
            .with_label_values(&["openai-tokens", "k1", "input"]);

        let initial = counter.get();
        counter.inc_by(100);
        assert_eq!(counter.get(), initial + 100);
    }

    #[test]
    fn test_upstream_attempt_outcomes_are_separate() {
        let metrics = init_metrics();
        metrics
            .upstream_attempts
            .with_label_values(&["attempts-test", "retry"])
            .inc_by(2);
        metrics
            .upstream_attempts
            .with_label_values(&["attempts-test", "success"])
            .inc();

        assert!(
            metrics
                .upstream_attempts
                .with_label_values(&["attempts-test", "retry"])
                .get()
                >= 2
        );
        assert!(
            metrics
                .upstream_attempts
                .with_label_values(&["attempts-test", "success"])
                .get()
                >= 1
        );
    }

    #[test]
    fn test_provider_latency_metric() {
        let metrics = init_metrics();
        let histogram = metrics.provider_latency.with_label_values(&["latency-test"]);
        histogram.observe(0.5);
        histogram.observe(1.2);
        assert!(histogram.get_sample_count() >= 2);
    }
}
