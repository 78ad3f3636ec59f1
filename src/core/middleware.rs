//! HTTP middleware for request ids, request metrics and admin access logs.

use crate::api::auth::ANONYMOUS;
use crate::core::logging::{generate_request_id, REQUEST_ID};
use crate::core::metrics::get_metrics;
use axum::{
    extract::Request,
    http::{header, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Client model name attached to the response by the handlers.
#[derive(Clone, Debug)]
pub struct ModelName(pub String);

/// Provider id attached to the response by the handlers.
#[derive(Clone, Debug)]
pub struct ProviderName(pub String);

/// Authenticated client key name attached to the response by the handlers.
#[derive(Clone, Debug)]
pub struct ClientKeyName(pub String);

/// Assign a request id (honouring an incoming `x-request-id`), scope it as a
/// task-local for the handler and echo it on the response.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(request))
        .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Access log line for `/admin/v1/*`.
pub async fn admin_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        target: "admin",
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Admin request"
    );
    response
}

/// Labels the gateway handlers leave on a response.
struct RouteLabels<'a> {
    model: &'a str,
    provider: Option<&'a str>,
    client_key: &'a str,
}

impl<'a> RouteLabels<'a> {
    fn from_response(response: &'a Response) -> Self {
        let ext = response.extensions();
        Self {
            model: ext.get::<ModelName>().map_or("unknown", |m| m.0.as_str()),
            provider: ext.get::<ProviderName>().map(|p| p.0.as_str()),
            client_key: ext.get::<ClientKeyName>().map_or(ANONYMOUS, |k| k.0.as_str()),
        }
    }
}

/// Holds one slot of the active-requests gauge; released on drop so aborted
/// requests are not left counted.
struct ActiveRequest {
    gauge: prometheus::Gauge,
}

impl ActiveRequest {
    fn enter(endpoint: &str) -> Self {
        let gauge = get_metrics().active_requests.with_label_values(&[endpoint]);
        gauge.inc();
        Self { gauge }
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

/// Prometheus request metrics for the `/v1` routes.
pub struct MetricsMiddleware;

impl MetricsMiddleware {
    /// Only requests that reached a provider are counted; the rest are just logged.
    pub async fn track_metrics(request: Request, next: Next) -> Response {
        let endpoint = request.uri().path().to_string();
        let method = request.method().as_str().to_string();

        let active = ActiveRequest::enter(&endpoint);
        let started = Instant::now();
        let response = next.run(request).await;
        let elapsed = started.elapsed().as_secs_f64();
        drop(active);

        let status = response.status().as_u16();
        let labels = RouteLabels::from_response(&response);
        let Some(provider) = labels.provider else {
            tracing::info!(%method, endpoint, status, elapsed_s = elapsed, "Request finished");
            return response;
        };

        let metrics = get_metrics();
        metrics
            .request_count
            .with_label_values(&[
                &method,
                &endpoint,
                labels.model,
                provider,
                &status.to_string(),
                labels.client_key,
            ])
            .inc();
        metrics
            .request_duration
            .with_label_values(&[&method, &endpoint, labels.model, provider])
            .observe(elapsed);

        // SSE handlers return as soon as headers are ready.
        let timing = if is_event_stream(&response) { "ttfb" } else { "total" };
        tracing::info!(
            %method,
            endpoint,
            status,
            client_key = labels.client_key,
            model = labels.model,
            provider,
            timing,
            elapsed_s = elapsed,
            "Request finished"
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logging::get_request_id;
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
    use tower::ServiceExt;

    fn get_request(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn labelled() -> Response {
        let mut response = Response::new(Body::from("ok"));
        let ext = response.extensions_mut();
        ext.insert(ModelName("gpt-4o".into()));
        ext.insert(ProviderName("openai".into()));
        ext.insert(ClientKeyName("team-a".into()));
        response
    }

    #[tokio::test]
    async fn test_labelled_request_is_counted() {
        let metrics = get_metrics();
        let app = Router::new()
            .route("/test-labelled", get(|| async { labelled() }))
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

        let response = app.oneshot(get_request("/test-labelled")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let count = metrics
            .request_count
            .with_label_values(&["GET", "/test-labelled", "gpt-4o", "openai", "200", "team-a"])
            .get();
        assert_eq!(count, 1);
        let duration = metrics
            .request_duration
            .with_label_values(&["GET", "/test-labelled", "gpt-4o", "openai"]);
        assert_eq!(duration.get_sample_count(), 1);
    }

    #[tokio::test]
    async fn test_unlabelled_request_is_not_counted() {
        let metrics = get_metrics();
        let app = Router::new()
            .route("/test-plain", get(|| async { "ok" }))
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));
        app.oneshot(get_request("/test-plain")).await.unwrap();

        let duration = metrics
            .request_duration
            .with_label_values(&["GET", "/test-plain", "unknown", "unknown"]);
        assert_eq!(duration.get_sample_count(), 0);
    }

    #[tokio::test]
    async fn test_active_gauge_released_when_request_aborted() {
        let gauge = get_metrics()
            .active_requests
            .with_label_values(&["/test-aborted"]);
        let app = Router::new()
            .route("/test-aborted", get(|| std::future::pending::<&'static str>()))
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

        let handle = tokio::spawn(app.oneshot(get_request("/test-aborted")));
        while gauge.get() == 0.0 {
            tokio::task::yield_now().await;
        }
        handle.abort();
        let _ = handle.await;
        assert_eq!(gauge.get(), 0.0);
    }

    #[tokio::test]
    async fn test_request_id_is_scoped_and_echoed() {
        let app = Router::new()
            .route("/id", get(|| async { get_request_id() }))
            .layer(middleware::from_fn(request_id_middleware));

        let request = Request::builder()
            .uri("/id")
            .header(REQUEST_ID_HEADER, "req-123")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-123");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"req-123");

        let oversized = "x".repeat(200);
        let request = Request::builder()
            .uri("/id")
            .header(REQUEST_ID_HEADER, oversized.as_str())
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let echoed = response.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(!echoed.is_empty());
        assert_ne!(echoed, oversized);
    }

    #[tokio::test]
    async fn test_admin_logging_passes_response_through() {
        let app = Router::new()
            .route("/admin/v1/providers", get(|| async { StatusCode::ACCEPTED }))
            .layer(middleware::from_fn(admin_logging_middleware));
        let response = app.oneshot(get_request("/admin/v1/providers")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
