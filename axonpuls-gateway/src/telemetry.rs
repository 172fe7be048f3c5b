use std::time::Instant;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use axum::Extension;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use crate::request::RequestId;

/// Initializes the global tracing subscriber. `AXONPULS_LOG_FORMAT=json`
/// selects structured output for production deployments; anything else
/// (including unset) uses the human-readable format for local runs.
pub fn setup_tracing(log_format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if log_format == "json" {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().pretty().with_env_filter(filter).init();
    }
}

/// Stamps the request id onto the current span so every log line emitted
/// while handling a request or WebSocket connection carries it.
pub async fn enrich_span(Extension(request_id): Extension<RequestId>, request: Request, next: Next) -> Result<Response, StatusCode> {
    let span = tracing::Span::current();
    span.record("request_id", request_id.0.as_str());
    Ok(next.run(request).await)
}

/// Logs entry and processing time for every HTTP request.
pub async fn log_request(request: Request, next: Next) -> Result<Response, StatusCode> {
    let start = Instant::now();
    let response = next.run(request).await;
    let millis = start.elapsed().as_micros() as f64 / 1000.0;
    info!(status_code = response.status().as_u16(), duration_ms = millis, "request processed");
    Ok(response)
}
